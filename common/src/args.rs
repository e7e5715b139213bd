use clap::Parser;

#[derive(Parser, Debug, Clone)]
pub struct PostgresArgs {
    #[arg(long, env = "POSTGRES_HOST", default_value = "postgresql-service")]
    pub postgres_host: String,

    #[arg(long, env = "POSTGRES_PORT", default_value_t = 5432)]
    pub postgres_port: u16,

    #[arg(long, env = "POSTGRES_DB", default_value = "postgres")]
    pub postgres_db: String,

    #[arg(long, env = "POSTGRES_USER", default_value = "postgres")]
    pub postgres_user: String,

    #[arg(long, env = "POSTGRES_PASSWORD")]
    pub postgres_password: Option<String>,

    /// Optional CA bundle (PEM) for TLS connections to Postgres
    #[arg(long, env = "POSTGRES_CA_CERT")]
    pub postgres_ca_cert: Option<String>,
}

#[derive(Parser, Debug, Clone)]
pub struct KeycloakArgs {
    /// Base URL of the node auth server, e.g. http://flame-node-keycloak-service:8080
    #[arg(long, env = "KEYCLOAK_URL", required = true)]
    pub keycloak_url: String,

    #[arg(long, env = "KEYCLOAK_REALM", default_value = "flame")]
    pub keycloak_realm: String,

    /// Client-credentials client with realm-management service roles
    #[arg(long, env = "RESULT_CLIENT_ID", required = true)]
    pub admin_client_id: String,

    #[arg(long, env = "RESULT_CLIENT_SECRET", required = true)]
    pub admin_client_secret: String,
}

#[derive(Parser, Debug, Clone)]
pub struct HubArgs {
    /// Robot account identifying this node at the hub
    #[arg(long, env = "HUB_ROBOT_USER", required = true)]
    pub robot_id: String,

    #[arg(long, env = "HUB_ROBOT_SECRET", required = true)]
    pub robot_secret: String,

    #[arg(long, env = "HUB_URL_CORE", required = true)]
    pub core_url: String,

    #[arg(long, env = "HUB_URL_AUTH", required = true)]
    pub auth_url: String,

    #[arg(long, env = "PO_HTTP_PROXY")]
    pub http_proxy: Option<String>,

    #[arg(long, env = "PO_HTTPS_PROXY")]
    pub https_proxy: Option<String>,

    /// Path to an extra CA bundle (PEM) trusted for outbound TLS
    #[arg(long, env = "EXTRA_CA_CERTS")]
    pub extra_ca_certs: Option<String>,
}

#[derive(Parser, Debug, Clone)]
pub struct KongArgs {
    /// Admin API of the node API gateway
    #[arg(
        long,
        env = "KONG_ADMIN_URL",
        default_value = "http://flame-node-kong-admin"
    )]
    pub kong_admin_url: String,
}
