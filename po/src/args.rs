use clap::{Parser, Subcommand};
use flame_common::args::{HubArgs, KeycloakArgs, KongArgs, PostgresArgs};

#[derive(Parser, Debug)]
#[command(name = "flame-po")]
#[command(about = "FLAME node pod orchestrator")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the orchestrator (API surface + reconciler loop)
    Server(ServerArgs),

    /// Check orchestrator health
    Health(HealthArgs),
}

#[derive(Parser, Debug, Clone)]
pub struct ServerArgs {
    /// Port the API listens on
    #[arg(long, env = "PORT", default_value_t = 8000)]
    pub port: u16,

    /// Seconds between reconciler ticks
    #[arg(long, env = "STATUS_LOOP_INTERVAL", default_value_t = 10)]
    pub status_loop_interval: u64,

    #[clap(flatten)]
    pub postgres: PostgresArgs,

    #[clap(flatten)]
    pub keycloak: KeycloakArgs,

    #[clap(flatten)]
    pub hub: HubArgs,

    #[clap(flatten)]
    pub kong: KongArgs,
}

#[derive(Parser, Debug, Clone)]
pub struct HealthArgs {
    /// Orchestrator endpoint
    #[arg(long, env = "PO_ENDPOINT", default_value = "http://localhost:8000")]
    pub endpoint: String,
}
