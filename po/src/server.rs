use anyhow::{Context, Result};
use axum::{
    Router,
    middleware,
    routing::{delete, get, post, put},
};
use axum_keycloak_auth::{
    PassthroughMode,
    instance::{KeycloakAuthInstance, KeycloakConfig},
    layer::KeycloakAuthLayer,
};
use flame_common::{access_log, args::KeycloakArgs, cors};
use owo_colors::OwoColorize;
use reqwest::Url;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::handlers::{self, AppState};

const CORS_ORIGINS: &[&str] = &["http://localhost:8080"];

/// Run the orchestrator HTTP surface. Everything under `/po` except
/// the liveness endpoint and the sidecar log ingest requires a valid
/// bearer token from the node auth server.
pub async fn run_server(
    cancel: CancellationToken,
    port: u16,
    kc: KeycloakArgs,
    state: AppState,
) -> Result<()> {
    let keycloak_auth_instance = KeycloakAuthInstance::new(
        KeycloakConfig::builder()
            .server(Url::parse(&kc.keycloak_url).context("invalid KEYCLOAK_URL")?)
            .realm(kc.keycloak_realm)
            .build(),
    );
    let keycloak_layer = KeycloakAuthLayer::<String>::builder()
        .instance(keycloak_auth_instance)
        .passthrough_mode(PassthroughMode::Block)
        .persist_raw_claims(true)
        .expected_audiences(vec![])
        .build();

    let public = Router::new()
        .route("/po/healthz", get(handlers::health))
        .route("/po/stream_logs", post(handlers::stream_logs))
        .with_state(state.clone());
    let protected = Router::new()
        .route("/", post(handlers::create_analysis))
        .route("/history", get(handlers::retrieve_history_all))
        .route("/history/{analysis_id}", get(handlers::retrieve_history_one))
        .route("/logs", get(handlers::retrieve_logs_all))
        .route("/logs/{analysis_id}", get(handlers::retrieve_logs_one))
        .route("/status", get(handlers::get_status_all))
        .route("/status/{analysis_id}", get(handlers::get_status_one))
        .route("/pods", get(handlers::get_pods_all))
        .route("/pods/{analysis_id}", get(handlers::get_pods_one))
        .route("/stop", put(handlers::stop_all))
        .route("/stop/{analysis_id}", put(handlers::stop_one))
        .route("/delete", delete(handlers::delete_all))
        .route("/delete/{analysis_id}", delete(handlers::delete_one))
        .route("/cleanup/{cleanup_type}", delete(handlers::run_cleanup))
        .layer(keycloak_layer)
        .with_state(state);
    let app = Router::new()
        .nest("/po", protected)
        .merge(public)
        .layer(cors::for_origins(CORS_ORIGINS))
        .layer(middleware::from_fn(access_log::public));

    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| {
            eprintln!(
                "{}",
                format!("❌ Failed to bind server to {}: {}", addr, e).red()
            );
            e
        })
        .context("Failed to bind server")?;
    println!(
        "{}{}",
        "🚀 Starting pod orchestrator API • port=".green(),
        format!("{}", port).green().dimmed()
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            cancel.cancelled().await;
        })
        .await
        .context("Failed to start server")?;
    println!("{}", "🛑 API server stopped gracefully.".red());
    Ok(())
}
