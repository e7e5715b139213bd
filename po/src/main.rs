use anyhow::{Context, Result, bail};
use clap::Parser;
use flame_common::shutdown::shutdown_signal;
use owo_colors::OwoColorize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

mod args;
mod cleanup;
mod cluster;
mod compose;
mod db;
mod handlers;
mod hub;
mod keycloak;
mod kong;
mod models;
mod reconcile;
mod server;

use args::{Cli, Commands, ServerArgs};
use cluster::Cluster;
use compose::Orchestrator;
use handlers::AppState;
use keycloak::Keycloak;
use kong::Kong;

#[tokio::main]
async fn main() -> Result<()> {
    flame_common::init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Server(args) => run_supervisor(args).await,
        Commands::Health(args) => run_health(args.endpoint).await,
    }
}

/// Open the collaborators, then run the API listener and the
/// reconciler loop for the lifetime of the process. Either task ending
/// takes the whole supervisor down (and flips the liveness flag).
async fn run_supervisor(args: ServerArgs) -> Result<()> {
    let pool = flame_common::postgres::create_pool(args.postgres.clone()).await;
    db::init_schema(&pool)
        .await
        .context("failed to initialize database schema")?;

    let cluster = Cluster::connect()
        .await
        .context("failed to connect to cluster API")?;
    println!(
        "{}{}",
        "⚙️ Managing namespace ".green(),
        cluster.namespace().green().dimmed(),
    );

    let orch = Orchestrator {
        pool,
        cluster,
        keycloak: Keycloak::new(&args.keycloak),
        kong: Kong::new(&args.kong),
        hub: args.hub.clone(),
    };

    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        cancel_clone.cancel();
    });

    let (alive_tx, alive_rx) = watch::channel(true);

    let cancel_clone = cancel.clone();
    let reconciler_orch = orch.clone();
    let interval = args.status_loop_interval;
    let mut reconciler_join = Box::pin(tokio::spawn(async move {
        reconcile::run(reconciler_orch, interval, cancel_clone).await;
    }));

    let cancel_clone = cancel.clone();
    let state = AppState {
        orch,
        alive: alive_rx,
    };
    let mut server_join = Box::pin(tokio::spawn(async move {
        server::run_server(cancel_clone, args.port, args.keycloak, state).await
    }));

    tokio::select! {
        res = &mut reconciler_join => {
            let _ = alive_tx.send(false);
            cancel.cancel();
            server_join
                .await
                .context("Failed to join server task")?
                .context("Server task failed")?;
            res.context("Failed to join reconciler task")?;
        }
        res = &mut server_join => {
            let _ = alive_tx.send(false);
            cancel.cancel();
            reconciler_join
                .await
                .context("Failed to join reconciler task")?;
            res.context("Failed to join server task")?.context("Server task failed")?;
        }
    }
    println!("{}", "🛑 Pod orchestrator shut down gracefully.".red());
    Ok(())
}

async fn run_health(endpoint: String) -> Result<()> {
    let url = format!("{}/po/healthz", endpoint.trim_end_matches('/'));
    let resp = reqwest::get(&url)
        .await
        .context("failed to send health request")?;
    if resp.status().is_success() {
        println!("{}", "ok".green());
        Ok(())
    } else {
        bail!("health check failed with status: {}", resp.status())
    }
}
