use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use flame_common::response::{print_error, print_warning};
use owo_colors::OwoColorize;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::cluster::NGINX_PORT;
use crate::compose::Orchestrator;
use crate::db;
use crate::hub::HubClient;
use crate::models::{
    Analysis, AnalysisStatus, MAX_RESTARTS, StartupFailure, UpdateGeneration, startup_error_log,
};

/// Hard deadline for one internal status probe.
pub const INTERNAL_STATUS_TIMEOUT: Duration = Duration::from_secs(10);

const PROBE_RETRY_INTERVAL: Duration = Duration::from_secs(1);
const RELAUNCH_SETTLE: Duration = Duration::from_secs(1);

/// What the reconciler does about one `(db, internal)` status pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Mark failed and recover (restart or pod-level reset).
    Unstuck,
    /// The analysis came up; persist `running`.
    PromoteRunning,
    /// The analysis ended; persist the internal status and tear down.
    Finalize,
    /// Nothing to change; still report to the hub.
    None,
}

/// The single place the two status sources are reconciled. Rows match
/// first to last; an internal `stuck` always wins, which also means
/// the `failed`/`stuck` pair never reaches its finalize row.
pub fn decide(db_status: AnalysisStatus, int_status: AnalysisStatus) -> Action {
    use crate::models::AnalysisStatus::*;

    let is_stuck = int_status == Stuck;
    let is_slow = db_status == Started && int_status == Failed;
    let newly_running = db_status == Started && int_status == Running;
    let speedy_finished = db_status == Started && int_status == Finished;
    let newly_ended =
        matches!(db_status, Running | Failed) && matches!(int_status, Finished | Failed);
    let firmly_stuck = db_status == Failed && int_status == Stuck;

    if is_stuck || is_slow {
        Action::Unstuck
    } else if newly_running {
        Action::PromoteRunning
    } else if speedy_finished || newly_ended || firmly_stuck {
        Action::Finalize
    } else {
        Action::None
    }
}

/// Status reported to the hub after the tick's action settled.
pub fn hub_status(db_status: AnalysisStatus, int_status: AnalysisStatus) -> AnalysisStatus {
    use crate::models::AnalysisStatus::*;

    if matches!(db_status, Failed | Finished) {
        db_status
    } else if matches!(int_status, Failed | Finished | Running) {
        int_status
    } else {
        db_status
    }
}

#[derive(Debug, Clone)]
struct ResolvedStatus {
    generation: Analysis,
    db: AnalysisStatus,
    int: AnalysisStatus,
}

#[derive(Deserialize)]
struct SidecarHealth {
    status: String,
    #[serde(default)]
    token_remaining_time: i64,
}

/// Probe `GET http://nginx-<name>/analysis/healthz` until the deadline,
/// refresh the analysis token if it is about to lapse, and map the
/// self-reported status. An unreachable sidecar is a failure.
async fn probe_internal(
    orch: &Orchestrator,
    http: &reqwest::Client,
    deployment_name: &str,
    analysis_id: &str,
    interval_secs: u64,
) -> AnalysisStatus {
    let base = format!("http://nginx-{}:{}", deployment_name, NGINX_PORT);
    let start = tokio::time::Instant::now();
    let health: SidecarHealth = loop {
        let attempt = async {
            let res = http
                .get(format!("{}/analysis/healthz", base))
                .header("Connection", "close")
                .send()
                .await?;
            res.error_for_status()?.json::<SidecarHealth>().await
        }
        .await;
        match attempt {
            Ok(health) => break health,
            Err(e) => {
                println!(
                    "\t{}{}",
                    "Error whilst retrieving internal deployment status: ".dimmed(),
                    e.to_string().dimmed(),
                );
            }
        }
        tokio::time::sleep(PROBE_RETRY_INTERVAL).await;
        if start.elapsed() > INTERNAL_STATUS_TIMEOUT {
            println!(
                "\tTimeout getting internal deployment status after {:?}",
                start.elapsed(),
            );
            return AnalysisStatus::Failed;
        }
    };

    if health.token_remaining_time < (interval_secs as i64) * 2 + 1 {
        refresh_analysis_token(orch, http, &base, deployment_name, analysis_id).await;
    }

    match health.status.parse::<AnalysisStatus>() {
        Ok(AnalysisStatus::Finished) => AnalysisStatus::Finished,
        Ok(AnalysisStatus::Running) => AnalysisStatus::Running,
        Ok(AnalysisStatus::Stuck) => AnalysisStatus::Stuck,
        _ => AnalysisStatus::Failed,
    }
}

/// Mint a fresh token and hand it to the sidecar. Failures are logged,
/// never fatal: the next tick retries.
async fn refresh_analysis_token(
    orch: &Orchestrator,
    http: &reqwest::Client,
    base: &str,
    deployment_name: &str,
    analysis_id: &str,
) {
    let result = async {
        let token = orch.keycloak.analysis_token(analysis_id).await?;
        http.post(format!("{}/analysis/token_refresh", base))
            .header("Connection", "close")
            .json(&serde_json::json!({ "token": token }))
            .send()
            .await
            .context("failed to send token refresh")?
            .error_for_status()
            .context("token refresh rejected")?;
        anyhow::Ok(())
    }
    .await;
    if let Err(e) = result {
        print_warning(e.context(format!(
            "failed to refresh token in deployment {}",
            deployment_name
        )));
    }
}

struct StatusLoop {
    orch: Orchestrator,
    http: reqwest::Client,
    interval_secs: u64,
    hub: Option<HubClient>,
    node_id: Option<String>,
    node_analysis_ids: HashMap<String, String>,
}

/// The reconciler: one cooperative loop that resolves every live
/// analysis's authoritative status each tick, applies recovery, and
/// reports to the hub. No single failure aborts the loop.
pub async fn run(orch: Orchestrator, interval_secs: u64, cancel: CancellationToken) {
    println!("{}", "⚙️ Starting analysis status loop...".green());
    let mut status_loop = StatusLoop {
        orch,
        http: reqwest::Client::new(),
        interval_secs,
        hub: None,
        node_id: None,
        node_analysis_ids: HashMap::new(),
    };
    loop {
        if status_loop.hub.is_none() {
            status_loop.connect_hub().await;
        }
        if status_loop.hub.is_some() {
            status_loop.tick().await;
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(Duration::from_secs(interval_secs)) => {}
        }
    }
    println!("{}", "🛑 Analysis status loop stopped.".red());
}

impl StatusLoop {
    async fn connect_hub(&mut self) {
        match HubClient::connect(&self.orch.hub) {
            Ok(mut client) => match client.resolve_node().await {
                Ok(Some(node_id)) => {
                    println!("PO ACTION - Hub client init successful");
                    self.node_id = Some(node_id);
                    self.hub = Some(client);
                }
                Ok(None) => {
                    println!("PO ACTION - Resetting hub client...");
                }
                Err(e) => {
                    print_warning(e.context("failed to resolve node at hub"));
                }
            },
            Err(e) => {
                print_warning(e.context("failed to initialize hub client"));
            }
        }
    }

    async fn tick(&mut self) {
        let analysis_ids = match db::list_analysis_ids(&self.orch.pool).await {
            Ok(ids) => ids,
            Err(e) => {
                print_error(e.context("failed to list analyses"));
                return;
            }
        };
        let mut running = Vec::new();
        for analysis_id in analysis_ids {
            match db::analysis_is_live(&self.orch.pool, &analysis_id).await {
                Ok(true) => running.push(analysis_id),
                Ok(false) => {}
                Err(e) => print_error(e.context("failed to check analysis liveness")),
            }
        }
        println!(
            "PO ACTION - Checking for running analyzes...{:?}",
            running,
        );

        for analysis_id in running {
            let Some(node_analysis_id) = self.node_analysis_id(&analysis_id).await else {
                if self.hub.is_none() {
                    // Hub handle went bad; re-resolve everything next tick.
                    return;
                }
                continue;
            };
            if let Err(e) = self.reconcile_analysis(&analysis_id, &node_analysis_id).await {
                print_error(e.context(format!("failed to reconcile analysis {}", analysis_id)));
            }
        }
    }

    /// Cached `(analysis, node)` binding, resolved once per analysis.
    /// A failed resolution invalidates the hub handle.
    async fn node_analysis_id(&mut self, analysis_id: &str) -> Option<String> {
        if let Some(id) = self.node_analysis_ids.get(analysis_id) {
            return Some(id.clone());
        }
        let node_id = self.node_id.clone()?;
        let hub = self.hub.as_mut()?;
        match hub.resolve_analysis_node(analysis_id, &node_id).await {
            Ok(Some(id)) => {
                self.node_analysis_ids
                    .insert(analysis_id.to_string(), id.clone());
                Some(id)
            }
            Ok(None) => {
                self.hub = None;
                None
            }
            Err(e) => {
                print_warning(e.context("failed to resolve analysis node at hub"));
                self.hub = None;
                None
            }
        }
    }

    async fn resolve_status(&self, analysis_id: &str) -> Result<Option<ResolvedStatus>> {
        let Some(generation) = db::get_latest_generation(&self.orch.pool, analysis_id).await?
        else {
            return Ok(None);
        };
        let db_status = generation.status;
        // Finished is terminal; the deployment is already gone, so the
        // probe would only burn its deadline.
        let int_status = if db_status == AnalysisStatus::Finished {
            AnalysisStatus::Finished
        } else {
            probe_internal(
                &self.orch,
                &self.http,
                &generation.deployment_name,
                analysis_id,
                self.interval_secs,
            )
            .await
        };
        Ok(Some(ResolvedStatus {
            generation,
            db: db_status,
            int: int_status,
        }))
    }

    async fn reconcile_analysis(
        &mut self,
        analysis_id: &str,
        node_analysis_id: &str,
    ) -> Result<()> {
        let Some(mut status) = self.resolve_status(analysis_id).await? else {
            return Ok(());
        };
        println!("PO STATUS LOOP - Current analysis id: {}", analysis_id);
        println!("\tDatabase status: {}", status.db);
        println!("\tInternal status: {}", status.int);

        if decide(status.db, status.int) == Action::Unstuck {
            println!("\tUnstuck analysis with internal status: {}", status.int);
            self.fix_stuck(&status).await?;
            match self.resolve_status(analysis_id).await? {
                Some(s) => status = s,
                None => return Ok(()),
            }
        }

        if decide(status.db, status.int) == Action::PromoteRunning {
            println!("\tUpdate created-to-running database status");
            db::update_generation(
                &self.orch.pool,
                &status.generation.deployment_name,
                &UpdateGeneration::status(AnalysisStatus::Running),
            )
            .await?;
            match self.resolve_status(analysis_id).await? {
                Some(s) => status = s,
                None => return Ok(()),
            }
        }

        if decide(status.db, status.int) == Action::Finalize {
            println!("\tUpdate running-to-finished database status");
            self.finalize(&status).await?;
            match self.resolve_status(analysis_id).await? {
                Some(s) => status = s,
                None => return Ok(()),
            }
        }

        self.report(analysis_id, node_analysis_id, &status).await;
        Ok(())
    }

    /// The recovery half of the unstuck action: persist `failed`,
    /// classify, stream the startup-error log, then either rebuild the
    /// proxy half (pods were recycled under a stale allow-list) or
    /// launch a replacement generation, bounded by the restart budget.
    async fn fix_stuck(&mut self, status: &ResolvedStatus) -> Result<()> {
        // Re-read the row: a concurrent stop/delete may have won.
        let Some(generation) =
            db::get_generation(&self.orch.pool, &status.generation.deployment_name).await?
        else {
            return Ok(());
        };
        let generation = &generation;
        db::update_generation(
            &self.orch.pool,
            &generation.deployment_name,
            &UpdateGeneration::status(AnalysisStatus::Failed),
        )
        .await?;

        let is_slow =
            status.db == AnalysisStatus::Started && status.int == AnalysisStatus::Failed;
        let mut failure = if is_slow {
            StartupFailure::Slow
        } else {
            StartupFailure::Stuck
        };
        let mut k8s_reason: Option<String> = None;
        if is_slow
            && let Some(pod_statuses) = self
                .orch
                .cluster
                .get_pod_status(&generation.deployment_name)
                .await?
            && let Some((_, probe)) = pod_statuses.last()
            && !probe.ready
        {
            failure = StartupFailure::K8s;
            k8s_reason = Some(probe.reason.clone());
            println!(
                "\tDeployment of analysis={} failed (ready=false).\n\t\t{}: {}",
                generation.analysis_id, probe.reason, probe.message,
            );
        }

        self.stream_startup_error(generation, failure, k8s_reason.as_deref())
            .await;

        if generation.restart_counter >= MAX_RESTARTS {
            return Ok(());
        }

        if failure == StartupFailure::Stuck {
            let current_pods = self
                .orch
                .cluster
                .pods_of(&generation.deployment_name)
                .await?;
            if !current_pods.is_empty() && current_pods != generation.pod_ids {
                // The Deployment replaced its pods; the sidecar still
                // allow-lists the old IP. Rebuilding the proxy half is
                // enough to get the analysis talking again.
                self.orch
                    .cluster
                    .rebuild_sidecar(&generation.deployment_name, &generation.project_id)
                    .await?;
                // The rebuild recycles the analysis pods once more, so
                // the names read before it are already gone.
                let fresh_pods = self
                    .orch
                    .cluster
                    .pods_of(&generation.deployment_name)
                    .await?;
                db::update_generation(
                    &self.orch.pool,
                    &generation.deployment_name,
                    &UpdateGeneration {
                        status: Some(AnalysisStatus::Started),
                        pod_ids: Some(fresh_pods),
                        ..Default::default()
                    },
                )
                .await?;
                return Ok(());
            }
        }

        self.orch.stop_analysis(&generation.analysis_id).await?;
        tokio::time::sleep(RELAUNCH_SETTLE).await;
        self.orch
            .launch(
                &generation.create_request(),
                generation.restart_counter + 1,
            )
            .await?;
        db::prune_older_generations(&self.orch.pool, &generation.analysis_id).await?;
        Ok(())
    }

    async fn stream_startup_error(
        &mut self,
        generation: &Analysis,
        failure: StartupFailure,
        k8s_reason: Option<&str>,
    ) {
        let log = startup_error_log(failure, generation.restart_counter, k8s_reason, Utc::now());
        if let Err(e) = db::update_generation(
            &self.orch.pool,
            &generation.deployment_name,
            &UpdateGeneration {
                log: Some(serde_json::json!({ "startup_error": log })),
                ..Default::default()
            },
        )
        .await
        {
            print_warning(e.context("failed to persist startup-error log"));
        }

        let Some(node_id) = self.node_id.clone() else {
            return;
        };
        if let Some(hub) = self.hub.as_mut()
            && let Err(e) = hub
                .post_log(
                    &generation.analysis_id,
                    &node_id,
                    "error",
                    generation.status,
                    &log,
                )
                .await
        {
            print_warning(e.context("failed to stream startup-error log to hub"));
        }
    }

    /// Persist the internal verdict, tear the generation down, and
    /// freeze its logs.
    async fn finalize(&mut self, status: &ResolvedStatus) -> Result<()> {
        db::update_generation(
            &self.orch.pool,
            &status.generation.deployment_name,
            &UpdateGeneration::status(status.int),
        )
        .await?;
        // Log archival to object storage would slot in here.
        self.orch.stop_analysis(&status.generation.analysis_id).await?;
        Ok(())
    }

    async fn report(
        &mut self,
        analysis_id: &str,
        node_analysis_id: &str,
        status: &ResolvedStatus,
    ) {
        let reported = hub_status(status.db, status.int);
        let Some(hub) = self.hub.as_mut() else {
            return;
        };
        match hub
            .update_run_status(node_analysis_id, reported, None)
            .await
        {
            Ok(()) => println!(
                "\tSet hub analysis status with node_analysis={}, db_status={}, internal_status={} to {}",
                node_analysis_id, status.db, status.int, reported,
            ),
            Err(e) => {
                print_warning(e.context(format!(
                    "failed to update hub status for analysis {}",
                    analysis_id
                )));
                self.hub = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AnalysisStatus::*;

    #[test]
    fn internal_stuck_always_wins() {
        for db in [Starting, Started, Running, Stuck, Stopping, Stopped, Finished, Failed] {
            assert_eq!(decide(db, Stuck), Action::Unstuck);
        }
    }

    #[test]
    fn slow_startup_is_treated_as_stuck() {
        assert_eq!(decide(Started, Failed), Action::Unstuck);
    }

    #[test]
    fn started_analyses_promote_or_finalize() {
        assert_eq!(decide(Started, Running), Action::PromoteRunning);
        assert_eq!(decide(Started, Finished), Action::Finalize);
    }

    #[test]
    fn ended_analyses_finalize() {
        assert_eq!(decide(Running, Finished), Action::Finalize);
        assert_eq!(decide(Running, Failed), Action::Finalize);
        assert_eq!(decide(Failed, Finished), Action::Finalize);
        assert_eq!(decide(Failed, Failed), Action::Finalize);
    }

    #[test]
    fn steady_states_take_no_action() {
        assert_eq!(decide(Running, Running), Action::None);
        assert_eq!(decide(Finished, Finished), Action::None);
        assert_eq!(decide(Stopped, Failed), Action::None);
        assert_eq!(decide(Starting, Running), Action::None);
    }

    // The firmly-stuck row is shadowed: an internal `stuck` matches the
    // unstuck row first regardless of the persisted status. The capped
    // generation still finalizes once its sidecar stops answering.
    #[test]
    fn firmly_stuck_is_shadowed_by_unstuck() {
        assert_eq!(decide(Failed, Stuck), Action::Unstuck);
    }

    #[test]
    fn hub_mapping_prefers_terminal_db_status() {
        assert_eq!(hub_status(Failed, Running), Failed);
        assert_eq!(hub_status(Finished, Failed), Finished);
    }

    #[test]
    fn hub_mapping_falls_back_to_internal_verdict() {
        assert_eq!(hub_status(Started, Running), Running);
        assert_eq!(hub_status(Running, Finished), Finished);
        assert_eq!(hub_status(Started, Failed), Failed);
    }

    #[test]
    fn hub_mapping_defaults_to_db_status() {
        assert_eq!(hub_status(Started, Stuck), Started);
        assert_eq!(hub_status(Running, Starting), Running);
    }

    #[test]
    fn hub_mapping_is_idempotent() {
        for db in [Starting, Started, Running, Stuck, Stopping, Stopped, Finished, Failed] {
            for int in [Starting, Started, Running, Stuck, Stopping, Stopped, Finished, Failed] {
                let once = hub_status(db, int);
                assert_eq!(hub_status(once, int), once);
            }
        }
    }
}
