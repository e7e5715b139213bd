use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Hard cap on reconciler-driven restarts of a single analysis.
pub const MAX_RESTARTS: i32 = 10;

/// Lifecycle states of an analysis generation.
///
/// Transitions run forward (starting → started → running → finished)
/// except for `stuck`, which is a transient marker the reconciler
/// resolves by restarting the generation.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisStatus {
    Starting,
    Started,
    Running,
    Stuck,
    Stopping,
    Stopped,
    Finished,
    Failed,
}

impl AnalysisStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisStatus::Starting => "starting",
            AnalysisStatus::Started => "started",
            AnalysisStatus::Running => "running",
            AnalysisStatus::Stuck => "stuck",
            AnalysisStatus::Stopping => "stopping",
            AnalysisStatus::Stopped => "stopped",
            AnalysisStatus::Finished => "finished",
            AnalysisStatus::Failed => "failed",
        }
    }

    /// States in which the reconciler keeps watching the generation.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            AnalysisStatus::Starting
                | AnalysisStatus::Started
                | AnalysisStatus::Running
                | AnalysisStatus::Stuck
        )
    }

    /// States in which the generation has ended and its log is frozen.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AnalysisStatus::Stopped | AnalysisStatus::Finished | AnalysisStatus::Failed
        )
    }
}

impl fmt::Display for AnalysisStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AnalysisStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "starting" => Ok(AnalysisStatus::Starting),
            "started" => Ok(AnalysisStatus::Started),
            "running" => Ok(AnalysisStatus::Running),
            "stuck" => Ok(AnalysisStatus::Stuck),
            "stopping" => Ok(AnalysisStatus::Stopping),
            "stopped" => Ok(AnalysisStatus::Stopped),
            "finished" => Ok(AnalysisStatus::Finished),
            "failed" => Ok(AnalysisStatus::Failed),
            _ => Err(anyhow::anyhow!("unknown analysis status: {}", s)),
        }
    }
}

/// One launch attempt of an analysis, as persisted in the `analysis`
/// table. The generation owns five cluster resources (analysis
/// Deployment, nginx Deployment + ConfigMap + Services, NetworkPolicy)
/// which are created and torn down together.
#[derive(Debug, Clone, Serialize)]
pub struct Analysis {
    pub deployment_name: String,
    pub analysis_id: String,
    pub project_id: String,
    pub registry_url: String,
    pub image_url: String,
    pub registry_user: String,
    pub registry_password: String,
    pub kong_token: String,
    pub namespace: String,
    pub pod_ids: Vec<String>,
    pub status: AnalysisStatus,
    pub log: Option<serde_json::Value>,
    pub restart_counter: i32,
    pub progress: i32,
    pub time_created: DateTime<Utc>,
    pub time_updated: DateTime<Utc>,
}

impl Analysis {
    /// Extract the launch body so the reconciler can start a
    /// replacement generation from a persisted record.
    pub fn create_request(&self) -> CreateAnalysisRequest {
        CreateAnalysisRequest {
            analysis_id: self.analysis_id.clone(),
            project_id: self.project_id.clone(),
            registry_url: self.registry_url.clone(),
            image_url: self.image_url.clone(),
            registry_user: self.registry_user.clone(),
            registry_password: self.registry_password.clone(),
            kong_token: self.kong_token.clone(),
        }
    }
}

/// Field mask for partial repository updates.
#[derive(Default, Debug, Clone)]
pub struct UpdateGeneration {
    pub status: Option<AnalysisStatus>,
    pub log: Option<serde_json::Value>,
    pub pod_ids: Option<Vec<String>>,
    pub restart_counter: Option<i32>,
    pub progress: Option<i32>,
}

impl UpdateGeneration {
    pub fn status(status: AnalysisStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }
}

/// Body of `POST /po/`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CreateAnalysisRequest {
    pub analysis_id: String,
    pub project_id: String,
    pub registry_url: String,
    pub image_url: String,
    pub registry_user: String,
    pub registry_password: String,
    pub kong_token: String,
}

/// Syslog-style levels accepted on the log-ingest endpoint and
/// forwarded to the hub.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Emerg,
    Alert,
    Crit,
    Error,
    Warn,
    Notice,
    Info,
    Debug,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Emerg => "emerg",
            LogLevel::Alert => "alert",
            LogLevel::Crit => "crit",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Notice => "notice",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}

/// Body of `POST /po/stream_logs`, sent by the analysis sidecar.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StreamLogRequest {
    pub analysis_id: String,
    pub status: AnalysisStatus,
    #[serde(default)]
    pub progress: Option<i32>,
    pub log_type: LogLevel,
    pub log: String,
}

/// Why a generation had to be restarted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupFailure {
    /// The sidecar reported the analysis cannot make progress.
    Stuck,
    /// The analysis never became reachable within the probe deadline.
    Slow,
    /// Kubernetes reported the pod itself failed to come up.
    K8s,
}

impl StartupFailure {
    fn phrase(&self) -> &'static str {
        match self {
            StartupFailure::Stuck => "The analysis failed to connect to other node components",
            StartupFailure::Slow => "The analysis took too long during startup and was restarted",
            StartupFailure::K8s => "The analysis failed to deploy in kubernetes",
        }
    }
}

/// Render the startup-error line streamed to the hub when a generation
/// is restarted or permanently failed.
pub fn startup_error_log(
    failure: StartupFailure,
    restart_counter: i32,
    k8s_reason: Option<&str>,
    now: DateTime<Utc>,
) -> String {
    let term = if restart_counter < MAX_RESTARTS {
        ""
    } else {
        " -> Terminating analysis as failed."
    };
    let mut log = format!(
        "[flame -- POAPI: ANALYSISSTARTUPERROR -- {}] Error: {} [restart {} of {}].{}",
        now.format("%Y-%m-%d %H:%M:%S"),
        failure.phrase(),
        restart_counter,
        MAX_RESTARTS,
        term,
    );
    if failure == StartupFailure::K8s
        && let Some(reason) = k8s_reason
        && !reason.is_empty()
    {
        log.push_str(&format!("\n\tKubernetesApiError: {}.", reason));
    }
    log
}

/// Structured log blob persisted on stop: both containers' lines keyed
/// by their deployment names.
pub fn log_blob(
    deployment_name: &str,
    analysis_lines: Vec<String>,
    nginx_lines: Vec<String>,
) -> serde_json::Value {
    serde_json::json!({
        "analysis": { deployment_name: analysis_lines },
        "nginx": { format!("nginx-{}", deployment_name): nginx_lines },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn status_round_trips_through_text() {
        for status in [
            AnalysisStatus::Starting,
            AnalysisStatus::Started,
            AnalysisStatus::Running,
            AnalysisStatus::Stuck,
            AnalysisStatus::Stopping,
            AnalysisStatus::Stopped,
            AnalysisStatus::Finished,
            AnalysisStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<AnalysisStatus>().unwrap(), status);
        }
    }

    #[test]
    fn live_and_terminal_are_disjoint() {
        let live = [
            AnalysisStatus::Starting,
            AnalysisStatus::Started,
            AnalysisStatus::Running,
            AnalysisStatus::Stuck,
        ];
        let terminal = [
            AnalysisStatus::Stopped,
            AnalysisStatus::Finished,
            AnalysisStatus::Failed,
        ];
        for s in live {
            assert!(s.is_live());
            assert!(!s.is_terminal());
        }
        for s in terminal {
            assert!(s.is_terminal());
            assert!(!s.is_live());
        }
        assert!(!AnalysisStatus::Stopping.is_live());
        assert!(!AnalysisStatus::Stopping.is_terminal());
    }

    #[test]
    fn startup_log_mentions_restart_budget() {
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        let log = startup_error_log(StartupFailure::Slow, 3, None, now);
        assert!(log.contains("[flame -- POAPI: ANALYSISSTARTUPERROR -- 2025-03-01 12:00:00]"));
        assert!(log.contains("[restart 3 of 10]"));
        assert!(!log.contains("Terminating"));
    }

    #[test]
    fn startup_log_marks_terminal_restart() {
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        let log = startup_error_log(StartupFailure::Stuck, MAX_RESTARTS, None, now);
        assert!(log.ends_with("-> Terminating analysis as failed."));
    }

    #[test]
    fn startup_log_appends_kubernetes_reason() {
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        let log = startup_error_log(StartupFailure::K8s, 1, Some("ImagePullBackOff"), now);
        assert!(log.contains("failed to deploy in kubernetes"));
        assert!(log.ends_with("KubernetesApiError: ImagePullBackOff."));
    }

    #[test]
    fn log_blob_keys_both_containers() {
        let blob = log_blob(
            "analysis-a1-1",
            vec!["out".to_string()],
            vec!["nginx out".to_string()],
        );
        assert_eq!(blob["analysis"]["analysis-a1-1"][0], "out");
        assert_eq!(blob["nginx"]["nginx-analysis-a1-1"][0], "nginx out");
    }
}
