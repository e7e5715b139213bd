use std::collections::BTreeMap;

use anyhow::{Context, Result};
use chrono::Utc;
use deadpool_postgres::Pool;
use flame_common::args::HubArgs;
use flame_common::response::print_warning;
use owo_colors::OwoColorize;

use crate::cluster::{ANALYSIS_PORT, Cluster, SERVICE_PORT, analysis_labels};
use crate::db;
use crate::hub;
use crate::keycloak::Keycloak;
use crate::kong::Kong;
use crate::models::{
    Analysis, AnalysisStatus, CreateAnalysisRequest, UpdateGeneration, log_blob,
};

/// Shared handles the API surface and the reconciler both operate
/// through.
#[derive(Clone)]
pub struct Orchestrator {
    pub pool: Pool,
    pub cluster: Cluster,
    pub keycloak: Keycloak,
    pub kong: Kong,
    pub hub: HubArgs,
}

/// `analysis-<id>-<ordinal>`; ordinals are strictly increasing within
/// an analysis.
pub fn deployment_name(analysis_id: &str, ordinal: i64) -> String {
    format!("analysis-{}-{}", analysis_id, ordinal)
}

/// Environment handed to the analysis container, in this exact order.
pub fn analysis_env(
    data_source_token: &str,
    keycloak_token: &str,
    analysis_id: &str,
    project_id: &str,
    deployment_name: &str,
) -> Vec<(String, String)> {
    vec![
        ("DATA_SOURCE_TOKEN".to_string(), data_source_token.to_string()),
        ("KEYCLOAK_TOKEN".to_string(), keycloak_token.to_string()),
        ("ANALYSIS_ID".to_string(), analysis_id.to_string()),
        ("PROJECT_ID".to_string(), project_id.to_string()),
        ("DEPLOYMENT_NAME".to_string(), deployment_name.to_string()),
    ]
}

impl Orchestrator {
    /// Resolve a path selector to analysis ids: a concrete id, or every
    /// id known to the repository.
    pub async fn analysis_ids(&self, selector: Option<&str>) -> Result<Vec<String>> {
        match selector {
            Some(id) => Ok(vec![id.to_string()]),
            None => db::list_analysis_ids(&self.pool).await,
        }
    }

    /// Launch one generation: pull credential, fresh tokens, the
    /// five-resource unit, then the repository row. Emits `started` to
    /// the hub on success.
    pub async fn launch(
        &self,
        body: &CreateAnalysisRequest,
        restart_counter: i32,
    ) -> Result<Analysis> {
        self.cluster
            .create_image_pull_secret(
                &body.registry_url,
                &body.registry_user,
                &body.registry_password,
            )
            .await
            .context("failed to provision image pull credential")?;

        let ordinal = db::count_generations(&self.pool, &body.analysis_id).await? + 1;
        let name = deployment_name(&body.analysis_id, ordinal);

        let (data_source_token, keycloak_token) = self
            .issue_analysis_credentials(&body.analysis_id, &body.project_id, &body.kong_token)
            .await?;

        let env = analysis_env(
            &data_source_token,
            &keycloak_token,
            &body.analysis_id,
            &body.project_id,
            &name,
        );

        self.cluster
            .create_analysis_deployment(&name, &body.image_url, &env)
            .await
            .context("failed to create analysis deployment")?;
        let analysis_service = self
            .cluster
            .create_service(&name, SERVICE_PORT, ANALYSIS_PORT, analysis_labels(&name))
            .await
            .context("failed to create analysis service")?;
        self.cluster
            .create_sidecar(&name, &analysis_service, &body.analysis_id, &body.project_id)
            .await
            .context("failed to create sidecar")?;

        let pod_ids = self.cluster.pods_of(&name).await?;

        let now = Utc::now();
        let stored = db::create_generation(
            &self.pool,
            &Analysis {
                deployment_name: name.clone(),
                analysis_id: body.analysis_id.clone(),
                project_id: body.project_id.clone(),
                registry_url: body.registry_url.clone(),
                image_url: body.image_url.clone(),
                registry_user: body.registry_user.clone(),
                registry_password: body.registry_password.clone(),
                kong_token: body.kong_token.clone(),
                namespace: self.cluster.namespace().to_string(),
                pod_ids,
                status: AnalysisStatus::Started,
                log: None,
                restart_counter,
                progress: 0,
                time_created: now,
                time_updated: now,
            },
        )
        .await?;

        println!(
            "🚀 {}{}{}{}",
            "Started analysis ".green(),
            body.analysis_id.green().dimmed(),
            " as ".green(),
            name.green().dimmed(),
        );
        hub::report_status(&self.hub, &body.analysis_id, AnalysisStatus::Started).await;
        Ok(stored)
    }

    /// The `{DATA_SOURCE_TOKEN, KEYCLOAK_TOKEN}` pair handed to the
    /// analysis container: the delegated gateway token supplied by the
    /// caller plus a freshly minted auth-server token. Provisions the
    /// gateway consumer, ACL group, and key as a side effect; those
    /// live until the analysis is deleted.
    pub async fn issue_analysis_credentials(
        &self,
        analysis_id: &str,
        project_id: &str,
        kong_token: &str,
    ) -> Result<(String, String)> {
        self.kong
            .provision(analysis_id, project_id)
            .await
            .context("failed to provision gateway consumer")?;
        let keycloak_token = self
            .keycloak
            .analysis_token(analysis_id)
            .await
            .context("failed to mint analysis token")?;
        Ok((kong_token.to_string(), keycloak_token))
    }

    /// Capture both containers' logs as the structured blob persisted
    /// on stop.
    pub async fn capture_logs(&self, generation: &Analysis) -> serde_json::Value {
        let analysis_lines = self
            .cluster
            .get_logs(&generation.deployment_name, Some(&generation.pod_ids))
            .await
            .unwrap_or_default();
        let nginx_lines = self
            .cluster
            .get_logs(&format!("nginx-{}", generation.deployment_name), None)
            .await
            .unwrap_or_default();
        log_blob(&generation.deployment_name, analysis_lines, nginx_lines)
    }

    /// Tear down a generation's cluster resources and persist its final
    /// status and log.
    pub async fn teardown(
        &self,
        generation: &Analysis,
        log: serde_json::Value,
        final_status: AnalysisStatus,
    ) -> Result<()> {
        self.cluster
            .delete_generation(&generation.deployment_name)
            .await
            .context("failed to delete generation resources")?;
        db::update_generation(
            &self.pool,
            &generation.deployment_name,
            &UpdateGeneration {
                status: Some(final_status),
                log: Some(log),
                ..Default::default()
            },
        )
        .await?;
        Ok(())
    }

    /// Stop the latest generation of an analysis: capture logs, tear
    /// down resources, keep an already-terminal status, and report the
    /// outcome to the hub.
    pub async fn stop_analysis(&self, analysis_id: &str) -> Result<Option<AnalysisStatus>> {
        let Some(generation) = db::get_latest_generation(&self.pool, analysis_id).await? else {
            return Ok(None);
        };

        let log = self.capture_logs(&generation).await;
        let final_status = match generation.status {
            AnalysisStatus::Failed | AnalysisStatus::Finished => generation.status,
            _ => AnalysisStatus::Stopped,
        };
        self.teardown(&generation, log, final_status).await?;

        hub::report_status(&self.hub, analysis_id, final_status).await;
        Ok(Some(final_status))
    }

    /// Stop (if needed), revoke credentials, and archive every
    /// generation of an analysis.
    pub async fn delete_analysis(&self, analysis_id: &str) -> Result<Option<AnalysisStatus>> {
        let Some(generation) = db::get_latest_generation(&self.pool, analysis_id).await? else {
            return Ok(None);
        };

        let mut status = generation.status;
        if status != AnalysisStatus::Stopped {
            self.teardown(&generation, serde_json::Value::Null, AnalysisStatus::Stopped)
                .await?;
            status = AnalysisStatus::Stopped;
        }
        // Older generations (if any survived pruning) end with it.
        db::update_generation_by_analysis(
            &self.pool,
            analysis_id,
            &UpdateGeneration::status(AnalysisStatus::Stopped),
        )
        .await?;

        if let Err(e) = self.keycloak.delete_client(analysis_id).await {
            print_warning(e.context(format!(
                "failed to delete auth client of analysis {}",
                analysis_id
            )));
        }
        if let Err(e) = self.kong.delete_consumer(analysis_id).await {
            print_warning(e.context(format!(
                "failed to delete gateway consumer of analysis {}",
                analysis_id
            )));
        }

        db::archive_analysis(&self.pool, analysis_id).await?;
        Ok(Some(status))
    }

    /// Latest status per analysis.
    pub async fn get_status(
        &self,
        selector: Option<&str>,
    ) -> Result<BTreeMap<String, AnalysisStatus>> {
        let mut statuses = BTreeMap::new();
        for analysis_id in self.analysis_ids(selector).await? {
            if let Some(generation) = db::get_latest_generation(&self.pool, &analysis_id).await? {
                statuses.insert(analysis_id, generation.status);
            }
        }
        Ok(statuses)
    }

    /// Pod names per analysis, as recorded at launch.
    pub async fn get_pods(
        &self,
        selector: Option<&str>,
    ) -> Result<BTreeMap<String, Vec<String>>> {
        let mut pods = BTreeMap::new();
        for analysis_id in self.analysis_ids(selector).await? {
            if let Some(generation) = db::get_latest_generation(&self.pool, &analysis_id).await? {
                pods.insert(analysis_id, generation.pod_ids);
            }
        }
        Ok(pods)
    }

    /// Stored logs of terminally ended generations.
    pub async fn retrieve_history(&self, selector: Option<&str>) -> Result<serde_json::Value> {
        let mut analysis_logs = serde_json::Map::new();
        let mut nginx_logs = serde_json::Map::new();
        for analysis_id in self.analysis_ids(selector).await? {
            let Some(generation) = db::get_latest_generation(&self.pool, &analysis_id).await?
            else {
                continue;
            };
            if !generation.status.is_terminal() {
                continue;
            }
            let Some(log) = generation.log else { continue };
            analysis_logs.insert(
                analysis_id.clone(),
                log["analysis"][generation.deployment_name.as_str()].clone(),
            );
            let nginx_name = format!("nginx-{}", generation.deployment_name);
            nginx_logs.insert(analysis_id, log["nginx"][nginx_name.as_str()].clone());
        }
        Ok(serde_json::json!({
            "analysis": analysis_logs,
            "nginx": nginx_logs,
        }))
    }

    /// Live logs of currently running generations.
    pub async fn retrieve_logs(&self, selector: Option<&str>) -> Result<serde_json::Value> {
        let mut analysis_logs = serde_json::Map::new();
        let mut nginx_logs = serde_json::Map::new();
        for analysis_id in self.analysis_ids(selector).await? {
            let Some(generation) = db::get_latest_generation(&self.pool, &analysis_id).await?
            else {
                continue;
            };
            if generation.status != AnalysisStatus::Running {
                continue;
            }
            let lines = self
                .cluster
                .get_logs(&generation.deployment_name, Some(&generation.pod_ids))
                .await?;
            analysis_logs.insert(analysis_id.clone(), serde_json::json!(lines));
            let lines = self
                .cluster
                .get_logs(&format!("nginx-{}", generation.deployment_name), None)
                .await?;
            nginx_logs.insert(analysis_id, serde_json::json!(lines));
        }
        Ok(serde_json::json!({
            "analysis": analysis_logs,
            "nginx": nginx_logs,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deployment_names_carry_the_ordinal() {
        assert_eq!(deployment_name("a1", 1), "analysis-a1-1");
        assert_eq!(deployment_name("a1", 12), "analysis-a1-12");
        assert_eq!(
            crate::cluster::analysis_id_of(&deployment_name("a1", 3)),
            Some("a1"),
        );
    }

    #[test]
    fn env_is_ordered_and_complete() {
        let env = analysis_env("kong", "kc", "a1", "p1", "analysis-a1-1");
        let keys: Vec<&str> = env.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(
            keys,
            [
                "DATA_SOURCE_TOKEN",
                "KEYCLOAK_TOKEN",
                "ANALYSIS_ID",
                "PROJECT_ID",
                "DEPLOYMENT_NAME",
            ],
        );
        assert_eq!(env[0].1, "kong");
        assert_eq!(env[4].1, "analysis-a1-1");
    }
}
