use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use flame_common::args::HubArgs;
use flame_common::response::print_warning;
use serde::Deserialize;

use crate::models::AnalysisStatus;

/// Client for the central registry tracking analyses, nodes, and their
/// bindings. Robot tokens are cached until shortly before expiry; any
/// transient failure is grounds for the owner to drop the handle and
/// reconnect on the next tick.
pub struct HubClient {
    http: reqwest::Client,
    core_url: String,
    auth_url: String,
    robot_id: String,
    robot_secret: String,
    token: Option<(String, Instant)>,
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(default)]
    data: Vec<Identified>,
}

#[derive(Deserialize)]
struct Identified {
    id: String,
}

#[allow(dead_code)]
#[derive(Deserialize)]
struct RobotTokenResp {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

impl HubClient {
    pub fn connect(args: &HubArgs) -> Result<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(ref proxy) = args.http_proxy {
            builder = builder.proxy(reqwest::Proxy::http(proxy).context("invalid http proxy")?);
        }
        if let Some(ref proxy) = args.https_proxy {
            builder = builder.proxy(reqwest::Proxy::https(proxy).context("invalid https proxy")?);
        }
        if let Some(ref path) = args.extra_ca_certs
            && Path::new(path).exists()
        {
            let pem = std::fs::read(path).context("failed to read extra CA bundle")?;
            for cert in reqwest::Certificate::from_pem_bundle(&pem)
                .context("failed to parse extra CA bundle")?
            {
                builder = builder.add_root_certificate(cert);
            }
        }
        Ok(Self {
            http: builder.build().context("failed to build hub http client")?,
            core_url: args.core_url.trim_end_matches('/').to_string(),
            auth_url: args.auth_url.trim_end_matches('/').to_string(),
            robot_id: args.robot_id.clone(),
            robot_secret: args.robot_secret.clone(),
            token: None,
        })
    }

    /// Robot access token, refreshed lazily on expiry.
    async fn robot_token(&mut self) -> Result<String> {
        if let Some((token, expires_at)) = &self.token
            && Instant::now() < *expires_at
        {
            return Ok(token.clone());
        }

        let res = self
            .http
            .post(format!("{}/token", self.auth_url))
            .header("accept", "application/json")
            .form(&[
                ("id", self.robot_id.as_str()),
                ("secret", self.robot_secret.as_str()),
            ])
            .send()
            .await
            .context("failed to send robot token request")?;

        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            bail!("robot token request failed with status {}: {}", status, body);
        }

        let token: RobotTokenResp = res
            .json()
            .await
            .context("failed to parse robot token response")?;
        let ttl = token.expires_in.unwrap_or(60).saturating_sub(10).max(10);
        let expires_at = Instant::now() + Duration::from_secs(ttl);
        self.token = Some((token.access_token.clone(), expires_at));
        Ok(token.access_token)
    }

    async fn find_one(&mut self, path: &str, filters: &[(&str, &str)]) -> Result<Option<String>> {
        let token = self.robot_token().await?;
        let res = self
            .http
            .get(format!("{}/{}", self.core_url, path))
            .query(filters)
            .bearer_auth(token)
            .send()
            .await
            .with_context(|| format!("failed to query hub {}", path))?;

        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            bail!("hub {} query failed with status {}: {}", path, status, body);
        }

        let envelope: Envelope = res
            .json()
            .await
            .with_context(|| format!("failed to parse hub {} response", path))?;
        Ok(envelope.data.into_iter().next().map(|d| d.id))
    }

    /// Resolve this node's hub identity from its robot account.
    pub async fn resolve_node(&mut self) -> Result<Option<String>> {
        let robot_id = self.robot_id.clone();
        self.find_one("nodes", &[("filter[robot_id]", robot_id.as_str())])
            .await
    }

    /// Resolve the `(analysis, node)` binding at the hub.
    pub async fn resolve_analysis_node(
        &mut self,
        analysis_id: &str,
        node_id: &str,
    ) -> Result<Option<String>> {
        self.find_one(
            "analysis-nodes",
            &[
                ("filter[node_id]", node_id),
                ("filter[analysis_id]", analysis_id),
            ],
        )
        .await
    }

    /// Push a run status. `stuck` is an internal marker; the hub sees
    /// `failed`.
    pub async fn update_run_status(
        &mut self,
        analysis_node_id: &str,
        status: AnalysisStatus,
        progress: Option<i32>,
    ) -> Result<()> {
        let run_status = if status == AnalysisStatus::Stuck {
            AnalysisStatus::Failed
        } else {
            status
        };
        let mut body = serde_json::json!({ "run_status": run_status.as_str() });
        if let Some(progress) = progress {
            body["execution_progress"] = progress.into();
        }

        let token = self.robot_token().await?;
        let res = self
            .http
            .post(format!("{}/analysis-nodes/{}", self.core_url, analysis_node_id))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .context("failed to send run status update")?;

        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            bail!("run status update failed with status {}: {}", status, body);
        }
        Ok(())
    }

    /// Stream one log entry for an analysis on this node.
    pub async fn post_log(
        &mut self,
        analysis_id: &str,
        node_id: &str,
        level: &str,
        status: AnalysisStatus,
        message: &str,
    ) -> Result<()> {
        let token = self.robot_token().await?;
        let res = self
            .http
            .post(format!("{}/analysis-node-logs", self.core_url))
            .bearer_auth(token)
            .json(&serde_json::json!({
                "analysis_id": analysis_id,
                "node_id": node_id,
                "status": status.as_str(),
                "level": level,
                "message": message,
            }))
            .send()
            .await
            .context("failed to send analysis log entry")?;

        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            bail!("analysis log entry failed with status {}: {}", status, body);
        }
        Ok(())
    }
}

/// One-shot log forward used by the ingest endpoint: fresh client,
/// fresh node resolution, best effort.
pub async fn stream_log(
    args: &HubArgs,
    analysis_id: &str,
    level: &str,
    status: AnalysisStatus,
    message: &str,
) {
    let result = async {
        let mut hub = HubClient::connect(args)?;
        let node_id = hub
            .resolve_node()
            .await?
            .context("hub returned no node for this robot account")?;
        hub.post_log(analysis_id, &node_id, level, status, message)
            .await
    }
    .await;

    if let Err(e) = result {
        print_warning(e.context(format!(
            "failed to stream log of analysis {} to hub",
            analysis_id
        )));
    }
}

/// One-shot status report used by the API paths: fresh client, fresh
/// `(node, analysis-node)` resolution, best effort. Hub downtime never
/// fails the request that triggered the report.
pub async fn report_status(args: &HubArgs, analysis_id: &str, status: AnalysisStatus) {
    let result = async {
        let mut hub = HubClient::connect(args)?;
        let node_id = hub
            .resolve_node()
            .await?
            .context("hub returned no node for this robot account")?;
        let analysis_node_id = hub
            .resolve_analysis_node(analysis_id, &node_id)
            .await?
            .with_context(|| format!("hub returned no analysis-node for {}", analysis_id))?;
        hub.update_run_status(&analysis_node_id, status, None).await
    }
    .await;

    if let Err(e) = result {
        print_warning(e.context(format!(
            "failed to report status of analysis {} to hub",
            analysis_id
        )));
    }
}
