use anyhow::{Context, Result, bail};
use flame_common::args::KongArgs;
use serde::Deserialize;

/// Broker for per-analysis consumers at the node API gateway.
#[derive(Clone)]
pub struct Kong {
    http: reqwest::Client,
    admin_url: String,
}

#[derive(Deserialize)]
struct ConsumerResp {
    id: String,
}

#[derive(Deserialize)]
struct KeyAuthResp {
    key: String,
}

impl Kong {
    pub fn new(args: &KongArgs) -> Self {
        Self {
            http: reqwest::Client::new(),
            admin_url: args.kong_admin_url.trim_end_matches('/').to_string(),
        }
    }

    /// Create the consumer for an analysis, or resolve the existing one.
    pub async fn create_consumer(&self, analysis_id: &str, project_id: &str) -> Result<String> {
        let res = self
            .http
            .post(format!("{}/consumers", self.admin_url))
            .json(&serde_json::json!({
                "username": analysis_id,
                "custom_id": analysis_id,
                "tags": [project_id],
            }))
            .send()
            .await
            .context("failed to send consumer creation request")?;

        if res.status() == reqwest::StatusCode::CONFLICT {
            return self.get_consumer(analysis_id).await;
        }
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            bail!("consumer creation failed with status {}: {}", status, body);
        }

        let consumer: ConsumerResp = res
            .json()
            .await
            .context("failed to parse consumer creation response")?;
        println!("Consumer added, id: {}", consumer.id);
        Ok(consumer.id)
    }

    async fn get_consumer(&self, analysis_id: &str) -> Result<String> {
        let res = self
            .http
            .get(format!("{}/consumers/{}", self.admin_url, analysis_id))
            .send()
            .await
            .context("failed to send consumer lookup request")?;

        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            bail!("consumer lookup failed with status {}: {}", status, body);
        }

        let consumer: ConsumerResp = res
            .json()
            .await
            .context("failed to parse consumer lookup response")?;
        Ok(consumer.id)
    }

    /// Attach the consumer to the project ACL group. Already attached
    /// is fine.
    pub async fn attach_acl(&self, consumer_id: &str, group: &str) -> Result<()> {
        let res = self
            .http
            .post(format!("{}/consumers/{}/acls", self.admin_url, consumer_id))
            .json(&serde_json::json!({
                "group": group,
                "tags": [group],
            }))
            .send()
            .await
            .context("failed to send ACL attachment request")?;

        if res.status() == reqwest::StatusCode::CONFLICT {
            return Ok(());
        }
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            bail!("ACL attachment failed with status {}: {}", status, body);
        }
        println!("ACL plugin configured for consumer, group: {}", group);
        Ok(())
    }

    /// Issue a key-auth credential for the consumer.
    pub async fn issue_key(&self, consumer_id: &str, project_id: &str) -> Result<String> {
        let res = self
            .http
            .post(format!(
                "{}/consumers/{}/key-auth",
                self.admin_url, consumer_id
            ))
            .json(&serde_json::json!({ "tags": [project_id] }))
            .send()
            .await
            .context("failed to send key-auth request")?;

        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            bail!("key-auth creation failed with status {}: {}", status, body);
        }

        let key_auth: KeyAuthResp = res
            .json()
            .await
            .context("failed to parse key-auth response")?;
        Ok(key_auth.key)
    }

    /// Provision consumer + ACL + key for `(analysis, project)`. Safe
    /// to repeat.
    pub async fn provision(&self, analysis_id: &str, project_id: &str) -> Result<String> {
        let consumer_id = self.create_consumer(analysis_id, project_id).await?;
        self.attach_acl(&consumer_id, project_id).await?;
        self.issue_key(&consumer_id, project_id).await
    }

    /// Remove the consumer (and its credentials). Absence is tolerated.
    pub async fn delete_consumer(&self, analysis_id: &str) -> Result<()> {
        let res = self
            .http
            .delete(format!("{}/consumers/{}", self.admin_url, analysis_id))
            .send()
            .await
            .context("failed to send consumer deletion request")?;

        if res.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            bail!("consumer deletion failed with status {}: {}", status, body);
        }
        Ok(())
    }
}
