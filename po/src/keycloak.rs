use anyhow::{Context, Result, bail};
use flame_common::args::KeycloakArgs;
use serde::Deserialize;

/// Per-analysis service clients carry this prefix so cleanup can tell
/// them apart from unrelated realm clients.
pub const CLIENT_PREFIX: &str = "flame-";

/// Broker for per-analysis identities at the node auth server.
#[derive(Clone)]
pub struct Keycloak {
    http: reqwest::Client,
    url: String,
    realm: String,
    admin_client_id: String,
    admin_client_secret: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct RealmClient {
    #[serde(default)]
    pub id: String,
    #[serde(default, rename = "clientId")]
    pub client_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub secret: Option<String>,
}

#[allow(dead_code)]
#[derive(Deserialize)]
struct TokenResp {
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

pub fn analysis_client_id(analysis_id: &str) -> String {
    format!("{}{}", CLIENT_PREFIX, analysis_id)
}

impl Keycloak {
    pub fn new(args: &KeycloakArgs) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: args.keycloak_url.trim_end_matches('/').to_string(),
            realm: args.keycloak_realm.clone(),
            admin_client_id: args.admin_client_id.clone(),
            admin_client_secret: args.admin_client_secret.clone(),
        }
    }

    fn token_url(&self) -> String {
        format!(
            "{}/realms/{}/protocol/openid-connect/token",
            self.url, self.realm
        )
    }

    fn admin_base(&self) -> String {
        format!("{}/admin/realms/{}", self.url, self.realm)
    }

    async fn client_credentials_token(&self, client_id: &str, client_secret: &str) -> Result<String> {
        let res = self
            .http
            .post(self.token_url())
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", client_id),
                ("client_secret", client_secret),
            ])
            .send()
            .await
            .context("Keycloak token request failed")?;

        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            bail!("Keycloak token request failed: {} {}", status, body);
        }

        let token: TokenResp = res
            .json()
            .await
            .context("Failed to parse Keycloak token response")?;
        if token.access_token.is_empty() {
            bail!("Keycloak token response missing access_token");
        }
        Ok(token.access_token)
    }

    /// Client-credentials token of this orchestrator's admin client.
    pub async fn admin_token(&self) -> Result<String> {
        self.client_credentials_token(&self.admin_client_id, &self.admin_client_secret)
            .await
    }

    async fn lookup_client(
        &self,
        client_id: &str,
        admin_token: &str,
    ) -> Result<Option<RealmClient>> {
        let res = self
            .http
            .get(format!("{}/clients", self.admin_base()))
            .query(&[("clientId", client_id)])
            .bearer_auth(admin_token)
            .send()
            .await
            .context("Keycloak clients query failed")?;

        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            bail!("Keycloak clients query failed: {} {}", status, body);
        }

        let clients: Vec<RealmClient> = res
            .json()
            .await
            .context("Failed to parse clients response")?;
        Ok(clients.into_iter().find(|c| c.client_id == client_id))
    }

    pub async fn client_exists(&self, analysis_id: &str, admin_token: &str) -> Result<bool> {
        Ok(self
            .lookup_client(&analysis_client_id(analysis_id), admin_token)
            .await?
            .is_some())
    }

    /// Create the service-account-enabled client for an analysis.
    pub async fn create_client(&self, analysis_id: &str, admin_token: &str) -> Result<()> {
        let res = self
            .http
            .post(format!("{}/clients", self.admin_base()))
            .bearer_auth(admin_token)
            .json(&serde_json::json!({
                "clientId": analysis_client_id(analysis_id),
                "serviceAccountsEnabled": true,
            }))
            .send()
            .await
            .context("Keycloak client creation failed")?;

        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            bail!("Keycloak client creation failed: {} {}", status, body);
        }
        Ok(())
    }

    /// Secret of the analysis client, creating the client first if it
    /// does not exist yet.
    pub async fn client_secret(&self, analysis_id: &str) -> Result<String> {
        let admin_token = self.admin_token().await?;

        if !self.client_exists(analysis_id, &admin_token).await? {
            self.create_client(analysis_id, &admin_token).await?;
        }

        let client = self
            .lookup_client(&analysis_client_id(analysis_id), &admin_token)
            .await?
            .with_context(|| format!("Keycloak client for analysis {} not found", analysis_id))?;
        client
            .secret
            .filter(|s| !s.is_empty())
            .with_context(|| format!("Keycloak client for analysis {} has no secret", analysis_id))
    }

    /// Fresh client-credentials token for the analysis identity.
    pub async fn analysis_token(&self, analysis_id: &str) -> Result<String> {
        let secret = self.client_secret(analysis_id).await?;
        self.client_credentials_token(&analysis_client_id(analysis_id), &secret)
            .await
    }

    /// Remove the analysis client. Absence is tolerated.
    pub async fn delete_client(&self, analysis_id: &str) -> Result<()> {
        let admin_token = self.admin_token().await?;

        let Some(client) = self
            .lookup_client(&analysis_client_id(analysis_id), &admin_token)
            .await?
        else {
            println!("Keycloak client for analysis {} not found", analysis_id);
            return Ok(());
        };

        let res = self
            .http
            .delete(format!("{}/clients/{}", self.admin_base(), client.id))
            .bearer_auth(&admin_token)
            .send()
            .await
            .context("Keycloak client deletion failed")?;

        if !res.status().is_success() && res.status() != reqwest::StatusCode::NOT_FOUND {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            bail!("Keycloak client deletion failed: {} {}", status, body);
        }
        Ok(())
    }

    /// Every client of the realm; used by the cleanup sweep.
    pub async fn list_clients(&self) -> Result<Vec<RealmClient>> {
        let admin_token = self.admin_token().await?;

        let res = self
            .http
            .get(format!("{}/clients", self.admin_base()))
            .bearer_auth(&admin_token)
            .send()
            .await
            .context("Keycloak clients listing failed")?;

        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            bail!("Keycloak clients listing failed: {} {}", status, body);
        }

        res.json().await.context("Failed to parse clients response")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn analysis_clients_are_prefixed() {
        assert_eq!(analysis_client_id("a1"), "flame-a1");
    }
}
