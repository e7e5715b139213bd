use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Context, Result};
use flame_common::labels;

use crate::cluster::ResourceKind;
use crate::compose::Orchestrator;
use crate::db;
use crate::keycloak::CLIENT_PREFIX;

const KNOWN_TYPES: &[&str] = &["zombies", "all", "analyzes", "services", "mb", "rs", "keycloak"];

/// Per-kind sweep table: label selectors identifying our resources and
/// how many trailing `-` segments hide the analysis id.
const SWEEP: &[(ResourceKind, &[&str], usize)] = &[
    (
        ResourceKind::Deployment,
        &[labels::ANALYSIS, labels::ANALYSIS_NGINX],
        1,
    ),
    (
        ResourceKind::Pod,
        &[labels::ANALYSIS, labels::ANALYSIS_NGINX],
        2,
    ),
    (
        ResourceKind::Service,
        &[labels::ANALYSIS, labels::ANALYSIS_NGINX],
        1,
    ),
    (ResourceKind::NetworkPolicy, &[labels::NGINX_POLICY], 2),
    (ResourceKind::ConfigMap, &[labels::NGINX_CONFIG_MAP], 2),
];

/// Recover the analysis id from a resource name: drop the trailing
/// segments (ordinal, decoration, pod hashes), then the proxy prefixes,
/// then the `analysis-` prefix. A name that doesn't fit the scheme is
/// not ours.
pub fn derive_analysis_id(name: &str, right_splits: usize) -> Option<String> {
    let mut rest = name;
    for _ in 0..right_splits {
        rest = rest.rsplit_once('-')?.0;
    }
    let rest = rest
        .strip_prefix("nginx-to-")
        .or_else(|| rest.strip_prefix("nginx-"))
        .unwrap_or(rest);
    rest.strip_prefix("analysis-").map(str::to_string)
}

/// Delete cluster resources whose derived analysis id has no repository
/// row. Returns a human-readable report.
pub async fn sweep_zombies(orch: &Orchestrator) -> Result<String> {
    let known: BTreeSet<String> = db::list_analysis_ids(&orch.pool)
        .await?
        .into_iter()
        .collect();

    let mut report = String::new();
    for (kind, selectors, right_splits) in SWEEP {
        for selector in *selectors {
            let names = orch
                .cluster
                .list_resources(*kind, &format!("component={}", selector))
                .await?;
            let zombies: Vec<String> = names
                .into_iter()
                .filter(|name| {
                    derive_analysis_id(name, *right_splits)
                        .is_none_or(|id| !known.contains(&id))
                })
                .collect();
            for zombie in &zombies {
                orch.cluster.delete_resource(*kind, zombie).await?;
            }
            report.push_str(&format!(
                "Deleted {} zombie {}{}s\n",
                zombies.len(),
                if selector.contains("-nginx") { "nginx-" } else { "" },
                kind.as_str(),
            ));
        }
    }
    Ok(report)
}

/// Run the requested cleanup types (comma-separated) and always finish
/// with the zombie sweep. Individual failures are reported, not fatal.
pub async fn cleanup(orch: &Orchestrator, cleanup_type: &str) -> BTreeMap<String, String> {
    let requested: BTreeSet<&str> = cleanup_type.split(',').map(str::trim).collect();

    let mut response = BTreeMap::new();
    for requested_type in requested {
        if !KNOWN_TYPES.contains(&requested_type) {
            response.insert(
                requested_type.to_string(),
                format!(
                    "Unknown cleanup type: {} (known types: 'zombies', 'all', 'analyzes', \
                     'keycloak', 'services', 'mb', and 'rs')",
                    requested_type
                ),
            );
            continue;
        }
        let result = run_cleanup_type(orch, requested_type).await;
        match result {
            Ok(Some(message)) => {
                response.insert(requested_type.to_string(), message);
            }
            Ok(None) => {}
            Err(e) => {
                response.insert(requested_type.to_string(), format!("{:#}", e));
            }
        }
    }

    let zombies = sweep_zombies(orch)
        .await
        .unwrap_or_else(|e| format!("{:#}", e));
    response.insert("zombies".to_string(), zombies);
    response
}

async fn run_cleanup_type(orch: &Orchestrator, cleanup_type: &str) -> Result<Option<String>> {
    let mut messages = Vec::new();

    if matches!(cleanup_type, "all" | "analyzes") {
        let analysis_ids = db::list_analysis_ids(&orch.pool).await?;
        db::reset(&orch.pool).await?;
        messages.push(format!(
            "Deleted {} analysis deployments and associated resources from database ({:?})",
            analysis_ids.len(),
            analysis_ids,
        ));
    }
    if matches!(cleanup_type, "all" | "services" | "mb") {
        reset_component_pod(orch, labels::MESSAGE_BROKER).await?;
        messages.push("Reset message broker".to_string());
    }
    if matches!(cleanup_type, "all" | "services" | "rs") {
        reset_component_pod(orch, labels::RESULT_SERVICE).await?;
        messages.push("Reset result service".to_string());
    }
    if matches!(cleanup_type, "all" | "keycloak") {
        let count = sweep_auth_clients(orch).await?;
        messages.push(format!("Deleted {} orphaned auth clients", count));
    }

    Ok((!messages.is_empty()).then(|| messages.join("; ")))
}

/// Delete a service pod by component label; its Deployment respawns it.
async fn reset_component_pod(orch: &Orchestrator, component: &str) -> Result<()> {
    let pod = orch
        .cluster
        .find_resource(
            ResourceKind::Pod,
            &format!("component={}", component),
            None,
        )
        .await?
        .with_context(|| format!("no pod found for component={}", component))?;
    orch.cluster.delete_resource(ResourceKind::Pod, &pod).await?;
    Ok(())
}

/// Delete `flame-`-prefixed auth clients whose analysis has no
/// repository row.
async fn sweep_auth_clients(orch: &Orchestrator) -> Result<usize> {
    let known: BTreeSet<String> = db::list_analysis_ids(&orch.pool)
        .await?
        .into_iter()
        .collect();

    let mut deleted = 0;
    for client in orch.keycloak.list_clients().await? {
        let Some(analysis_id) = client.client_id.strip_prefix(CLIENT_PREFIX) else {
            continue;
        };
        if !known.contains(analysis_id) {
            orch.keycloak.delete_client(analysis_id).await?;
            deleted += 1;
        }
    }
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_ids_from_generation_resources() {
        assert_eq!(
            derive_analysis_id("analysis-ghost-1", 1),
            Some("ghost".to_string()),
        );
        assert_eq!(
            derive_analysis_id("nginx-analysis-ghost-1", 1),
            Some("ghost".to_string()),
        );
        assert_eq!(
            derive_analysis_id("nginx-to-analysis-ghost-1-policy", 2),
            Some("ghost".to_string()),
        );
        assert_eq!(
            derive_analysis_id("nginx-analysis-ghost-1-config", 2),
            Some("ghost".to_string()),
        );
    }

    #[test]
    fn derives_ids_from_hyphenated_analysis_ids() {
        assert_eq!(
            derive_analysis_id("analysis-my-long-id-3", 1),
            Some("my-long-id".to_string()),
        );
    }

    #[test]
    fn foreign_names_do_not_derive() {
        assert_eq!(derive_analysis_id("coredns-5d78c9869d-abcde", 1), None);
        assert_eq!(derive_analysis_id("analysis", 1), None);
    }

    #[test]
    fn known_ids_survive_the_filter() {
        let known: BTreeSet<String> = ["ghost".to_string()].into();
        let derived = derive_analysis_id("analysis-ghost-1", 1).unwrap();
        assert!(known.contains(&derived));
    }
}
