use std::collections::BTreeMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use flame_common::labels;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, EnvVar, HTTPGetAction, KeyToPath,
    LocalObjectReference, Pod, PodSpec, PodTemplateSpec, Probe, Secret, Service, ServicePort,
    ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::api::networking::v1::{
    NetworkPolicy, NetworkPolicyEgressRule, NetworkPolicyIngressRule, NetworkPolicyPeer,
    NetworkPolicySpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{DeleteParams, ListParams, LogParams, ObjectMeta, PostParams, PropagationPolicy};
use kube::{Api, Client};
use owo_colors::OwoColorize;

pub mod proxy;

pub const ANALYSIS_PORT: i32 = 8000;
pub const NGINX_PORT: i32 = 80;
pub const SERVICE_PORT: i32 = 80;

/// Image-pull secret shared by all analysis deployments on this node.
pub const PULL_SECRET_NAME: &str = "flame-harbor-credentials";

const NAMESPACE_FILE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Kubernetes reported error: {source}")]
    Kube {
        #[from]
        source: kube::Error,
    },

    #[error("Conflict creating '{0}' remains unresolved")]
    Conflict(String),

    #[error("Json error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Deployment,
    Pod,
    Service,
    ConfigMap,
    NetworkPolicy,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Deployment => "deployment",
            ResourceKind::Pod => "pod",
            ResourceKind::Service => "service",
            ResourceKind::ConfigMap => "configmap",
            ResourceKind::NetworkPolicy => "networkpolicy",
        }
    }
}

/// Readiness of one pod, as reported by its first container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodProbe {
    pub ready: bool,
    pub reason: String,
    pub message: String,
}

/// Typed operations over the container platform, scoped to the
/// namespace this orchestrator runs in.
#[derive(Clone)]
pub struct Cluster {
    client: Client,
    namespace: String,
    analysis_probe_enabled: bool,
}

impl Cluster {
    pub async fn connect() -> anyhow::Result<Self> {
        let client = Client::try_default().await?;
        // The analysis container's own liveness probe is disabled by
        // policy; the sidecar carries the probe instead.
        let analysis_probe_enabled = std::env::var("PO_ANALYSIS_LIVENESS_PROBE")
            .is_ok_and(|v| ["1", "true"].contains(&v.to_lowercase().as_str()));
        Ok(Self {
            client,
            namespace: current_namespace(),
            analysis_probe_enabled,
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Create (or recreate on conflict) the docker-registry secret used
    /// to pull analysis images. A conflict that survives
    /// delete-then-create propagates.
    pub async fn create_image_pull_secret(
        &self,
        registry: &str,
        user: &str,
        password: &str,
    ) -> Result<()> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &self.namespace);
        let secret = pull_secret(registry, user, password, &self.namespace)?;
        match secrets.create(&PostParams::default(), &secret).await {
            Ok(_) => Ok(()),
            Err(_) => {
                match secrets
                    .delete(PULL_SECRET_NAME, &DeleteParams::default())
                    .await
                {
                    Ok(_) => {}
                    Err(kube::Error::Api(ae)) if ae.code == 404 => {}
                    Err(e) => return Err(e.into()),
                }
                match secrets.create(&PostParams::default(), &secret).await {
                    Ok(_) => Ok(()),
                    Err(kube::Error::Api(ae)) if ae.code == 409 => {
                        eprintln!("{}", "Conflict remains unresolved!".red());
                        Err(Error::Conflict(PULL_SECRET_NAME.to_string()))
                    }
                    Err(e) => Err(e.into()),
                }
            }
        }
    }

    /// Create the single-replica analysis Deployment with exactly the
    /// given environment, pulling through the shared registry secret.
    pub async fn create_analysis_deployment(
        &self,
        name: &str,
        image: &str,
        env: &[(String, String)],
    ) -> Result<()> {
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), &self.namespace);
        let labels = analysis_labels(name);
        let liveness_probe = self.analysis_probe_enabled.then(|| Probe {
            http_get: Some(HTTPGetAction {
                path: Some("/healthz".to_string()),
                port: IntOrString::Int(ANALYSIS_PORT),
                ..Default::default()
            }),
            initial_delay_seconds: Some(15),
            period_seconds: Some(20),
            failure_threshold: Some(1),
            timeout_seconds: Some(5),
            ..Default::default()
        });
        let deployment = Deployment {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(self.namespace.clone()),
                labels: Some(labels.clone()),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(1),
                selector: LabelSelector {
                    match_labels: Some(labels.clone()),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: name.to_string(),
                            image: Some(image.to_string()),
                            image_pull_policy: Some("IfNotPresent".to_string()),
                            ports: Some(vec![ContainerPort {
                                container_port: ANALYSIS_PORT,
                                ..Default::default()
                            }]),
                            env: Some(
                                env.iter()
                                    .map(|(key, val)| EnvVar {
                                        name: key.clone(),
                                        value: Some(val.clone()),
                                        ..Default::default()
                                    })
                                    .collect(),
                            ),
                            liveness_probe,
                            ..Default::default()
                        }],
                        image_pull_secrets: Some(vec![LocalObjectReference {
                            name: PULL_SECRET_NAME.to_string(),
                        }]),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            status: None,
        };
        deployments
            .create(&PostParams::default(), &deployment)
            .await?;
        Ok(())
    }

    /// Create a ClusterIP Service selecting `app=<name>`.
    pub async fn create_service(
        &self,
        name: &str,
        port: i32,
        target_port: i32,
        metadata_labels: BTreeMap<String, String>,
    ) -> Result<String> {
        let services: Api<Service> = Api::namespaced(self.client.clone(), &self.namespace);
        let service = Service {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(metadata_labels),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                selector: Some(BTreeMap::from([("app".to_string(), name.to_string())])),
                ports: Some(vec![ServicePort {
                    port,
                    target_port: Some(IntOrString::Int(target_port)),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            status: None,
        };
        services.create(&PostParams::default(), &service).await?;
        Ok(name.to_string())
    }

    /// Create the proxy half of a generation: nginx Deployment, its
    /// ConfigMap, its Service, and the NetworkPolicy confining the
    /// analysis pods. Discovery polls until every upstream is known.
    pub async fn create_sidecar(
        &self,
        analysis_name: &str,
        analysis_service_name: &str,
        analysis_id: &str,
        project_id: &str,
    ) -> Result<()> {
        let nginx_name = format!("nginx-{}", analysis_name);

        let discovery = proxy::discover(self, analysis_name).await?;
        let conf = proxy::render_nginx_conf(
            &discovery,
            analysis_service_name,
            analysis_id,
            project_id,
        );
        let config_map_name = self.create_nginx_config_map(&nginx_name, conf).await?;

        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), &self.namespace);
        let labels = nginx_labels(&nginx_name);
        let deployment = Deployment {
            metadata: ObjectMeta {
                name: Some(nginx_name.clone()),
                namespace: Some(self.namespace.clone()),
                labels: Some(labels.clone()),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(1),
                selector: LabelSelector {
                    match_labels: Some(BTreeMap::from([(
                        "app".to_string(),
                        nginx_name.clone(),
                    )])),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels.clone()),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: nginx_name.clone(),
                            image: Some("nginx:latest".to_string()),
                            image_pull_policy: Some("Always".to_string()),
                            ports: Some(vec![ContainerPort {
                                container_port: NGINX_PORT,
                                ..Default::default()
                            }]),
                            liveness_probe: Some(Probe {
                                http_get: Some(HTTPGetAction {
                                    path: Some("/healthz".to_string()),
                                    port: IntOrString::Int(NGINX_PORT),
                                    ..Default::default()
                                }),
                                initial_delay_seconds: Some(15),
                                period_seconds: Some(20),
                                failure_threshold: Some(1),
                                timeout_seconds: Some(5),
                                ..Default::default()
                            }),
                            volume_mounts: Some(vec![VolumeMount {
                                name: "nginx-vol".to_string(),
                                mount_path: "/etc/nginx/nginx.conf".to_string(),
                                sub_path: Some("nginx.conf".to_string()),
                                ..Default::default()
                            }]),
                            ..Default::default()
                        }],
                        volumes: Some(vec![Volume {
                            name: "nginx-vol".to_string(),
                            config_map: Some(ConfigMapVolumeSource {
                                name: config_map_name,
                                items: Some(vec![KeyToPath {
                                    key: "nginx.conf".to_string(),
                                    path: "nginx.conf".to_string(),
                                    ..Default::default()
                                }]),
                                ..Default::default()
                            }),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            status: None,
        };
        deployments
            .create(&PostParams::default(), &deployment)
            .await?;

        self.create_service(&nginx_name, SERVICE_PORT, SERVICE_PORT, labels)
            .await?;
        self.create_analysis_network_policy(analysis_name, &nginx_name)
            .await?;
        Ok(())
    }

    async fn create_nginx_config_map(&self, nginx_name: &str, conf: String) -> Result<String> {
        let config_maps: Api<ConfigMap> = Api::namespaced(self.client.clone(), &self.namespace);
        let name = format!("{}-config", nginx_name);
        let config_map = ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(self.namespace.clone()),
                labels: Some(BTreeMap::from([(
                    "component".to_string(),
                    labels::NGINX_CONFIG_MAP.to_string(),
                )])),
                ..Default::default()
            },
            data: Some(BTreeMap::from([("nginx.conf".to_string(), conf)])),
            ..Default::default()
        };
        config_maps
            .create(&PostParams::default(), &config_map)
            .await?;
        Ok(name)
    }

    /// Confine the analysis pods: ingress only from its nginx, egress
    /// only to its nginx and cluster DNS.
    async fn create_analysis_network_policy(
        &self,
        analysis_name: &str,
        nginx_name: &str,
    ) -> Result<()> {
        let policies: Api<NetworkPolicy> = Api::namespaced(self.client.clone(), &self.namespace);
        let nginx_peer = NetworkPolicyPeer {
            pod_selector: Some(LabelSelector {
                match_labels: Some(BTreeMap::from([(
                    "app".to_string(),
                    nginx_name.to_string(),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        };
        let dns_peer = NetworkPolicyPeer {
            pod_selector: Some(LabelSelector {
                match_labels: Some(BTreeMap::from([(
                    "k8s-app".to_string(),
                    "kube-dns".to_string(),
                )])),
                ..Default::default()
            }),
            namespace_selector: Some(LabelSelector {
                match_labels: Some(BTreeMap::from([(
                    "kubernetes.io/metadata.name".to_string(),
                    "kube-system".to_string(),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        };
        let policy = NetworkPolicy {
            metadata: ObjectMeta {
                name: Some(policy_name(analysis_name)),
                namespace: Some(self.namespace.clone()),
                labels: Some(BTreeMap::from([(
                    "component".to_string(),
                    labels::NGINX_POLICY.to_string(),
                )])),
                ..Default::default()
            },
            spec: Some(NetworkPolicySpec {
                pod_selector: Some(LabelSelector {
                    match_labels: Some(BTreeMap::from([(
                        "app".to_string(),
                        analysis_name.to_string(),
                    )])),
                    ..Default::default()
                }),
                policy_types: Some(vec!["Ingress".to_string(), "Egress".to_string()]),
                ingress: Some(vec![NetworkPolicyIngressRule {
                    from: Some(vec![nginx_peer.clone()]),
                    ..Default::default()
                }]),
                egress: Some(vec![NetworkPolicyEgressRule {
                    to: Some(vec![nginx_peer, dns_peer]),
                    ..Default::default()
                }]),
            }),
        };
        policies.create(&PostParams::default(), &policy).await?;
        Ok(())
    }

    /// Tear down all five resources of a generation. Missing resources
    /// are not errors.
    pub async fn delete_generation(&self, deployment_name: &str) -> Result<()> {
        println!(
            "PO ACTION - Deleting deployment {} in namespace {}",
            deployment_name.yellow(),
            self.namespace,
        );
        for name in [
            deployment_name.to_string(),
            format!("nginx-{}", deployment_name),
        ] {
            self.delete_resource(ResourceKind::Deployment, &name).await?;
            self.delete_resource(ResourceKind::Service, &name).await?;
        }
        self.delete_resource(ResourceKind::NetworkPolicy, &policy_name(deployment_name))
            .await?;
        self.delete_resource(
            ResourceKind::ConfigMap,
            &format!("nginx-{}-config", deployment_name),
        )
        .await?;
        Ok(())
    }

    /// Delete one resource by kind and name, tolerating absence.
    /// Deployments cascade to their pods (Foreground).
    pub async fn delete_resource(&self, kind: ResourceKind, name: &str) -> Result<()> {
        println!(
            "PO ACTION - Deleting resource: {} of type {} in namespace {}",
            name.yellow(),
            kind.as_str(),
            self.namespace,
        );
        let foreground = DeleteParams {
            propagation_policy: Some(PropagationPolicy::Foreground),
            ..Default::default()
        };
        let result = match kind {
            ResourceKind::Deployment => {
                let api: Api<Deployment> = Api::namespaced(self.client.clone(), &self.namespace);
                api.delete(name, &foreground).await.map(|_| ())
            }
            ResourceKind::Pod => {
                let api: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
                api.delete(name, &DeleteParams::default()).await.map(|_| ())
            }
            ResourceKind::Service => {
                let api: Api<Service> = Api::namespaced(self.client.clone(), &self.namespace);
                api.delete(name, &DeleteParams::default()).await.map(|_| ())
            }
            ResourceKind::ConfigMap => {
                let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &self.namespace);
                api.delete(name, &DeleteParams::default()).await.map(|_| ())
            }
            ResourceKind::NetworkPolicy => {
                let api: Api<NetworkPolicy> =
                    Api::namespaced(self.client.clone(), &self.namespace);
                api.delete(name, &DeleteParams::default()).await.map(|_| ())
            }
        };
        match result {
            Ok(()) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Names of resources matching a label selector.
    pub async fn list_resources(
        &self,
        kind: ResourceKind,
        selector: &str,
    ) -> Result<Vec<String>> {
        let lp = ListParams::default().labels(selector);
        let names = match kind {
            ResourceKind::Deployment => {
                let api: Api<Deployment> = Api::namespaced(self.client.clone(), &self.namespace);
                api.list(&lp)
                    .await?
                    .items
                    .into_iter()
                    .filter_map(|r| r.metadata.name)
                    .collect()
            }
            ResourceKind::Pod => {
                let api: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
                api.list(&lp)
                    .await?
                    .items
                    .into_iter()
                    .filter_map(|r| r.metadata.name)
                    .collect()
            }
            ResourceKind::Service => {
                let api: Api<Service> = Api::namespaced(self.client.clone(), &self.namespace);
                api.list(&lp)
                    .await?
                    .items
                    .into_iter()
                    .filter_map(|r| r.metadata.name)
                    .collect()
            }
            ResourceKind::ConfigMap => {
                let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &self.namespace);
                api.list(&lp)
                    .await?
                    .items
                    .into_iter()
                    .filter_map(|r| r.metadata.name)
                    .collect()
            }
            ResourceKind::NetworkPolicy => {
                let api: Api<NetworkPolicy> =
                    Api::namespaced(self.client.clone(), &self.namespace);
                api.list(&lp)
                    .await?
                    .items
                    .into_iter()
                    .filter_map(|r| r.metadata.name)
                    .collect()
            }
        };
        Ok(names)
    }

    /// Find a single resource by selector, optionally refined to the
    /// smallest name containing a substring.
    pub async fn find_resource(
        &self,
        kind: ResourceKind,
        selector: &str,
        refine: Option<&str>,
    ) -> Result<Option<String>> {
        let names = self.list_resources(kind, selector).await?;
        Ok(pick_resource(names, refine))
    }

    /// Pod names currently scheduled under `app=<name>`.
    pub async fn pods_of(&self, name: &str) -> Result<Vec<String>> {
        self.list_resources(ResourceKind::Pod, &format!("app={}", name))
            .await
    }

    /// Cluster IP of the first pod matching the selector, if assigned.
    pub async fn pod_ip(&self, selector: &str) -> Result<Option<String>> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        let list = pods.list(&ListParams::default().labels(selector)).await?;
        Ok(list
            .items
            .into_iter()
            .find_map(|p| p.status.and_then(|s| s.pod_ip)))
    }

    /// Readiness of the generation's pods, keyed by pod name in list
    /// order, or None if no pod exists.
    pub async fn get_pod_status(
        &self,
        deployment_name: &str,
    ) -> Result<Option<Vec<(String, PodProbe)>>> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        let list = pods
            .list(&ListParams::default().labels(&format!("app={}", deployment_name)))
            .await?;

        let mut statuses = Vec::new();
        for pod in list.items {
            let Some(name) = pod.metadata.name else {
                continue;
            };
            let Some(container) = pod
                .status
                .as_ref()
                .and_then(|s| s.container_statuses.as_ref())
                .and_then(|cs| cs.first())
            else {
                continue;
            };
            let probe = if container.ready {
                PodProbe {
                    ready: true,
                    reason: String::new(),
                    message: String::new(),
                }
            } else {
                let waiting = container.state.as_ref().and_then(|s| s.waiting.as_ref());
                PodProbe {
                    ready: false,
                    reason: waiting
                        .and_then(|w| w.reason.clone())
                        .unwrap_or_default(),
                    message: waiting
                        .and_then(|w| w.message.clone())
                        .unwrap_or_default(),
                }
            };
            statuses.push((name, probe));
        }
        Ok((!statuses.is_empty()).then_some(statuses))
    }

    /// Logs of the pods labeled `app=<name>`, optionally restricted to
    /// known pod ids, sanitized to printable characters.
    pub async fn get_logs(&self, name: &str, pod_ids: Option<&[String]>) -> Result<Vec<String>> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        let list = pods
            .list(&ListParams::default().labels(&format!("app={}", name)))
            .await?;

        let mut logs = Vec::new();
        for pod in list.items {
            let Some(pod_name) = pod.metadata.name else {
                continue;
            };
            if let Some(ids) = pod_ids
                && !ids.contains(&pod_name)
            {
                continue;
            }
            match pods.logs(&pod_name, &LogParams::default()).await {
                Ok(text) => logs.push(sanitize_log(&text)),
                Err(e) => {
                    eprintln!(
                        "{}",
                        format!("Error: failed to retrieve logs of pod {}: {}", pod_name, e).red()
                    );
                    return Ok(Vec::new());
                }
            }
        }
        Ok(logs)
    }

    /// Delete every pod matching the selector (their Deployment brings
    /// up replacements).
    pub async fn delete_pods(&self, selector: &str) -> Result<()> {
        for pod in self.list_resources(ResourceKind::Pod, selector).await? {
            self.delete_resource(ResourceKind::Pod, &pod).await?;
        }
        Ok(())
    }

    /// Reset the proxy half of a generation after its analysis pods
    /// were recycled: drop nginx Deployment + Service + ConfigMap and
    /// the NetworkPolicy, delete the stale analysis pods, then rebuild
    /// everything against the fresh pod IP.
    pub async fn rebuild_sidecar(&self, deployment_name: &str, project_id: &str) -> Result<()> {
        println!(
            "PO ACTION - Rebuilding sidecar of deployment {} in namespace {}",
            deployment_name.yellow(),
            self.namespace,
        );
        let nginx_name = format!("nginx-{}", deployment_name);
        self.delete_resource(ResourceKind::Deployment, &nginx_name)
            .await?;
        self.delete_resource(ResourceKind::Service, &nginx_name)
            .await?;
        self.delete_resource(ResourceKind::ConfigMap, &format!("{}-config", nginx_name))
            .await?;

        self.delete_pods(&format!("app={}", deployment_name)).await?;

        self.delete_resource(ResourceKind::NetworkPolicy, &policy_name(deployment_name))
            .await?;

        let analysis_service_name = self
            .find_resource(
                ResourceKind::Service,
                &format!("app={}", deployment_name),
                None,
            )
            .await?
            .unwrap_or_else(|| deployment_name.to_string());
        let analysis_id = analysis_id_of(deployment_name).unwrap_or(deployment_name);
        self.create_sidecar(
            deployment_name,
            &analysis_service_name,
            analysis_id,
            project_id,
        )
        .await
    }
}

/// Labels of the analysis Deployment and its pods.
pub fn analysis_labels(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".to_string(), name.to_string()),
        ("component".to_string(), labels::ANALYSIS.to_string()),
    ])
}

/// Labels of the nginx Deployment and its pods.
pub fn nginx_labels(nginx_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".to_string(), nginx_name.to_string()),
        ("component".to_string(), labels::ANALYSIS_NGINX.to_string()),
    ])
}

pub fn policy_name(analysis_name: &str) -> String {
    format!("nginx-to-{}-policy", analysis_name)
}

/// `analysis-<id>-<ordinal>` → `<id>`.
pub fn analysis_id_of(deployment_name: &str) -> Option<&str> {
    deployment_name
        .strip_prefix("analysis-")
        .and_then(|rest| rest.rsplit_once('-'))
        .map(|(id, _ordinal)| id)
}

/// Namespace this process runs in, per the mounted service account.
pub fn current_namespace() -> String {
    std::fs::read_to_string(NAMESPACE_FILE)
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "default".to_string())
}

fn pull_secret(registry: &str, user: &str, password: &str, namespace: &str) -> Result<Secret> {
    let auth = BASE64.encode(format!("{}:{}", user, password));
    let docker_config = serde_json::to_string(&serde_json::json!({
        "auths": {
            registry: {
                "username": user,
                "password": password,
                "auth": auth,
            }
        }
    }))?;
    Ok(Secret {
        metadata: ObjectMeta {
            name: Some(PULL_SECRET_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        type_: Some("kubernetes.io/dockerconfigjson".to_string()),
        string_data: Some(BTreeMap::from([
            ("docker-server".to_string(), registry.to_string()),
            ("docker-username".to_string(), user.replace('$', "\\$")),
            ("docker-password".to_string(), password.to_string()),
            (".dockerconfigjson".to_string(), docker_config),
        ])),
        ..Default::default()
    })
}

/// Keep only printable characters; pod logs occasionally carry control
/// bytes that break JSON responses downstream.
fn sanitize_log(log: &str) -> String {
    log.chars()
        .filter(|c| c.is_ascii_graphic() || matches!(c, ' ' | '\t' | '\n' | '\r'))
        .collect()
}

fn pick_resource(names: Vec<String>, refine: Option<&str>) -> Option<String> {
    if names.len() > 1 {
        if let Some(needle) = refine {
            names
                .into_iter()
                .filter(|n| n.contains(needle))
                .min_by_key(|n| n.len())
        } else {
            names.into_iter().next()
        }
    } else {
        names.into_iter().next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn analysis_id_strips_prefix_and_ordinal() {
        assert_eq!(analysis_id_of("analysis-a1-3"), Some("a1"));
        assert_eq!(
            analysis_id_of("analysis-550e8400-e29b-41d4-a716-446655440000-1"),
            Some("550e8400-e29b-41d4-a716-446655440000"),
        );
        assert_eq!(analysis_id_of("nginx-analysis-a1-3"), None);
    }

    #[test]
    fn pick_resource_prefers_smallest_refined_match() {
        let names = vec![
            "kong-kong-proxy".to_string(),
            "kong-kong-proxy-metrics".to_string(),
            "kong-kong-admin".to_string(),
        ];
        assert_eq!(
            pick_resource(names, Some("proxy")),
            Some("kong-kong-proxy".to_string()),
        );
    }

    #[test]
    fn pick_resource_passes_single_name_through() {
        assert_eq!(
            pick_resource(vec!["svc".to_string()], Some("nomatch")),
            Some("svc".to_string()),
        );
        assert_eq!(pick_resource(Vec::new(), None), None);
    }

    #[test]
    fn sanitize_strips_control_bytes() {
        assert_eq!(sanitize_log("ok\x1b[31m\nline\t2\x00"), "ok[31m\nline\t2");
    }

    #[test]
    fn pull_secret_embeds_docker_config() {
        let secret = pull_secret("harbor.example", "robot$po", "pw", "flame").unwrap();
        let data = secret.string_data.unwrap();
        assert_eq!(data["docker-server"], "harbor.example");
        assert_eq!(data["docker-username"], "robot\\$po");
        let cfg: serde_json::Value = serde_json::from_str(&data[".dockerconfigjson"]).unwrap();
        assert_eq!(cfg["auths"]["harbor.example"]["username"], "robot$po");
    }
}
