use std::time::Duration;

use flame_common::labels;
use owo_colors::OwoColorize;

use super::{Cluster, NGINX_PORT, ResourceKind, Result};

/// Everything the proxy configuration needs to know about its
/// neighborhood. Some of these only exist once the analysis Deployment
/// has scheduled a pod, so resolution polls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discovery {
    pub message_broker_service: String,
    pub message_broker_ip: String,
    pub po_service: String,
    pub po_ip: String,
    pub hub_adapter_service: String,
    pub kong_proxy_service: String,
    pub result_service: String,
    pub analysis_ip: String,
}

const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Resolve all upstream services and pod IPs for one analysis, polling
/// at one-second intervals until each lookup returns. There is no hard
/// deadline; the caller (an HTTP request) can be aborted by the user.
pub async fn discover(cluster: &Cluster, analysis_name: &str) -> Result<Discovery> {
    let message_broker_service =
        wait_service(cluster, &component(labels::MESSAGE_BROKER), None).await?;
    let message_broker_ip = wait_pod_ip(cluster, &component(labels::MESSAGE_BROKER)).await?;

    let po_service = wait_service(cluster, &component(labels::POD_ORCHESTRATOR), None).await?;
    let po_ip = wait_pod_ip(cluster, &component(labels::POD_ORCHESTRATOR)).await?;

    let hub_adapter_service = wait_service(cluster, &component(labels::HUB_ADAPTER), None).await?;
    let kong_proxy_service =
        wait_service(cluster, "app.kubernetes.io/name=kong", Some("proxy")).await?;
    let result_service = wait_service(cluster, &component(labels::RESULT_SERVICE), None).await?;

    let analysis_ip = wait_pod_ip(cluster, &format!("app={}", analysis_name)).await?;

    Ok(Discovery {
        message_broker_service,
        message_broker_ip,
        po_service,
        po_ip,
        hub_adapter_service,
        kong_proxy_service,
        result_service,
        analysis_ip,
    })
}

fn component(value: &str) -> String {
    format!("component={}", value)
}

async fn wait_service(
    cluster: &Cluster,
    selector: &str,
    refine: Option<&str>,
) -> Result<String> {
    loop {
        if let Some(name) = cluster
            .find_resource(ResourceKind::Service, selector, refine)
            .await?
        {
            return Ok(name);
        }
        println!(
            "⏳ {}{}",
            "Waiting for service ".dimmed(),
            selector.dimmed(),
        );
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

async fn wait_pod_ip(cluster: &Cluster, selector: &str) -> Result<String> {
    loop {
        if let Some(ip) = cluster.pod_ip(selector).await? {
            return Ok(ip);
        }
        println!(
            "⏳ {}{}",
            "Waiting for pod IP of ".dimmed(),
            selector.dimmed(),
        );
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Render the proxy routing table for one analysis. Every outbound
/// location is allow-listed to the analysis pod IP; the inbound
/// `/analysis` route admits only the message broker and this
/// orchestrator.
pub fn render_nginx_conf(
    d: &Discovery,
    analysis_service_name: &str,
    analysis_id: &str,
    project_id: &str,
) -> String {
    format!(
        r#"worker_processes 1;
events {{ worker_connections 1024; }}
http {{
    sendfile on;

    server {{
        listen {nginx_port};

        client_max_body_size 0;
        chunked_transfer_encoding on;

        proxy_redirect off;
        proxy_set_header Host $host;
        proxy_set_header X-Real-IP $remote_addr;
        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;
        proxy_set_header X-Forwarded-Proto $scheme;

        # health check
        location /healthz {{
            return 200 'healthy';
        }}
        # analysis deployment to kong
        location /kong {{
            rewrite     ^/kong(/.*) $1 break;
            proxy_pass  http://{kong_proxy};
            allow       {analysis_ip};
            deny        all;
        }}

        location ~ ^/storage/(final|local|intermediate)/ {{
            rewrite     ^/storage(/.*) $1 break;
            proxy_pass  http://{result_service}:8080;
            allow       {analysis_ip};
            deny        all;
        }}

        location /hub-adapter/kong/datastore/{project_id} {{
            rewrite     ^/hub-adapter(/.*) $1 break;
            proxy_pass  http://{hub_adapter}:5000;
            allow       {analysis_ip};
            deny        all;
        }}

        # analysis deployment to message broker: participants
        location ~ ^/message-broker/analyses/{analysis_id}/participants(|/self) {{
            rewrite     ^/message-broker(/.*) $1 break;
            proxy_pass  http://{message_broker};
            allow       {analysis_ip};
            deny        all;
        }}

        # analysis deployment to message broker: analysis messages
        location ~ ^/message-broker/analyses/{analysis_id}/messages(|/subscriptions) {{
            rewrite     ^/message-broker(/.*) $1 break;
            proxy_pass  http://{message_broker};
            allow       {analysis_ip};
            deny        all;
        }}
        # analysis deployment to message broker: healthz
        location /message-broker/healthz {{
            rewrite     ^/message-broker(/.*) $1 break;
            proxy_pass  http://{message_broker};
            allow       {analysis_ip};
            deny        all;
        }}

        # analysis deployment to po log stream
        location /po/stream_logs {{
            proxy_pass  http://{po_service}:8000;
            allow       {analysis_ip};
            deny        all;
            proxy_connect_timeout 10s;
            proxy_send_timeout    120s;
            proxy_read_timeout    120s;
            send_timeout          120s;
        }}

        # message-broker/pod-orchestration to analysis deployment
        location /analysis {{
            rewrite     ^/analysis(/.*) $1 break;
            proxy_pass  http://{analysis_service};
            allow       {message_broker_ip};
            allow       {po_ip};
            deny        all;
        }}
    }}
}}
"#,
        nginx_port = NGINX_PORT,
        kong_proxy = d.kong_proxy_service,
        result_service = d.result_service,
        hub_adapter = d.hub_adapter_service,
        message_broker = d.message_broker_service,
        po_service = d.po_service,
        analysis_service = analysis_service_name,
        analysis_ip = d.analysis_ip,
        message_broker_ip = d.message_broker_ip,
        po_ip = d.po_ip,
        analysis_id = analysis_id,
        project_id = project_id,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn discovery() -> Discovery {
        Discovery {
            message_broker_service: "flame-node-message-broker".to_string(),
            message_broker_ip: "10.0.0.5".to_string(),
            po_service: "flame-node-po".to_string(),
            po_ip: "10.0.0.6".to_string(),
            hub_adapter_service: "flame-node-hub-adapter".to_string(),
            kong_proxy_service: "kong-kong-proxy".to_string(),
            result_service: "flame-node-result-service".to_string(),
            analysis_ip: "10.0.0.42".to_string(),
        }
    }

    #[test]
    fn conf_routes_every_prefix() {
        let conf = render_nginx_conf(&discovery(), "analysis-a1-1", "a1", "p1");
        assert!(conf.contains("location /healthz"));
        assert!(conf.contains("proxy_pass  http://kong-kong-proxy;"));
        assert!(conf.contains("proxy_pass  http://flame-node-result-service:8080;"));
        assert!(conf.contains("location /hub-adapter/kong/datastore/p1"));
        assert!(conf.contains("location ~ ^/message-broker/analyses/a1/participants(|/self)"));
        assert!(conf.contains("location ~ ^/message-broker/analyses/a1/messages(|/subscriptions)"));
        assert!(conf.contains("proxy_pass  http://flame-node-po:8000;"));
        assert!(conf.contains("proxy_pass  http://analysis-a1-1;"));
    }

    #[test]
    fn outbound_routes_allow_only_the_analysis_pod() {
        let conf = render_nginx_conf(&discovery(), "analysis-a1-1", "a1", "p1");
        // Every outbound location carries the analysis pod allow-list.
        assert_eq!(conf.matches("allow       10.0.0.42;").count(), 7);
        assert_eq!(conf.matches("deny        all;").count(), 8);
    }

    #[test]
    fn inbound_route_admits_broker_and_orchestrator() {
        let conf = render_nginx_conf(&discovery(), "analysis-a1-1", "a1", "p1");
        let inbound = conf.split("location /analysis {").nth(1).unwrap();
        assert!(inbound.contains("allow       10.0.0.5;"));
        assert!(inbound.contains("allow       10.0.0.6;"));
    }
}
