//! Tests against the templates shipped in `templates/`
//!
//! These tell the story of a fresh install: the operator starts with the
//! default templates and renders children for a typical user Service.

use std::path::PathBuf;

use k8s_openapi::api::core::v1::{Service, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use tailscale_operator::controller::{build, DEST_IP_ENV};
use tailscale_operator::template::Templates;

fn template_path(file: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("templates")
        .join(file)
}

async fn shipped_templates() -> Templates {
    Templates::load(&template_path("svc.yaml"), &template_path("sts.yaml"))
        .await
        .expect("shipped templates must load")
}

fn user_service() -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some("web".to_string()),
            namespace: Some("shop".to_string()),
            uid: Some("abcd1234-5678-90ab-cdef-000000000000".to_string()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            cluster_ip: Some("10.0.0.5".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Story: the default templates load and describe a headless Service and
/// a single-replica agent StatefulSet.
#[tokio::test]
async fn story_shipped_templates_load() {
    let templates = shipped_templates().await;

    assert_eq!(templates.service.cluster_ip.as_deref(), Some("None"));
    assert_eq!(templates.stateful_set.replicas, Some(1));
    let pod = templates.stateful_set.template.spec.as_ref().unwrap();
    assert_eq!(pod.containers[0].name, "tailscale");
}

/// Story: a user Service rendered against the defaults yields children whose
/// selectors line up with the pod labels, so the routing Service finds the
/// agent pods.
#[tokio::test]
async fn story_rendered_children_select_each_other() {
    let children = build(&user_service(), &shipped_templates().await).unwrap();

    let routing_selector = children.routing.spec.selector.clone().unwrap();
    let pod_labels = children
        .stateful_set
        .spec
        .template
        .metadata
        .clone()
        .unwrap()
        .labels
        .unwrap();
    let match_labels = children
        .stateful_set
        .spec
        .selector
        .match_labels
        .clone()
        .unwrap();

    for (key, value) in routing_selector.iter().chain(match_labels.iter()) {
        assert_eq!(pod_labels.get(key), Some(value), "pod label {key}");
    }
    assert_eq!(children.routing.namespace, "shop");
}

/// Story: the agent learns where to forward traffic, and the template's own
/// env (including secret references) is left intact.
#[tokio::test]
async fn story_agent_env_points_at_parent() {
    let templates = shipped_templates()
        .await
        .with_image(Some("ghcr.io/tailscale/tailscale:v1.80.0".to_string()));
    let children = build(&user_service(), &templates).unwrap();

    let pod = children.stateful_set.spec.template.spec.as_ref().unwrap();
    let agent = &pod.containers[0];
    let env = agent.env.as_ref().unwrap();

    let dest: Vec<_> = env.iter().filter(|e| e.name == DEST_IP_ENV).collect();
    assert_eq!(dest.len(), 1);
    assert_eq!(dest[0].value.as_deref(), Some("10.0.0.5"));

    let auth = env.iter().find(|e| e.name == "TS_AUTH_KEY").unwrap();
    assert!(auth.value_from.is_some());

    assert_eq!(
        agent.image.as_deref(),
        Some("ghcr.io/tailscale/tailscale:v1.80.0")
    );
    assert_eq!(pod.hostname.as_deref(), Some("web-abcd1234"));
}
