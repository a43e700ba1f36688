//! Desired state for the children of an enabled Service
//!
//! [`build`] turns a parent Service plus the startup templates into the
//! exact labels and specs each child must carry. It reads only its inputs
//! and never touches the parent.
//!
//! Whenever a child is written its spec is replaced wholesale, so there is no
//! field-level merge. A child whose live spec already carries every templated
//! field is left alone; extra fields defaulted by the API server are not drift.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{Container, EnvVar, Service, ServiceSpec};
use kube::ResourceExt;

use super::naming::{child_name, pod_hostname, selector_labels, SELECTOR_LABEL};
use crate::template::Templates;
use crate::{Error, Result};

/// Env var telling the agent where to forward tailnet traffic
pub const DEST_IP_ENV: &str = "DEST_IP";

/// Desired routing Service
#[derive(Clone, Debug, PartialEq)]
pub struct ChildService {
    /// Object name
    pub name: String,
    /// Object namespace (always the parent's)
    pub namespace: String,
    /// Labels managed by the operator
    pub labels: BTreeMap<String, String>,
    /// Full spec, replacing whatever the live object has
    pub spec: ServiceSpec,
}

impl ChildService {
    /// Apply managed labels and replace the spec on a live or fresh object
    pub fn apply_to(&self, service: &mut Service) {
        service.labels_mut().extend(self.labels.clone());
        service.spec = Some(self.spec.clone());
    }
}

/// Desired Tailscale StatefulSet
#[derive(Clone, Debug, PartialEq)]
pub struct ChildStatefulSet {
    /// Object name
    pub name: String,
    /// Object namespace (always the parent's)
    pub namespace: String,
    /// Labels managed by the operator
    pub labels: BTreeMap<String, String>,
    /// Full spec, replacing whatever the live object has
    pub spec: StatefulSetSpec,
}

impl ChildStatefulSet {
    /// Apply managed labels and replace the spec on a live or fresh object
    pub fn apply_to(&self, stateful_set: &mut StatefulSet) {
        stateful_set.labels_mut().extend(self.labels.clone());
        stateful_set.spec = Some(self.spec.clone());
    }
}

/// Both children of one parent
#[derive(Clone, Debug, PartialEq)]
pub struct DesiredChildren {
    /// Headless Service fronting the agent pods
    pub routing: ChildService,
    /// Agent StatefulSet
    pub stateful_set: ChildStatefulSet,
}

/// Compute the desired children for `parent`
///
/// Fails only when the parent lacks the identity (namespace, uid) that the
/// children are derived from.
pub fn build(parent: &Service, templates: &Templates) -> Result<DesiredChildren> {
    let parent_name = parent.name_any();
    let namespace = parent
        .namespace()
        .ok_or_else(|| Error::validation(format!("Service {parent_name} has no namespace")))?;
    let uid = parent
        .uid()
        .ok_or_else(|| Error::validation(format!("Service {namespace}/{parent_name} has no uid")))?;
    let cluster_ip = parent
        .spec
        .as_ref()
        .and_then(|s| s.cluster_ip.clone())
        .unwrap_or_default();

    let name = child_name(&parent_name);
    let labels = selector_labels(&parent_name);

    let mut routing_spec = templates.service.clone();
    routing_spec
        .selector
        .get_or_insert_with(BTreeMap::new)
        .insert(SELECTOR_LABEL.to_string(), parent_name.clone());

    let mut sts_spec = templates.stateful_set.clone();
    sts_spec
        .selector
        .match_labels
        .get_or_insert_with(BTreeMap::new)
        .insert(SELECTOR_LABEL.to_string(), parent_name.clone());
    sts_spec
        .template
        .metadata
        .get_or_insert_with(Default::default)
        .labels
        .get_or_insert_with(BTreeMap::new)
        .insert(SELECTOR_LABEL.to_string(), parent_name.clone());
    let pod = sts_spec.template.spec.get_or_insert_with(Default::default);
    pod.hostname = Some(pod_hostname(&parent_name, &uid));
    if let Some(agent) = pod.containers.first_mut() {
        add_or_update_env(agent, DEST_IP_ENV, &cluster_ip);
    }
    sts_spec.service_name = name.clone().into();

    Ok(DesiredChildren {
        routing: ChildService {
            name: name.clone(),
            namespace: namespace.clone(),
            labels: labels.clone(),
            spec: routing_spec,
        },
        stateful_set: ChildStatefulSet {
            name,
            namespace,
            labels,
            spec: sts_spec,
        },
    })
}

/// Set `key=value` on the container, overwriting an existing entry in place
///
/// Any `valueFrom` on the existing entry is dropped so the literal wins.
pub fn add_or_update_env(container: &mut Container, key: &str, value: &str) {
    let env = container.env.get_or_insert_with(Vec::new);
    match env.iter_mut().find(|e| e.name == key) {
        Some(existing) => {
            existing.value = Some(value.to_string());
            existing.value_from = None;
        }
        None => env.push(EnvVar {
            name: key.to_string(),
            value: Some(value.to_string()),
            value_from: None,
        }),
    }
}
