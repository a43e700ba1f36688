//! Create-or-update for owned children
//!
//! The convergence loop relies on this being idempotent: it fetches the child
//! by its deterministic name (or starts from an empty object), sets the
//! parent's controller reference, applies the caller's mutation, and only
//! then decides whether anything needs writing. Updates carry the observed
//! `resourceVersion`, so a concurrent edit surfaces as a 409 conflict.
//! Errors are returned unmodified.
//!
//! A live child counts as converged when it already carries every field the
//! operator sets. Fields the API server fills in on its own (defaults such as
//! `sessionAffinity` or `terminationMessagePath`, status, managed fields) only
//! exist on the live side and are not drift.

use std::fmt::Debug;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::api::{Api, PostParams};
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::{Error, Result};

/// What create-or-update did to the child
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    /// Child did not exist and was created
    Created,
    /// Child existed and differed from the desired state
    Updated,
    /// Child already matched; nothing was written
    Unchanged,
}

/// Compute the object to persist and the write it requires
///
/// `existing` is the live child if there is one. The returned object is the
/// live child (or a fresh one named `name` in `namespace`) with `owner` set
/// and `mutate` applied.
///
/// Fails if the live child is controlled by a different owner: the API
/// server allows only one controller reference, so the write could never
/// succeed.
pub fn prepare<K, F>(
    existing: Option<&K>,
    name: &str,
    namespace: &str,
    owner: &OwnerReference,
    mutate: F,
) -> Result<(K, Operation)>
where
    K: Resource + Clone + Default + Serialize,
    F: FnOnce(&mut K),
{
    let mut obj = match existing {
        Some(live) => {
            ensure_not_foreign(live.meta(), name, owner)?;
            live.clone()
        }
        None => {
            let mut fresh = K::default();
            fresh.meta_mut().name = Some(name.to_string());
            fresh.meta_mut().namespace = Some(namespace.to_string());
            fresh
        }
    };

    set_owner(obj.meta_mut(), owner);
    mutate(&mut obj);

    let operation = match existing {
        None => Operation::Created,
        Some(live) => {
            if converged(live, &obj)? {
                Operation::Unchanged
            } else {
                Operation::Updated
            }
        }
    };
    Ok((obj, operation))
}

fn ensure_not_foreign(meta: &ObjectMeta, name: &str, owner: &OwnerReference) -> Result<()> {
    let foreign = meta
        .owner_references
        .iter()
        .flatten()
        .find(|r| r.controller == Some(true) && r.uid != owner.uid);
    match foreign {
        Some(other) => Err(Error::validation(format!(
            "{name} is already controlled by {} {} (uid {}), refusing to take over",
            other.kind, other.name, other.uid
        ))),
        None => Ok(()),
    }
}

/// Upsert `owner` into the owner references, keyed by uid
fn set_owner(meta: &mut ObjectMeta, owner: &OwnerReference) {
    let refs = meta.owner_references.get_or_insert_with(Vec::new);
    match refs.iter_mut().find(|r| r.uid == owner.uid) {
        Some(existing) => *existing = owner.clone(),
        None => refs.push(owner.clone()),
    }
}

/// Whether `live` already carries everything set on `desired`
fn converged<K: Serialize>(live: &K, desired: &K) -> Result<bool> {
    let live = serde_json::to_value(live).map_err(|e| Error::serialization(e.to_string()))?;
    let desired =
        serde_json::to_value(desired).map_err(|e| Error::serialization(e.to_string()))?;
    Ok(contains(&live, &desired))
}

/// Structural containment: every field of `desired` is present in `live`
/// with a contained value. Lists must match element by element.
fn contains(live: &Value, desired: &Value) -> bool {
    match (live, desired) {
        (_, Value::Null) => true,
        (Value::Object(live), Value::Object(desired)) => {
            desired.iter().all(|(key, want)| match live.get(key) {
                Some(have) => contains(have, want),
                None => is_empty(want),
            })
        }
        (Value::Array(live), Value::Array(desired)) => {
            live.len() == desired.len()
                && live.iter().zip(desired).all(|(have, want)| contains(have, want))
        }
        (live, desired) => live == desired,
    }
}

/// The API server drops empty maps and lists, so their absence is no drift
fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::Array(list) => list.is_empty(),
        _ => false,
    }
}

/// Fetch, mutate and persist a namespaced child through `api`
pub async fn create_or_update<K, F>(
    api: &Api<K>,
    name: &str,
    namespace: &str,
    owner: &OwnerReference,
    mutate: F,
) -> Result<Operation>
where
    K: Resource + Clone + Default + Serialize + DeserializeOwned + Debug,
    F: FnOnce(&mut K),
{
    let existing = api.get_opt(name).await?;
    let (obj, operation) = prepare(existing.as_ref(), name, namespace, owner, mutate)?;

    match operation {
        Operation::Created => {
            api.create(&PostParams::default(), &obj).await?;
        }
        Operation::Updated => {
            api.replace(name, &PostParams::default(), &obj).await?;
        }
        Operation::Unchanged => {}
    }

    debug!(child = %name, ?operation, "create-or-update finished");
    Ok(operation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Service, ServiceSpec};
    use kube::ResourceExt;
    use serde_json::json;

    fn owner(uid: &str) -> OwnerReference {
        OwnerReference {
            api_version: "v1".to_string(),
            kind: "Service".to_string(),
            name: "web".to_string(),
            uid: uid.to_string(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }

    fn set_type(svc: &mut Service) {
        svc.spec = Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            cluster_ip: Some("None".to_string()),
            ..Default::default()
        });
    }

    fn created() -> Service {
        prepare::<Service, _>(None, "web-tailscale", "default", &owner("u1"), set_type)
            .unwrap()
            .0
    }

    /// What the API server hands back after storing `created()`
    fn stored() -> Service {
        let mut live = created();
        live.metadata.resource_version = Some("42".to_string());
        live.metadata.uid = Some("child-uid".to_string());
        let spec = live.spec.as_mut().unwrap();
        spec.session_affinity = Some("None".to_string());
        spec.cluster_ips = Some(vec!["None".to_string()]);
        spec.ip_families = Some(vec!["IPv4".to_string()]);
        spec.ip_family_policy = Some("SingleStack".to_string());
        live
    }

    #[test]
    fn missing_child_is_created_with_identity_and_owner() {
        let (obj, op) =
            prepare::<Service, _>(None, "web-tailscale", "default", &owner("u1"), set_type)
                .unwrap();

        assert_eq!(op, Operation::Created);
        assert_eq!(obj.name_any(), "web-tailscale");
        assert_eq!(obj.namespace().as_deref(), Some("default"));
        assert_eq!(obj.owner_references(), &[owner("u1")]);
        assert_eq!(obj.spec.unwrap().type_.as_deref(), Some("ClusterIP"));
    }

    #[test]
    fn matching_child_is_unchanged() {
        let live = created();
        let (_, op) =
            prepare(Some(&live), "web-tailscale", "default", &owner("u1"), set_type).unwrap();
        assert_eq!(op, Operation::Unchanged);
    }

    #[test]
    fn server_defaulted_child_is_unchanged() {
        let live = stored();
        let (_, op) =
            prepare(Some(&live), "web-tailscale", "default", &owner("u1"), set_type).unwrap();
        assert_eq!(op, Operation::Unchanged);
    }

    #[test]
    fn drifted_managed_field_is_updated_and_keeps_resource_version() {
        let mut live = stored();
        live.spec.as_mut().unwrap().type_ = Some("NodePort".to_string());

        let (obj, op) =
            prepare(Some(&live), "web-tailscale", "default", &owner("u1"), set_type).unwrap();
        assert_eq!(op, Operation::Updated);
        assert_eq!(obj.resource_version().as_deref(), Some("42"));
        assert_eq!(obj.spec.unwrap().type_.as_deref(), Some("ClusterIP"));
    }

    #[test]
    fn missing_spec_is_updated() {
        let mut live = stored();
        live.spec = None;
        let (obj, op) =
            prepare(Some(&live), "web-tailscale", "default", &owner("u1"), set_type).unwrap();
        assert_eq!(op, Operation::Updated);
        assert!(obj.spec.is_some());
    }

    #[test]
    fn owner_reference_is_not_duplicated() {
        let live = created();
        let (obj, _) =
            prepare(Some(&live), "web-tailscale", "default", &owner("u1"), set_type).unwrap();
        assert_eq!(obj.owner_references().len(), 1);
    }

    #[test]
    fn non_controller_owner_references_are_kept() {
        let mut live = Service::default();
        live.metadata.owner_references = Some(vec![OwnerReference {
            controller: None,
            ..owner("other")
        }]);

        let (obj, op) =
            prepare(Some(&live), "web-tailscale", "default", &owner("u1"), set_type).unwrap();
        assert_eq!(op, Operation::Updated);
        let uids: Vec<_> = obj.owner_references().iter().map(|r| r.uid.as_str()).collect();
        assert_eq!(uids, vec!["other", "u1"]);
    }

    #[test]
    fn child_controlled_by_another_owner_is_rejected() {
        let mut live = stored();
        live.metadata.owner_references = Some(vec![OwnerReference {
            name: "web-2".to_string(),
            ..owner("someone-else")
        }]);

        let err = prepare(Some(&live), "web-tailscale", "default", &owner("u1"), set_type)
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(err.to_string().contains("someone-else"));
    }

    #[test]
    fn containment_ignores_extra_live_fields() {
        let live = json!({"a": 1, "b": {"c": [ {"d": 1, "e": 2} ]}, "status": {}});
        assert!(contains(&live, &json!({"a": 1, "b": {"c": [ {"d": 1} ]}})));
        assert!(!contains(&live, &json!({"a": 2})));
        assert!(!contains(&live, &json!({"b": {"c": [ {"d": 1}, {"d": 1} ]}})));
        assert!(contains(&live, &json!({"labels": {}, "items": []})));
        assert!(!contains(&live, &json!({"missing": "x"})));
    }
}
