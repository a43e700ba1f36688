//! Object templates for the managed children
//!
//! Two YAML files are loaded once at startup:
//!
//! - a `Service` whose `spec` becomes the routing Service spec
//! - a `StatefulSet` whose `spec` becomes the Tailscale StatefulSet spec
//!
//! Only the `spec` of each document is used; metadata is derived from the
//! parent at reconcile time. Any problem here is a configuration error and
//! aborts startup, so the reconcile path can rely on a well-formed template
//! (in particular, at least one container in the pod template).

use std::path::Path;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{Service, ServiceSpec};
use tracing::{debug, info};

use crate::{Error, Result};

/// Parsed and validated child templates
#[derive(Clone, Debug, PartialEq)]
pub struct Templates {
    /// Spec copied wholesale onto the routing Service
    pub service: ServiceSpec,
    /// Spec copied wholesale onto the StatefulSet
    pub stateful_set: StatefulSetSpec,
}

impl Templates {
    /// Read and validate both templates from disk
    pub async fn load(service_path: &Path, stateful_set_path: &Path) -> Result<Self> {
        let service_yaml = read(service_path).await?;
        let stateful_set_yaml = read(stateful_set_path).await?;

        let templates = Self::from_yaml(&service_yaml, &stateful_set_yaml)?;
        info!(
            service_template = %service_path.display(),
            stateful_set_template = %stateful_set_path.display(),
            "loaded child templates"
        );
        Ok(templates)
    }

    /// Parse and validate both templates from YAML text
    pub fn from_yaml(service_yaml: &str, stateful_set_yaml: &str) -> Result<Self> {
        let service: Service = serde_yaml::from_str(service_yaml)
            .map_err(|e| Error::template(format!("routing Service template: {e}")))?;
        let stateful_set: StatefulSet = serde_yaml::from_str(stateful_set_yaml)
            .map_err(|e| Error::template(format!("StatefulSet template: {e}")))?;

        let templates = Self {
            service: service
                .spec
                .ok_or_else(|| Error::template("routing Service template has no spec"))?,
            stateful_set: stateful_set
                .spec
                .ok_or_else(|| Error::template("StatefulSet template has no spec"))?,
        };
        templates.validate()?;
        Ok(templates)
    }

    /// Override the image of the agent container (the first container)
    pub fn with_image(mut self, image: Option<String>) -> Self {
        if let Some(image) = image {
            if let Some(container) = self
                .stateful_set
                .template
                .spec
                .as_mut()
                .and_then(|pod| pod.containers.first_mut())
            {
                debug!(container = %container.name, %image, "overriding agent image");
                container.image = Some(image);
            }
        }
        self
    }

    fn validate(&self) -> Result<()> {
        let has_container = self
            .stateful_set
            .template
            .spec
            .as_ref()
            .is_some_and(|pod| !pod.containers.is_empty());
        if !has_container {
            return Err(Error::template(
                "StatefulSet template must define at least one container",
            ));
        }
        Ok(())
    }
}

async fn read(path: &Path) -> Result<String> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|e| Error::template(format!("failed to read {}: {e}", path.display())))
}

#[cfg(test)]
pub(crate) mod fixtures {
    /// Minimal headless routing Service
    pub const SERVICE_YAML: &str = r#"
apiVersion: v1
kind: Service
metadata:
  name: template
spec:
  clusterIP: None
  selector:
    app: tailscale
"#;

    /// Minimal agent StatefulSet with one container
    pub const STATEFUL_SET_YAML: &str = r#"
apiVersion: apps/v1
kind: StatefulSet
metadata:
  name: template
spec:
  replicas: 1
  serviceName: template
  selector:
    matchLabels:
      app: tailscale
  template:
    metadata:
      labels:
        app: tailscale
    spec:
      containers:
        - name: tailscale
          image: tailscale/tailscale:stable
          env:
            - name: TS_KUBE_SECRET
              value: tailscale-auth
"#;

    pub fn templates() -> super::Templates {
        super::Templates::from_yaml(SERVICE_YAML, STATEFUL_SET_YAML)
            .expect("fixture templates are valid")
    }
}
