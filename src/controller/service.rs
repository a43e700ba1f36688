//! Service controller implementation
//!
//! Reconciles every `Service` in the watched scope. Each pass starts from a
//! fresh read of the Service and then either provisions or tears down:
//!
//! - **Provision** (enable annotation is `"true"` and no deletion pending):
//!   attach the finalizer first, then create-or-update the routing Service
//!   and the StatefulSet, in that order.
//! - **Teardown** (anything else): if our finalizer is present, remove it;
//!   otherwise there is nothing to do and nothing is written.
//!
//! The pass keeps no state of its own. Per-key serialization comes from the
//! controller runtime, and every write to the parent is a `replace` carrying
//! the observed `resourceVersion`, so races surface as retryable conflicts.
//! Children are never deleted here; the API server garbage-collects them
//! through their owner reference when the parent goes away.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, PostParams};
use kube::runtime::controller::Action;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, instrument};

#[cfg(test)]
use mockall::automock;

use super::apply::{self, Operation};
use super::desired::{self, ChildService, ChildStatefulSet};
use crate::retry::ErrorBackoff;
use crate::template::Templates;
use crate::{Error, DEVICE_ID_ANNOTATION, ENABLE_ANNOTATION, FINALIZER};

/// Trait abstracting the Kubernetes operations the controller performs
///
/// This trait allows mocking the Kubernetes client in tests while using
/// the real client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Fetch the latest version of a Service, `None` if it no longer exists
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>, Error>;

    /// Replace a Service, failing with a conflict if its `resourceVersion` is stale
    async fn replace_service(&self, service: &Service) -> Result<Service, Error>;

    /// Create-or-update the routing Service owned by `owner`
    async fn apply_routing_service(
        &self,
        owner: &OwnerReference,
        child: &ChildService,
    ) -> Result<Operation, Error>;

    /// Create-or-update the StatefulSet owned by `owner`
    async fn apply_stateful_set(
        &self,
        owner: &OwnerReference,
        child: &ChildStatefulSet,
    ) -> Result<Operation, Error>;
}

/// Real Kubernetes client implementation
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    /// Create a new KubeClientImpl wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>, Error> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn replace_service(&self, service: &Service) -> Result<Service, Error> {
        let name = service.name_any();
        let namespace = service
            .namespace()
            .ok_or_else(|| Error::validation(format!("Service {name} has no namespace")))?;
        let api: Api<Service> = Api::namespaced(self.client.clone(), &namespace);
        Ok(api.replace(&name, &PostParams::default(), service).await?)
    }

    async fn apply_routing_service(
        &self,
        owner: &OwnerReference,
        child: &ChildService,
    ) -> Result<Operation, Error> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), &child.namespace);
        apply::create_or_update(&api, &child.name, &child.namespace, owner, |svc| {
            child.apply_to(svc)
        })
        .await
    }

    async fn apply_stateful_set(
        &self,
        owner: &OwnerReference,
        child: &ChildStatefulSet,
    ) -> Result<Operation, Error> {
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), &child.namespace);
        apply::create_or_update(&api, &child.name, &child.namespace, owner, |sts| {
            child.apply_to(sts)
        })
        .await
    }
}

/// Controller context shared across all reconcile calls
pub struct Context {
    /// Kubernetes client for API operations (trait object for testability)
    pub kube: Arc<dyn KubeClient>,
    /// Child templates loaded at startup
    pub templates: Arc<Templates>,
    /// Failure tracking for the error policy
    pub backoff: Arc<ErrorBackoff>,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client, templates: Templates) -> ContextBuilder {
        ContextBuilder::new(client, templates)
    }

    /// Create a context for testing with a mock or fake client
    #[cfg(test)]
    pub fn for_testing(kube: Arc<dyn KubeClient>, templates: Templates) -> Self {
        Self {
            kube,
            templates: Arc::new(templates),
            backoff: Arc::new(ErrorBackoff::default()),
        }
    }
}

/// Builder for constructing [`Context`] instances
///
/// ```ignore
/// let backoff = Arc::new(ErrorBackoff::default());
/// let ctx = Context::builder(client, templates)
///     .backoff(backoff.clone())
///     .build();
/// ```
pub struct ContextBuilder {
    client: Client,
    templates: Templates,
    backoff: Option<Arc<ErrorBackoff>>,
}

impl ContextBuilder {
    fn new(client: Client, templates: Templates) -> Self {
        Self {
            client,
            templates,
            backoff: None,
        }
    }

    /// Share a failure tracker with the controller run loop
    pub fn backoff(mut self, backoff: Arc<ErrorBackoff>) -> Self {
        self.backoff = Some(backoff);
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        Context {
            kube: Arc::new(KubeClientImpl::new(self.client)),
            templates: Arc::new(self.templates),
            backoff: self.backoff.unwrap_or_default(),
        }
    }
}

// =============================================================================
// Annotation accessors
// =============================================================================

/// Whether the enable annotation is set to `"true"`, compared lowercase
///
/// Absent or any other value means disabled.
pub fn is_enabled(service: &Service) -> bool {
    service
        .annotations()
        .get(ENABLE_ANNOTATION)
        .is_some_and(|v| v.to_lowercase() == "true")
}

/// Whether the Service should currently be fronted by Tailscale
pub fn wants_tailscale(service: &Service) -> bool {
    is_enabled(service) && service.meta().deletion_timestamp.is_none()
}

/// Tailnet device ID recorded on the Service, if any
pub fn device_id(service: &Service) -> Option<&str> {
    service
        .annotations()
        .get(DEVICE_ID_ANNOTATION)
        .map(String::as_str)
}

/// Whether our finalizer is present
pub fn has_finalizer(service: &Service) -> bool {
    service.finalizers().iter().any(|f| f == FINALIZER)
}

/// Key used to track consecutive failures for one Service
pub fn backoff_key(namespace: Option<&str>, name: &str) -> String {
    format!("{}/{}", namespace.unwrap_or_default(), name)
}

// =============================================================================
// Reconciliation
// =============================================================================

/// Reconcile a Service
///
/// The object handed in by the controller runtime only identifies the key;
/// the pass always works on a freshly fetched copy. A Service that no
/// longer exists is not an error.
#[instrument(
    skip(service, ctx),
    fields(service = %service.name_any(), namespace = %service.namespace().unwrap_or_default())
)]
pub async fn reconcile(service: Arc<Service>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = service.name_any();
    let namespace = service
        .namespace()
        .ok_or_else(|| Error::validation(format!("Service {name} has no namespace")))?;

    let Some(current) = ctx.kube.get_service(&namespace, &name).await? else {
        debug!("service no longer exists, nothing to do");
        return Ok(Action::await_change());
    };

    if wants_tailscale(&current) {
        provision(current, &ctx).await
    } else {
        teardown(current, &ctx).await
    }
}

/// Attach the finalizer, then converge both children
async fn provision(mut service: Service, ctx: &Context) -> Result<Action, Error> {
    if !has_finalizer(&service) {
        service.finalizers_mut().push(FINALIZER.to_string());
        service = ctx.kube.replace_service(&service).await?;
        info!("attached finalizer");
    }

    let owner = service
        .controller_owner_ref(&())
        .ok_or_else(|| Error::validation(format!("Service {} has no uid", service.name_any())))?;
    let children = desired::build(&service, &ctx.templates)?;

    let routing = ctx
        .kube
        .apply_routing_service(&owner, &children.routing)
        .await?;
    log_operation("Service", &children.routing.name, routing);

    let stateful_set = ctx
        .kube
        .apply_stateful_set(&owner, &children.stateful_set)
        .await?;
    log_operation("StatefulSet", &children.stateful_set.name, stateful_set);

    // Tailnet IP and device ID back-fill needs a control-plane client; the
    // annotations stay unset until one exists.
    debug!("service provisioned");
    Ok(Action::await_change())
}

/// Remove the finalizer if we ever provisioned this Service
///
/// Children are left in place; they go away with the parent through
/// owner-reference garbage collection.
async fn teardown(mut service: Service, ctx: &Context) -> Result<Action, Error> {
    if !has_finalizer(&service) {
        debug!("not managed, nothing to tear down");
        return Ok(Action::await_change());
    }

    if let Some(device) = device_id(&service) {
        info!(device_id = %device, "tailnet device deregistration is not implemented, leaving device in place");
    }

    service.finalizers_mut().retain(|f| f != FINALIZER);
    ctx.kube.replace_service(&service).await?;
    info!("removed finalizer");
    Ok(Action::await_change())
}

fn log_operation(kind: &str, name: &str, operation: Operation) {
    match operation {
        Operation::Created => info!(kind, child = %name, "created child"),
        Operation::Updated => info!(kind, child = %name, "updated child"),
        Operation::Unchanged => debug!(kind, child = %name, "child up to date"),
    }
}

/// Error policy for the Service controller
///
/// Requeues with exponential backoff per Service; the run loop resets the
/// count after the next successful reconcile.
pub fn error_policy(service: Arc<Service>, error: &Error, ctx: Arc<Context>) -> Action {
    let key = backoff_key(service.namespace().as_deref(), &service.name_any());
    let delay = ctx.backoff.next_delay(&key);
    error!(
        ?error,
        service = %key,
        conflict = error.is_conflict(),
        retry_in_ms = delay.as_millis(),
        "reconciliation failed"
    );
    Action::requeue(delay)
}
