//! Controller implementation for annotated Services
//!
//! Controllers follow the Kubernetes pattern of observe, diff, act. The
//! pieces are layered leaf-first:
//!
//! - [`naming`] - deterministic child names, labels and pod hostname
//! - [`desired`] - desired child specs built from the parent and templates
//! - [`apply`] - idempotent create-or-update with owner references
//! - [`service`] - the finalizer-gated reconcile loop

pub mod apply;
pub mod desired;
pub mod naming;
mod service;

pub use apply::Operation;
pub use desired::{build, ChildService, ChildStatefulSet, DesiredChildren, DEST_IP_ENV};
pub use service::{
    backoff_key, device_id, error_policy, has_finalizer, is_enabled, reconcile, wants_tailscale,
    Context, ContextBuilder, KubeClient, KubeClientImpl,
};
