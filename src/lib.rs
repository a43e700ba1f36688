//! Tailscale operator - exposes annotated Kubernetes Services on a tailnet
//!
//! Users opt a `Service` in by setting `tailscale.maisem.dev/enable: "true"`.
//! The operator then converges two owned children next to it:
//!
//! - a headless routing `Service` named `<service>-tailscale`
//! - a `StatefulSet` of the same name running the Tailscale agent, which
//!   forwards tailnet traffic to the parent's cluster IP via `DEST_IP`
//!
//! A finalizer on the parent gates the lifecycle: it is attached before any
//! child is written and removed once the Service is disabled or deleted.
//! Children are never deleted directly; owner references let the API server
//! garbage-collect them together with the parent.
//!
//! # Modules
//!
//! - [`controller`] - Reconciliation logic for annotated Services
//! - [`template`] - Startup loading of the routing Service and StatefulSet templates
//! - [`retry`] - Exponential backoff for startup calls and the controller error policy
//! - [`telemetry`] - Structured logging setup
//! - [`error`] - Error types for the operator

#![deny(missing_docs)]

pub mod controller;
pub mod error;
pub mod retry;
pub mod telemetry;
pub mod template;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Annotation and finalizer surface
// =============================================================================
// Every key the operator reads from or writes to a parent Service lives under
// the `tailscale.maisem.dev` prefix. The finalizer token is owned exclusively
// by this operator.

/// Annotation that opts a Service in. Only `"true"` (any case) enables it.
pub const ENABLE_ANNOTATION: &str = "tailscale.maisem.dev/enable";

/// Annotation reserved for the tailnet IP assigned to the Service.
///
/// Not written yet: the control-plane integration that would resolve it
/// does not exist.
pub const IP_ANNOTATION: &str = "tailscale.maisem.dev/ip";

/// Annotation carrying the tailnet device ID, read during teardown.
pub const DEVICE_ID_ANNOTATION: &str = "tailscale.maisem.dev/deviceID";

/// Finalizer that blocks Service deletion until teardown has run.
pub const FINALIZER: &str = "tailscale.maisem.dev/finalizer";

/// Controller name used in logs
pub const CONTROLLER_NAME: &str = "tailscale-operator";
