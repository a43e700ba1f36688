//! Deterministic names and labels for managed children
//!
//! Every reconcile of the same parent must resolve to the same child
//! identities, so all names are pure functions of the parent's name and uid.

use std::collections::BTreeMap;

/// Suffix appended to the parent name for both children
pub const CHILD_SUFFIX: &str = "-tailscale";

/// Label key pinning the routing Service and pods to one parent
pub const SELECTOR_LABEL: &str = "svc";

/// Number of uid characters used in the pod hostname
const HOSTNAME_UID_CHARS: usize = 8;

/// Longest StatefulSet name whose pods still get a valid
/// `controller-revision-hash` label (`<name>-<10 char hash>` within 63)
pub const MAX_CHILD_NAME_LEN: usize = 52;

/// DNS label limit, which bounds the pod hostname
pub const MAX_HOSTNAME_LEN: usize = 63;

/// Name shared by the routing Service and the StatefulSet
///
/// Long parent names are cut so the result fits [`MAX_CHILD_NAME_LEN`].
pub fn child_name(parent_name: &str) -> String {
    let prefix = truncate_label(parent_name, MAX_CHILD_NAME_LEN - CHILD_SUFFIX.len());
    format!("{prefix}{CHILD_SUFFIX}")
}

/// Pod hostname: parent name plus the first 8 characters of its uid
///
/// A uid shorter than 8 characters is used whole. Long parent names are cut
/// so the hostname stays a valid DNS label.
pub fn pod_hostname(parent_name: &str, parent_uid: &str) -> String {
    let uid_prefix: String = parent_uid.chars().take(HOSTNAME_UID_CHARS).collect();
    let budget = MAX_HOSTNAME_LEN.saturating_sub(uid_prefix.len() + 1);
    let name = truncate_label(parent_name, budget);
    format!("{name}-{uid_prefix}")
}

/// Keep at most `max` characters, never ending on a `-`
fn truncate_label(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let cut: String = s.chars().take(max).collect();
    cut.trim_end_matches('-').to_string()
}

/// Selector labels for everything that belongs to one parent
pub fn selector_labels(parent_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(SELECTOR_LABEL.to_string(), parent_name.to_string())])
}
