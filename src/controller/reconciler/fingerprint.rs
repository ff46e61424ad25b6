//! # Fingerprints
//!
//! Stable hashes used for change detection and for derived remote labels.

use crate::constants::MAX_LABEL_LENGTH;
use crate::crd::ServiceInstanceSpec;
use sha2::{Digest, Sha256};

/// Fingerprint of the spec fields that affect the remote instance.
///
/// `shared` is applied by its own workflow and `userInfo` is admission bookkeeping,
/// so neither takes part. Map keys serialise sorted, so the result does not depend
/// on the field order of the stored object.
#[must_use]
pub fn spec_fingerprint(spec: &ServiceInstanceSpec) -> String {
    let mut relevant = spec.clone();
    relevant.shared = None;
    relevant.user_info = None;
    let value = serde_json::to_value(&relevant).unwrap_or_default();
    format!("{:x}", md5::compute(value.to_string()))
}

/// Fingerprint of a merged parameter payload
#[must_use]
pub fn parameters_fingerprint(parameters: &serde_json::Value) -> String {
    format!("{:x}", md5::compute(parameters.to_string()))
}

/// Hex-encoded SHA-256 of `data`
#[must_use]
pub fn sha256_hex(data: &[u8]) -> String {
    Sha256::digest(data)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Name that identifies a resource across clusters, used as the `_k8sname` label.
///
/// `<name>-<16 hex chars of sha256(cluster/namespace/name)>`, cut to the label limit.
#[must_use]
pub fn derived_k8s_name(cluster_id: &str, namespace: &str, name: &str) -> String {
    let digest = sha256_hex(format!("{cluster_id}/{namespace}/{name}").as_bytes());
    let derived = format!("{name}-{}", &digest[..16]);
    if derived.len() > MAX_LABEL_LENGTH {
        // keep the hash, shorten the name
        let keep = MAX_LABEL_LENGTH - 17;
        format!("{}-{}", truncate_chars(name, keep), &digest[..16])
    } else {
        derived
    }
}

fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
