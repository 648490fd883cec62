//! Content-derived identities.
//!
//! A digest is the sha256 of the compact JSON encoding of a typed value,
//! rendered as 64 lowercase hex characters. Struct fields encode in
//! declaration order and maps are `BTreeMap`s, so two documents that differ
//! only in key order decode to values with the same digest.

use regex::Regex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::{collections::BTreeMap, sync::LazyLock};
use tollgate_controller_k8s_api::ServiceSpec;

/// Length of a rendered digest.
pub const HASH_LEN: usize = 64;

const LABEL_PREFIX: &str = "svc-";

/// Number of digest characters kept in a grouping label. With the prefix,
/// labels are 60 characters, within the 63 allowed for DNS labels.
pub const LABEL_HASH_LEN: usize = 56;

static HASH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-f0-9]{64}$").expect("hash pattern must compile"));

pub fn hash_spec(spec: &ServiceSpec) -> String {
    digest(spec)
}

pub fn hash_secret_data(data: &BTreeMap<String, String>) -> String {
    digest(data)
}

/// Derives the grouping label for a Service hash.
///
/// The label starts with a letter so that it is also a valid DNS-1035 name
/// for the network endpoint.
pub fn label_for(hash: &str) -> String {
    let prefix = hash.get(..LABEL_HASH_LEN).unwrap_or(hash);
    format!("{LABEL_PREFIX}{prefix}")
}

/// Returns true if `name` has the shape of a rendered digest.
pub fn is_hash_like(name: &str) -> bool {
    HASH.is_match(name)
}

/// Derives the ownership label value for a client bearer token.
pub fn token_label(token: &str) -> String {
    let hash = hex::encode(Sha256::digest(token.as_bytes()));
    hash[..LABEL_HASH_LEN].to_string()
}

fn digest<T: Serialize>(value: &T) -> String {
    // Specs and string maps always encode.
    let bytes = serde_json::to_vec(value).expect("value must encode as json");
    hex::encode(Sha256::digest(&bytes))
}
