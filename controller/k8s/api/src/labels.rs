use std::{collections::BTreeMap, fmt};

/// Sha256 of the resource's spec (Service) or data (Secret).
pub const HASH_ANNOTATION: &str = "tollgate.dev/hash";

/// Grouping label joining a Service, its immutable counterpart, and their
/// workload objects.
pub const SERVICE_LABEL: &str = "tollgate.dev/service";

pub const IMMUTABLE_LABEL: &str = "tollgate.dev/immutable";

/// Identifies the client that owns a mutable Service.
pub const TOKEN_LABEL: &str = "tollgate.dev/token";

/// Written by the gateway onto the network endpoint after each paid request.
pub const LAST_REQUEST_TIME_ANNOTATION: &str = "tollgate.dev/last-request-time";

pub const HOSTNAME_ANNOTATION: &str = "tollgate.dev/hostname";

pub type Map = BTreeMap<String, String>;

/// An equality-based label selector.
#[derive(Clone, Debug, Eq, PartialEq, Default)]
pub struct Selector(Map);

// === Selector ===

impl std::iter::FromIterator<(String, String)> for Selector {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Renders the selector in the `k=v,k=v` form accepted by list calls.
impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (k, v) in self.0.iter() {
            if !first {
                f.write_str(",")?;
            }
            first = false;
            write!(f, "{k}={v}")?;
        }
        Ok(())
    }
}
