//! Request routing decisions.

use tollgate_controller_k8s_api::{Service, ServiceStatus};

/// Informational pages hosted outside the cluster.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorPage {
    PaymentRequired,
    Unavailable,
}

/// Extracts the target identity from a request host: its leading label, with
/// any port removed.
pub fn identity_from_host(host: &str) -> Option<&str> {
    let label = host.split(['.', ':']).next()?;
    if label.is_empty() {
        return None;
    }
    Some(label)
}

/// Replicas are starting or failing and none can serve.
pub fn is_unavailable(status: Option<&ServiceStatus>) -> bool {
    status.is_some_and(|s| s.unavailable_replicas > 0 && s.available_replicas == 0)
}

pub fn is_available(status: Option<&ServiceStatus>) -> bool {
    status.is_some_and(|s| s.available_replicas > 0)
}

/// Address of the network endpoint that fronts a Service's workload.
pub fn upstream_authority(svc: &Service, namespace: &str) -> Option<String> {
    let label = svc.service_label()?;
    Some(format!("{label}.{namespace}"))
}

// === impl ErrorPage ===

impl ErrorPage {
    pub fn code(&self) -> u16 {
        match self {
            Self::PaymentRequired => 402,
            Self::Unavailable => 503,
        }
    }

    pub fn url(&self, web_url: &str, identity: &str) -> String {
        format!(
            "{}/{}/{}",
            web_url.trim_end_matches('/'),
            identity,
            self.code()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identities() {
        assert_eq!(identity_from_host("hello.example.com"), Some("hello"));
        assert_eq!(identity_from_host("hello.example.com:8082"), Some("hello"));
        assert_eq!(identity_from_host("hello"), Some("hello"));
        assert_eq!(identity_from_host("hello:80"), Some("hello"));
        assert_eq!(identity_from_host(".example.com"), None);
        assert_eq!(identity_from_host(""), None);
    }

    #[test]
    fn availability() {
        assert!(!is_unavailable(None));
        assert!(!is_available(None));

        let starting = ServiceStatus {
            available_replicas: 0,
            unavailable_replicas: 2,
            ..Default::default()
        };
        assert!(is_unavailable(Some(&starting)));
        assert!(!is_available(Some(&starting)));

        let idle = ServiceStatus::default();
        assert!(!is_unavailable(Some(&idle)));
        assert!(!is_available(Some(&idle)));

        let ready = ServiceStatus {
            available_replicas: 1,
            unavailable_replicas: 1,
            ..Default::default()
        };
        assert!(!is_unavailable(Some(&ready)));
        assert!(is_available(Some(&ready)));
    }

    #[test]
    fn error_pages() {
        assert_eq!(
            ErrorPage::Unavailable.url("https://tollgate.dev/", "hello"),
            "https://tollgate.dev/hello/503"
        );
        assert_eq!(
            ErrorPage::PaymentRequired.url("http://localhost:8080", "hello"),
            "http://localhost:8080/hello/402"
        );
    }
}
