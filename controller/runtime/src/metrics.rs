use prometheus_client::{
    encoding::{EncodeLabelSet, EncodeLabelValue},
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};

#[derive(Clone, Debug)]
pub struct GatewayMetrics {
    requests: Family<RequestLabels, Counter>,
}

#[derive(Clone, Debug)]
pub struct ControllerMetrics {
    reconciles: Family<ReconcileLabels, Counter>,
}

#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Outcome {
    Forwarded,
    Redirected,
    NotFound,
    Error,
}

#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum ReconcileResult {
    Ok,
    Error,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct RequestLabels {
    outcome: Outcome,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct ReconcileLabels {
    result: ReconcileResult,
}

// === GatewayMetrics ===

impl GatewayMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let requests = Family::<RequestLabels, Counter>::default();
        reg.register(
            "requests",
            "Total number of gateway requests by outcome",
            requests.clone(),
        );
        Self { requests }
    }

    pub(crate) fn inc(&self, outcome: Outcome) {
        self.requests.get_or_create(&RequestLabels { outcome }).inc();
    }
}

// === ControllerMetrics ===

impl ControllerMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let reconciles = Family::<ReconcileLabels, Counter>::default();
        reg.register(
            "reconciles",
            "Total number of Service reconciles by result",
            reconciles.clone(),
        );
        Self { reconciles }
    }

    pub(crate) fn reconciled(&self, result: ReconcileResult) {
        self.reconciles
            .get_or_create(&ReconcileLabels { result })
            .inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus_client::encoding::text::encode;

    #[test]
    fn encodes_outcomes() {
        let mut reg = Registry::default();
        let metrics = GatewayMetrics::register(reg.sub_registry_with_prefix("gateway"));
        metrics.inc(Outcome::Forwarded);
        metrics.inc(Outcome::Forwarded);
        metrics.inc(Outcome::NotFound);

        let mut out = String::new();
        encode(&mut out, &reg).unwrap();
        assert!(
            out.contains(r#"gateway_requests_total{outcome="Forwarded"} 2"#),
            "{out}"
        );
        assert!(
            out.contains(r#"gateway_requests_total{outcome="NotFound"} 1"#),
            "{out}"
        );
    }
}
