use crate::{index::unresolved_by_namespace, Reader};
use prometheus_client::{
    collector::Collector,
    encoding::{DescriptorEncoder, EncodeLabelSet, EncodeMetric},
    metrics::{counter::Counter, family::Family, gauge::ConstGauge, MetricType},
    registry::Registry,
};
use rbac_policy_core::Kind;

#[derive(Clone, Debug, Default)]
pub struct IndexMetrics {
    applies: Family<KindLabels, Counter>,
    deletes: Family<KindLabels, Counter>,
    resets: Family<KindLabels, Counter>,
    restarts: Family<KindLabels, Counter>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct KindLabels {
    kind: String,
}

#[derive(Debug)]
struct Instrumented(Reader);

// === impl IndexMetrics ===

impl IndexMetrics {
    /// Registers index counters and size gauges, which are computed from the latest snapshot at
    /// scrape time.
    pub fn register(prom: &mut Registry, reader: Reader) -> Self {
        let metrics = Self::default();
        prom.register(
            "applies",
            "Count of records applied to the index",
            metrics.applies.clone(),
        );
        prom.register(
            "deletes",
            "Count of records deleted from the index",
            metrics.deletes.clone(),
        );
        prom.register(
            "resets",
            "Count of resets to the index",
            metrics.resets.clone(),
        );
        prom.register(
            "watch_restarts",
            "Count of watches restarted after an error",
            metrics.restarts.clone(),
        );
        prom.register_collector(Box::new(Instrumented(reader)));
        metrics
    }

    pub(crate) fn apply(&self, kind: Kind) {
        self.applies.get_or_create(&KindLabels::from(kind)).inc();
    }

    pub(crate) fn delete(&self, kind: Kind) {
        self.deletes.get_or_create(&KindLabels::from(kind)).inc();
    }

    pub(crate) fn reset(&self, kind: Kind) {
        self.resets.get_or_create(&KindLabels::from(kind)).inc();
    }

    pub(crate) fn restart(&self, kind: Kind) {
        self.restarts.get_or_create(&KindLabels::from(kind)).inc();
    }

    #[cfg(test)]
    pub(crate) fn restarts(&self, kind: Kind) -> u64 {
        self.restarts.get_or_create(&KindLabels::from(kind)).get()
    }
}

impl From<Kind> for KindLabels {
    fn from(kind: Kind) -> Self {
        Self {
            kind: kind.plural().to_string(),
        }
    }
}

// === impl Instrumented ===

impl Collector for Instrumented {
    fn encode(&self, mut encoder: DescriptorEncoder<'_>) -> Result<(), std::fmt::Error> {
        let snapshot = self.0.snapshot();

        let mut size_encoder = encoder.encode_descriptor(
            "size",
            "The number of resolved bindings in the index, per namespace",
            None,
            MetricType::Gauge,
        )?;
        let cluster = ConstGauge::new(snapshot.cluster().len() as i64);
        cluster.encode(size_encoder.encode_family(&[("namespace", "")])?)?;
        for (ns, bucket) in snapshot.namespaces() {
            let size = ConstGauge::new(bucket.len() as i64);
            size.encode(size_encoder.encode_family(&[("namespace", ns)])?)?;
        }

        let mut unresolved_encoder = encoder.encode_descriptor(
            "unresolved_bindings",
            "The number of bindings that reference a missing role, per namespace",
            None,
            MetricType::Gauge,
        )?;
        for (ns, count) in unresolved_by_namespace(&snapshot) {
            let unresolved = ConstGauge::new(count as i64);
            unresolved.encode(unresolved_encoder.encode_family(&[("namespace", ns)])?)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Index;
    use rbac_policy_core::{PolicyRule, Role, RoleBinding, RoleRef, Subject};

    #[test]
    fn encodes_index_sizes() {
        let (mut index, reader) = Index::new();
        let mut prom = Registry::default();
        let metrics = IndexMetrics::register(prom.sub_registry_with_prefix("index"), reader);

        index.apply_role(Role::cluster("r", [PolicyRule::resources(["get"], ["pods"])]));
        index.apply_binding(RoleBinding::namespaced(
            "ns-0",
            "b0",
            RoleRef::cluster("r"),
            [Subject::user("u")],
        ));
        index.apply_binding(RoleBinding::namespaced(
            "ns-1",
            "b1",
            RoleRef::cluster("missing"),
            [Subject::user("u")],
        ));
        metrics.apply(Kind::Role);
        metrics.restart(Kind::RoleBinding);

        let mut text = String::new();
        prometheus_client::encoding::text::encode(&mut text, &prom).unwrap();
        assert!(text.contains("index_size{namespace=\"ns-0\"} 1"), "{text}");
        assert!(
            text.contains("index_unresolved_bindings{namespace=\"ns-1\"} 1"),
            "{text}"
        );
        assert!(text.contains("index_applies_total{kind=\"roles\"} 1"), "{text}");
        assert!(
            text.contains("index_watch_restarts_total{kind=\"rolebindings\"} 1"),
            "{text}"
        );
        assert_eq!(metrics.restarts(Kind::RoleBinding), 1);
    }
}
