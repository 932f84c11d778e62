use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};

#[derive(Clone, Debug)]
pub struct ControllerMetrics {
    reconciles: Family<ReconcileLabels, Counter>,
    imports: Family<ResultLabels, Counter>,
    namespaces_deleted: Counter,
    work_writes: Family<ResultLabels, Counter>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ReconcileLabels {
    controller: &'static str,
    result: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ResultLabels {
    result: &'static str,
}

// === impl ControllerMetrics ===

impl ControllerMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let reconciles = Family::default();
        prom.register(
            "reconciles",
            "Count of reconciliations by controller and result",
            reconciles.clone(),
        );

        let imports = Family::default();
        prom.register(
            "imports",
            "Count of direct import attempts by result",
            imports.clone(),
        );

        let namespaces_deleted = Counter::default();
        prom.register(
            "namespaces_deleted",
            "Count of cluster namespaces deleted",
            namespaces_deleted.clone(),
        );

        let work_writes = Family::default();
        prom.register(
            "work_reconciles",
            "Count of agent work reconciliations by outcome",
            work_writes.clone(),
        );

        Self {
            reconciles,
            imports,
            namespaces_deleted,
            work_writes,
        }
    }

    pub fn reconciled(&self, controller: &'static str, result: &'static str) {
        self.reconciles
            .get_or_create(&ReconcileLabels { controller, result })
            .inc();
    }

    pub fn import(&self, result: &'static str) {
        self.imports.get_or_create(&ResultLabels { result }).inc();
    }

    pub fn namespace_deleted(&self) {
        self.namespaces_deleted.inc();
    }

    pub fn work(&self, result: &'static str) {
        self.work_writes.get_or_create(&ResultLabels { result }).inc();
    }
}
