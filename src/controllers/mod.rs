use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::Metrics;
use jobmutator::Decision;

pub mod hostaliases;
pub mod jobmutator;

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
    /// Number of Jobs deleted and recreated since startup
    pub replacements: u64,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
            replacements: 0,
        }
    }
}

/// State shared between the admission handlers and the metrics server
#[derive(Clone)]
pub struct State {
    /// Diagnostics populated by the admission handlers
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Metrics registry
    pub registry: prometheus::Registry,
    pub metrics: Metrics,
}

impl Default for State {
    fn default() -> Self {
        let registry = prometheus::Registry::default();
        let metrics = Metrics::default()
            .register(&registry)
            .expect("metrics to be registered once");
        Self {
            diagnostics: Arc::new(RwLock::new(Diagnostics::default())),
            registry,
            metrics,
        }
    }
}

/// State wrapper around the admission outputs for the web server
impl State {
    /// Metrics getter
    pub fn metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    /// Count an admitted Job; dry runs never count as replacements
    pub async fn job_admitted(&self, decision: &Decision, dry_run: bool) {
        self.metrics.admitted("job", decision.label());
        if matches!(decision, Decision::Replace(_)) && !dry_run {
            self.metrics.replacements.inc();
            self.diagnostics.write().await.replacements += 1;
        }
    }
}
