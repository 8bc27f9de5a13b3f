use prometheus::{histogram_opts, opts, HistogramVec, IntCounter, IntCounterVec, Registry};
use tokio::time::Instant;

use crate::Error;

#[derive(Clone)]
pub struct Metrics {
    pub admissions: IntCounterVec,
    pub failures: IntCounterVec,
    pub replacements: IntCounter,
    pub admission_duration: HistogramVec,
}

impl Default for Metrics {
    fn default() -> Self {
        let admission_duration = HistogramVec::new(
            histogram_opts!(
                "job_mutator_admission_duration_seconds",
                "The duration of admission requests to complete in seconds"
            )
            .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.5, 1., 2.5, 5., 10.]),
            &["webhook"],
        )
        .unwrap();
        let admissions = IntCounterVec::new(
            opts!("job_mutator_admissions_total", "admission decisions"),
            &["webhook", "decision"],
        )
        .unwrap();
        let failures = IntCounterVec::new(
            opts!(
                "job_mutator_admission_errors_total",
                "admission errors",
            ),
            &["webhook", "error"],
        )
        .unwrap();
        let replacements =
            IntCounter::new("job_mutator_replacements_total", "jobs deleted and recreated")
                .unwrap();
        Metrics {
            admissions,
            failures,
            replacements,
            admission_duration,
        }
    }
}

impl Metrics {
    /// Register API metrics to start tracking them.
    pub fn register(self, registry: &Registry) -> Result<Self, prometheus::Error> {
        registry.register(Box::new(self.admission_duration.clone()))?;
        registry.register(Box::new(self.admissions.clone()))?;
        registry.register(Box::new(self.failures.clone()))?;
        registry.register(Box::new(self.replacements.clone()))?;
        Ok(self)
    }

    pub fn admitted(&self, webhook: &str, decision: &str) {
        self.admissions.with_label_values(&[webhook, decision]).inc()
    }

    pub fn admission_failure(&self, webhook: &str, e: &Error) {
        self.failures
            .with_label_values(&[webhook, e.metric_label()])
            .inc()
    }

    pub fn measure(&self, webhook: &'static str) -> AdmissionMeasurer {
        AdmissionMeasurer {
            start: Instant::now(),
            metric: self.admission_duration.clone(),
            webhook,
        }
    }
}

/// Smart function duration measurer
///
/// Relies on Drop to calculate duration and register the observation in the histogram
pub struct AdmissionMeasurer {
    start: Instant,
    metric: HistogramVec,
    webhook: &'static str,
}

impl Drop for AdmissionMeasurer {
    fn drop(&mut self) {
        #[allow(clippy::cast_precision_loss)]
        let duration = self.start.elapsed().as_millis() as f64 / 1000.0;
        self.metric
            .with_label_values(&[self.webhook])
            .observe(duration);
    }
}
