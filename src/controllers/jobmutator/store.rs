use std::future::Future;
use std::time::Duration;

use k8s_openapi::api::batch::v1::Job;
use kube::api::{Api, DeleteParams, PostParams, PropagationPolicy};
use kube::client::Client;
use tracing::*;

use crate::resources::jobs::JobKey;
use crate::{Error, Result};

pub const FIELD_MANAGER: &str = "job-mutator";

/// How a Job should be deleted
#[derive(Clone, Debug, PartialEq)]
pub struct DeleteOptions {
    pub propagation: PropagationPolicy,
    pub grace_period_seconds: u32,
}

impl DeleteOptions {
    /// Remove the Job straight away and let the garbage collector take its pods
    pub fn background_now() -> Self {
        Self {
            propagation: PropagationPolicy::Background,
            grace_period_seconds: 0,
        }
    }
}

/// The operations the job mutator needs from the cluster
pub trait JobStore: Send + Sync {
    /// `None` if the Job does not exist
    fn get(&self, key: &JobKey) -> impl Future<Output = Result<Option<Job>, kube::Error>> + Send;

    /// Fails if a Job with the same namespace and name already exists
    fn create(&self, job: &Job) -> impl Future<Output = Result<Job, kube::Error>> + Send;

    /// Deletion is asynchronous; returning does not mean the Job is gone.
    /// Deleting a Job that does not exist succeeds.
    fn delete(
        &self,
        key: &JobKey,
        options: &DeleteOptions,
    ) -> impl Future<Output = Result<(), kube::Error>> + Send;
}

/// [`JobStore`] backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeJobStore {
    client: Client,
}

impl KubeJobStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<Job> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

impl JobStore for KubeJobStore {
    async fn get(&self, key: &JobKey) -> Result<Option<Job>, kube::Error> {
        self.api(&key.namespace).get_opt(&key.name).await
    }

    async fn create(&self, job: &Job) -> Result<Job, kube::Error> {
        let namespace = job.metadata.namespace.as_deref().unwrap_or("default");
        self.api(namespace)
            .create(
                &PostParams {
                    dry_run: false,
                    field_manager: Some(FIELD_MANAGER.to_owned()),
                },
                job,
            )
            .await
    }

    async fn delete(&self, key: &JobKey, options: &DeleteOptions) -> Result<(), kube::Error> {
        let params = DeleteParams {
            grace_period_seconds: Some(options.grace_period_seconds),
            propagation_policy: Some(options.propagation.clone()),
            ..Default::default()
        };

        match self.api(&key.namespace).delete(&key.name, &params).await {
            Ok(_) => Ok(()),
            // for idempotency we have to allow 404
            Err(kube::Error::Api(err)) if err.code == 404 => Ok(()),
            Err(err) => Err(err),
        }
    }
}

/// Whether retrying the same call could succeed
pub fn is_transient(err: &kube::Error) -> bool {
    match err {
        kube::Error::Api(resp) => {
            resp.code == 429 || resp.code >= 500 || (resp.code == 409 && resp.reason == "Conflict")
        }
        kube::Error::HyperError(_) | kube::Error::Service(_) => true,
        _ => false,
    }
}

/// Bounded retry with capped exponential backoff
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one
    pub attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// The pause after the given (zero based) failed attempt
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.initial_backoff
            .checked_mul(2u32.saturating_pow(attempt))
            .map_or(self.max_backoff, |d| d.min(self.max_backoff))
    }

    /// Run `operation` until it succeeds, fails permanently, or runs out of attempts
    pub async fn run<T, F, Fut>(&self, operation: &'static str, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, kube::Error>>,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 0;

        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(err) if !is_transient(&err) => {
                    warn!(operation, attempt, error = %err, "Operation failed permanently");
                    return Err(Error::KubeError(err));
                }
                Err(err) if attempt + 1 >= attempts => {
                    error!(operation, attempts, error = %err, "Operation failed after max retries");
                    return Err(Error::RetriesExhausted {
                        operation,
                        attempts,
                        source: err,
                    });
                }
                Err(err) => {
                    let backoff = self.backoff(attempt);
                    warn!(
                        operation,
                        attempt,
                        error = %err,
                        backoff_ms = backoff.as_millis() as u64,
                        "Operation failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
            }
        }
    }
}
