use std::fmt;
use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::batch::v1::Job;
use kube::ResourceExt;
use tokio::time::Instant;
use tracing::*;

use crate::resources::jobs::{
    has_annotations, has_policy_annotation, is_processing_echo, parse_policy,
    sanitize_for_create, stamp_processing_marker, strip_processing_marker, JobKey,
};
use crate::{Error, Result};

use super::compare::{compare, Comparison};
use super::store::{DeleteOptions, JobStore, RetryPolicy};

/// Timing of the replace protocol
#[derive(Clone, Debug)]
pub struct Config {
    /// Retry policy for the delete and create calls
    pub retry: RetryPolicy,
    /// How often to check whether the old Job is gone
    pub confirm_interval: Duration,
    /// Longest wait for the old Job to disappear
    pub confirm_deadline: Duration,
    /// Time we may spend on one admission request; the confirmation wait never goes past it
    pub request_budget: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            confirm_interval: Duration::from_millis(500),
            confirm_deadline: Duration::from_secs(8),
            // 10s webhook timeout, less a second to encode and send the response
            request_budget: Duration::from_secs(9),
        }
    }
}

impl Config {
    fn confirmation_deadline(&self, received_at: Instant) -> Instant {
        (Instant::now() + self.confirm_deadline).min(received_at + self.request_budget)
    }
}

/// An incoming Job create or update
#[derive(Clone, Debug)]
pub struct JobAdmission {
    /// Uid of the admission request, for correlating logs
    pub uid: String,
    pub job: Job,
    /// Namespace of the admission request, used when the object does not carry one
    pub namespace: Option<String>,
    pub dry_run: bool,
    pub received_at: Instant,
}

impl JobAdmission {
    pub fn new(job: Job) -> Self {
        Self {
            uid: String::new(),
            job,
            namespace: None,
            dry_run: false,
            received_at: Instant::now(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    NoAnnotations,
    NoComparisonPolicy,
    NotFound,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SkipReason::NoAnnotations => "no annotations, skipping",
            SkipReason::NoComparisonPolicy => "nothing to compare, skipping",
            SkipReason::NotFound => "existing job not found, skipping",
        })
    }
}

/// What to do with an admission request
#[derive(Clone, Debug, PartialEq)]
pub enum Decision {
    /// Let the request through untouched
    AllowUnchanged(SkipReason),
    /// Let the request through as this Job: the new metadata on top of the stored spec,
    /// or the echo of our own recreate with the processing marker removed
    AllowMergedMetadata(Box<Job>),
    /// The old Job was deleted and this Job was created in its place
    Replace(Box<Job>),
}

impl Decision {
    pub fn label(&self) -> &'static str {
        match self {
            Decision::AllowUnchanged(_) => "AllowUnchanged",
            Decision::AllowMergedMetadata(_) => "AllowMergedMetadata",
            Decision::Replace(_) => "Replace",
        }
    }
}

/// Decides, per admission request, whether a Job change only touches metadata or needs the
/// Job to be deleted and recreated, and carries out the recreate.
pub struct Orchestrator<S> {
    store: S,
    config: Config,
    span: Span,
}

impl<S: JobStore> Orchestrator<S> {
    /// `span` is the parent of every span and event this orchestrator emits
    pub fn new(store: S, config: Config, span: Span) -> Self {
        Self {
            store,
            config,
            span,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub async fn reconcile(&self, admission: JobAdmission) -> Result<Decision> {
        let span = info_span!(
            parent: &self.span,
            "reconcile",
            uid = %admission.uid,
            job = %admission.job.name_any(),
            namespace = %admission
                .job
                .namespace()
                .or_else(|| admission.namespace.clone())
                .unwrap_or_default(),
            dry_run = admission.dry_run,
        );
        self.decide(admission).instrument(span).await
    }

    async fn decide(&self, admission: JobAdmission) -> Result<Decision> {
        let JobAdmission {
            uid: _,
            mut job,
            namespace,
            dry_run,
            received_at,
        } = admission;

        if !has_annotations(&job) {
            debug!("Job has no annotations");
            return Ok(Decision::AllowUnchanged(SkipReason::NoAnnotations));
        }

        if !has_policy_annotation(&job) {
            debug!("Job has no comparison policy");
            return Ok(Decision::AllowUnchanged(SkipReason::NoComparisonPolicy));
        }

        if is_processing_echo(&job) {
            // this is the create we issued ourselves; consume the marker and let it through
            strip_processing_marker(&mut job);
            info!("Removed processing marker from recreated Job");
            return Ok(Decision::AllowMergedMetadata(Box::new(job)));
        }

        let policy = parse_policy(&job);
        if policy.is_empty() {
            debug!("Comparison policy has no known selectors");
            return Ok(Decision::AllowUnchanged(SkipReason::NoComparisonPolicy));
        }

        let key = JobKey::for_job(&job, namespace.as_deref())?;

        let old = match self.store.get(&key).await {
            Ok(Some(old)) => old,
            Ok(None) => {
                debug!("No existing Job {key}");
                return Ok(Decision::AllowUnchanged(SkipReason::NotFound));
            }
            Err(err) => {
                // fail open: a failed lookup counts as a first create
                warn!(error = %err, "Failed to look up existing Job {key}, treating it as absent");
                return Ok(Decision::AllowUnchanged(SkipReason::NotFound));
            }
        };

        match compare(&old, &job, &policy) {
            Comparison::Same => {
                debug!(%policy, "Pod template unchanged, keeping stored spec");
                job.spec = old.spec;
                Ok(Decision::AllowMergedMetadata(Box::new(job)))
            }
            Comparison::Different => {
                info!(%policy, "Pod template changed, replacing Job {key}");
                let job = self.replace(&key, job, dry_run, received_at).await?;
                Ok(Decision::Replace(Box::new(job)))
            }
        }
    }

    async fn replace(
        &self,
        key: &JobKey,
        mut job: Job,
        dry_run: bool,
        received_at: Instant,
    ) -> Result<Job> {
        // the recreated Job must land where the old one was deleted
        job.metadata.namespace = Some(key.namespace.clone());

        if dry_run {
            stamp_processing_marker(&mut job, Utc::now());
            sanitize_for_create(&mut job);
            info!("Dry run, not replacing Job {key}");
            return Ok(job);
        }

        let options = &DeleteOptions::background_now();
        self.config
            .retry
            .run("delete", || self.store.delete(key, options))
            .await?;
        debug!("Deletion of Job {key} accepted");

        self.confirm_deleted(key, received_at).await?;

        stamp_processing_marker(&mut job, Utc::now());
        sanitize_for_create(&mut job);

        let new_job = &job;
        self.config
            .retry
            .run("create", || self.store.create(new_job))
            .await?;
        info!("Recreated Job {key}");

        Ok(job)
    }

    /// Wait until the store no longer returns the Job
    async fn confirm_deleted(&self, key: &JobKey, received_at: Instant) -> Result<()> {
        let started = Instant::now();
        let deadline = self.config.confirmation_deadline(received_at);

        let poll = async {
            loop {
                tokio::time::sleep(self.config.confirm_interval).await;
                match self.store.get(key).await {
                    Ok(None) => return,
                    Ok(Some(_)) => trace!("Job {key} still present"),
                    Err(err) => debug!(error = %err, "Failed to check whether Job {key} is gone"),
                }
            }
        };

        match tokio::time::timeout_at(deadline, poll).await {
            Ok(()) => {
                debug!(waited_ms = started.elapsed().as_millis() as u64, "Job {key} is gone");
                Ok(())
            }
            Err(_) => {
                error!("Timed out waiting for Job {key} to be deleted");
                Err(Error::DeletionTimeout {
                    job: key.to_string(),
                    waited: started.elapsed(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use std::sync::Mutex;

    use k8s_openapi::api::batch::v1::JobSpec;
    use k8s_openapi::api::core::v1::{Container, EnvVar, PodSpec, PodTemplateSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use super::*;
    use crate::controllers::jobmutator::store::tests::api_error;
    use crate::resources::jobs::{COMPARISON_ANNOTATION, PROCESSING_ANNOTATION};

    /// In-memory store; a deleted Job stays visible for `linger_polls` lookups
    #[derive(Default)]
    struct FakeStore {
        jobs: Mutex<BTreeMap<JobKey, Job>>,
        deleting: Mutex<BTreeMap<JobKey, u32>>,
        linger_polls: u32,
        fail_gets: bool,
        delete_failures: AtomicU32,
        create_failures: AtomicU32,
        gets: AtomicUsize,
        deletes: AtomicUsize,
        creates: AtomicUsize,
        last_delete: Mutex<Option<DeleteOptions>>,
    }

    impl FakeStore {
        fn with(jobs: impl IntoIterator<Item = Job>) -> Self {
            let store = FakeStore::default();
            for job in jobs {
                let key = JobKey::for_job(&job, None).unwrap();
                store.jobs.lock().unwrap().insert(key, job);
            }
            store
        }

        fn stored(&self, key: &JobKey) -> Option<Job> {
            self.jobs.lock().unwrap().get(key).cloned()
        }
    }

    impl JobStore for FakeStore {
        async fn get(&self, key: &JobKey) -> Result<Option<Job>, kube::Error> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            if self.fail_gets {
                return Err(api_error(500, "InternalError"));
            }

            let mut deleting = self.deleting.lock().unwrap();
            if let Some(remaining) = deleting.get_mut(key) {
                if *remaining == 0 {
                    deleting.remove(key);
                    self.jobs.lock().unwrap().remove(key);
                } else {
                    *remaining -= 1;
                }
            }
            Ok(self.jobs.lock().unwrap().get(key).cloned())
        }

        async fn create(&self, job: &Job) -> Result<Job, kube::Error> {
            self.creates.fetch_add(1, Ordering::SeqCst);
            if self
                .create_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(api_error(503, "ServiceUnavailable"));
            }

            let key = JobKey::for_job(job, None).unwrap();
            let mut jobs = self.jobs.lock().unwrap();
            if jobs.contains_key(&key) {
                return Err(api_error(409, "AlreadyExists"));
            }
            jobs.insert(key, job.clone());
            Ok(job.clone())
        }

        async fn delete(&self, key: &JobKey, options: &DeleteOptions) -> Result<(), kube::Error> {
            self.deletes.fetch_add(1, Ordering::SeqCst);
            *self.last_delete.lock().unwrap() = Some(options.clone());
            if self
                .delete_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(api_error(500, "InternalError"));
            }

            if self.jobs.lock().unwrap().contains_key(key) {
                self.deleting
                    .lock()
                    .unwrap()
                    .entry(key.clone())
                    .or_insert(self.linger_polls);
            }
            Ok(())
        }
    }

    fn job(image: &str, env: &[(&str, &str)], annotations: &[(&str, &str)]) -> Job {
        Job {
            metadata: ObjectMeta {
                name: Some("migrate".into()),
                namespace: Some("apps".into()),
                annotations: Some(
                    annotations
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            spec: Some(JobSpec {
                template: PodTemplateSpec {
                    metadata: None,
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: "main".into(),
                            image: Some(image.into()),
                            env: Some(
                                env.iter()
                                    .map(|(name, value)| EnvVar {
                                        name: name.to_string(),
                                        value: Some(value.to_string()),
                                        value_from: None,
                                    })
                                    .collect(),
                            ),
                            ..Default::default()
                        }],
                        restart_policy: Some("Never".into()),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn stored_job(image: &str, env: &[(&str, &str)], policy: &str) -> Job {
        let mut job = job(image, env, &[(COMPARISON_ANNOTATION, policy)]);
        job.metadata.uid = Some("0b6a".into());
        job.metadata.resource_version = Some("41".into());
        job
    }

    fn key() -> JobKey {
        JobKey {
            namespace: "apps".into(),
            name: "migrate".into(),
        }
    }

    fn orchestrator(store: FakeStore) -> Orchestrator<FakeStore> {
        Orchestrator::new(store, Config::default(), Span::none())
    }

    async fn decide(orchestrator: &Orchestrator<FakeStore>, job: Job) -> Result<Decision> {
        orchestrator.reconcile(JobAdmission::new(job)).await
    }

    #[tokio::test(start_paused = true)]
    async fn metadata_only_change_keeps_stored_spec() {
        let old = stored_job("app:1", &[("MODE", "a")], "image");
        let new = job(
            "app:1",
            &[("MODE", "b")],
            &[(COMPARISON_ANNOTATION, "image"), ("owner", "data")],
        );
        let o = orchestrator(FakeStore::with([old.clone()]));

        let Decision::AllowMergedMetadata(merged) = decide(&o, new.clone()).await.unwrap() else {
            panic!("expected merged metadata");
        };
        assert_eq!(merged.spec, old.spec);
        assert_eq!(merged.metadata, new.metadata);
        assert_eq!(o.store.deletes.load(Ordering::SeqCst), 0);
        assert_eq!(o.store.creates.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn image_change_replaces_job() {
        let old = stored_job("app:1", &[], "image");
        let new = job("app:2", &[], &[(COMPARISON_ANNOTATION, "image")]);
        let o = orchestrator(FakeStore::with([old]));

        let Decision::Replace(created) = decide(&o, new).await.unwrap() else {
            panic!("expected replace");
        };
        assert!(created.annotations().contains_key(PROCESSING_ANNOTATION));
        assert_eq!(created.metadata.uid, None);
        assert_eq!(created.metadata.resource_version, None);

        let stored = o.store.stored(&key()).expect("recreated job");
        assert_eq!(&stored, created.as_ref());
        assert_eq!(o.store.deletes.load(Ordering::SeqCst), 1);
        assert_eq!(o.store.creates.load(Ordering::SeqCst), 1);
        assert_eq!(
            o.store.last_delete.lock().unwrap().clone(),
            Some(DeleteOptions::background_now())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn any_selected_mismatch_replaces_job() {
        let old = stored_job("app:1", &[("MODE", "a")], "image,env");
        let new = job("app:1", &[("MODE", "b")], &[(COMPARISON_ANNOTATION, "image,env")]);
        let o = orchestrator(FakeStore::with([old]));

        assert!(matches!(
            decide(&o, new).await.unwrap(),
            Decision::Replace(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn unselected_image_change_is_merged() {
        let old = stored_job("app:1", &[("MODE", "a")], "env");
        let new = job("app:2", &[("MODE", "a")], &[(COMPARISON_ANNOTATION, "env")]);
        let o = orchestrator(FakeStore::with([old.clone()]));

        let Decision::AllowMergedMetadata(merged) = decide(&o, new).await.unwrap() else {
            panic!("expected merged metadata");
        };
        assert_eq!(merged.spec, old.spec);
    }

    #[tokio::test(start_paused = true)]
    async fn no_policy_annotation_allows_unchanged_without_lookup() {
        let old = stored_job("app:1", &[], "image");
        let o = orchestrator(FakeStore::with([old]));

        let decision = decide(&o, job("app:2", &[], &[])).await.unwrap();
        assert_eq!(decision, Decision::AllowUnchanged(SkipReason::NoAnnotations));

        let decision = decide(&o, job("app:2", &[], &[("owner", "data")])).await.unwrap();
        assert_eq!(
            decision,
            Decision::AllowUnchanged(SkipReason::NoComparisonPolicy)
        );

        let decision = decide(&o, job("app:2", &[], &[(COMPARISON_ANNOTATION, "args")]))
            .await
            .unwrap();
        assert_eq!(
            decision,
            Decision::AllowUnchanged(SkipReason::NoComparisonPolicy)
        );
        assert_eq!(o.store.gets.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn echo_strips_marker_without_store_access() {
        let old = stored_job("app:1", &[], "image");
        let new = job(
            "app:2",
            &[],
            &[
                (COMPARISON_ANNOTATION, "image"),
                (PROCESSING_ANNOTATION, "2024-03-09T14:05:59Z"),
            ],
        );
        let o = orchestrator(FakeStore::with([old]));

        let Decision::AllowMergedMetadata(passed) = decide(&o, new.clone()).await.unwrap() else {
            panic!("expected pass through");
        };
        let mut expected = new;
        expected
            .metadata
            .annotations
            .as_mut()
            .unwrap()
            .remove(PROCESSING_ANNOTATION);
        assert_eq!(passed.as_ref(), &expected);
        assert_eq!(o.store.gets.load(Ordering::SeqCst), 0);
        assert_eq!(o.store.deletes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn marker_without_policy_is_left_alone() {
        let new = job("app:1", &[], &[(PROCESSING_ANNOTATION, "")]);
        let o = orchestrator(FakeStore::default());

        let decision = decide(&o, new).await.unwrap();
        assert_eq!(decision, Decision::AllowUnchanged(SkipReason::NoComparisonPolicy));
        assert_eq!(o.store.gets.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn recreate_uses_the_request_namespace() {
        let o = orchestrator(FakeStore::with([stored_job("app:1", &[], "image")]));
        let mut new = job("app:2", &[], &[(COMPARISON_ANNOTATION, "image")]);
        new.metadata.namespace = None;
        let admission = JobAdmission {
            namespace: Some("apps".into()),
            ..JobAdmission::new(new)
        };

        let Decision::Replace(created) = o.reconcile(admission).await.unwrap() else {
            panic!("expected replace");
        };
        assert_eq!(created.metadata.namespace.as_deref(), Some("apps"));
        let stored = o.store.stored(&key()).expect("recreated job in the old namespace");
        assert_eq!(stored.metadata.namespace.as_deref(), Some("apps"));
        assert_eq!(o.store.jobs.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn first_create_allows_unchanged() {
        let o = orchestrator(FakeStore::default());
        let decision = decide(&o, job("app:1", &[], &[(COMPARISON_ANNOTATION, "image")]))
            .await
            .unwrap();
        assert_eq!(decision, Decision::AllowUnchanged(SkipReason::NotFound));
        assert_eq!(o.store.gets.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_lookup_fails_open() {
        let store = FakeStore {
            fail_gets: true,
            ..FakeStore::with([stored_job("app:1", &[], "image")])
        };
        let o = orchestrator(store);
        let decision = decide(&o, job("app:2", &[], &[(COMPARISON_ANNOTATION, "image")]))
            .await
            .unwrap();
        assert_eq!(decision, Decision::AllowUnchanged(SkipReason::NotFound));
        assert_eq!(o.store.gets.load(Ordering::SeqCst), 1);
        assert_eq!(o.store.deletes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_name_is_a_client_error() {
        let mut new = job("app:1", &[], &[(COMPARISON_ANNOTATION, "image")]);
        new.metadata.name = None;
        let o = orchestrator(FakeStore::default());
        assert!(matches!(decide(&o, new).await, Err(Error::MissingName)));
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_deletion_before_creating() {
        let store = FakeStore {
            linger_polls: 3,
            ..FakeStore::with([stored_job("app:1", &[], "image")])
        };
        let o = orchestrator(store);
        let started = Instant::now();

        let decision = decide(&o, job("app:2", &[], &[(COMPARISON_ANNOTATION, "image")]))
            .await
            .unwrap();
        assert!(matches!(decision, Decision::Replace(_)));
        // initial lookup, then three polls that still see the job and one that does not
        assert_eq!(o.store.gets.load(Ordering::SeqCst), 5);
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert_eq!(o.store.creates.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn deletion_timeout_aborts_before_create() {
        let store = FakeStore {
            linger_polls: u32::MAX,
            ..FakeStore::with([stored_job("app:1", &[], "image")])
        };
        let o = orchestrator(store);
        let started = Instant::now();

        let result = decide(&o, job("app:2", &[], &[(COMPARISON_ANNOTATION, "image")])).await;
        assert!(matches!(result, Err(Error::DeletionTimeout { .. })));
        assert!(started.elapsed() >= Duration::from_secs(8));
        assert!(started.elapsed() < Duration::from_secs(9));
        assert_eq!(o.store.creates.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn confirmation_respects_the_request_budget() {
        let store = FakeStore {
            linger_polls: u32::MAX,
            ..FakeStore::with([stored_job("app:1", &[], "image")])
        };
        let o = orchestrator(store);
        let admission = JobAdmission {
            // most of the budget went elsewhere before we got the request
            received_at: Instant::now() - Duration::from_secs(7),
            ..JobAdmission::new(job("app:2", &[], &[(COMPARISON_ANNOTATION, "image")]))
        };
        let started = Instant::now();

        let result = o.reconcile(admission).await;
        assert!(matches!(result, Err(Error::DeletionTimeout { .. })));
        assert!(started.elapsed() <= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_delete_and_create_errors_are_retried() {
        let store = FakeStore {
            delete_failures: AtomicU32::new(2),
            create_failures: AtomicU32::new(1),
            ..FakeStore::with([stored_job("app:1", &[], "image")])
        };
        let o = orchestrator(store);

        let decision = decide(&o, job("app:2", &[], &[(COMPARISON_ANNOTATION, "image")]))
            .await
            .unwrap();
        assert!(matches!(decision, Decision::Replace(_)));
        assert_eq!(o.store.deletes.load(Ordering::SeqCst), 3);
        assert_eq!(o.store.creates.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_delete_retries_abort_the_replace() {
        let store = FakeStore {
            delete_failures: AtomicU32::new(u32::MAX),
            ..FakeStore::with([stored_job("app:1", &[], "image")])
        };
        let o = orchestrator(store);

        let result = decide(&o, job("app:2", &[], &[(COMPARISON_ANNOTATION, "image")])).await;
        assert!(matches!(
            result,
            Err(Error::RetriesExhausted {
                operation: "delete",
                attempts: 5,
                ..
            })
        ));
        assert_eq!(o.store.creates.load(Ordering::SeqCst), 0);
        assert!(o.store.stored(&key()).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn dry_run_does_not_touch_the_store() {
        let old = stored_job("app:1", &[], "image");
        let o = orchestrator(FakeStore::with([old.clone()]));
        let admission = JobAdmission {
            dry_run: true,
            ..JobAdmission::new(job("app:2", &[], &[(COMPARISON_ANNOTATION, "image")]))
        };

        let decision = o.reconcile(admission).await.unwrap();
        assert!(matches!(decision, Decision::Replace(_)));
        assert_eq!(o.store.deletes.load(Ordering::SeqCst), 0);
        assert_eq!(o.store.creates.load(Ordering::SeqCst), 0);
        assert_eq!(o.store.stored(&key()), Some(old));
    }

    #[tokio::test(start_paused = true)]
    async fn echo_of_recreate_is_let_through() {
        // replace, then feed the created job back in as the follow-up admission request
        let o = orchestrator(FakeStore::with([stored_job("app:1", &[], "image")]));
        let Decision::Replace(created) =
            decide(&o, job("app:2", &[], &[(COMPARISON_ANNOTATION, "image")]))
                .await
                .unwrap()
        else {
            panic!("expected replace");
        };
        let gets = o.store.gets.load(Ordering::SeqCst);

        let Decision::AllowMergedMetadata(echo) = decide(&o, *created).await.unwrap() else {
            panic!("expected pass through");
        };
        assert!(!echo.annotations().contains_key(PROCESSING_ANNOTATION));
        assert_eq!(o.store.gets.load(Ordering::SeqCst), gets);
    }
}
