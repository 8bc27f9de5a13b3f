use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Container;
use kube::ResourceExt;

use crate::{Error, Result};

/// Comma separated list of the fields that decide whether a Job has to be replaced
pub const COMPARISON_ANNOTATION: &str = "job-mutator.sre.rootcloud.info/comparison-content";
/// Set on a Job we recreated ourselves, so that the resulting admission request is not re-evaluated
pub const PROCESSING_ANNOTATION: &str = "job-mutator.sre.rootcloud.info/processing";

pub const LAST_APPLIED_ANNOTATION: &str = "kubectl.kubernetes.io/last-applied-configuration";
// the job controller stamps these onto the pod template; they refer to the uid of the deleted job
const CONTROLLER_UID_LABELS: [&str; 2] = ["controller-uid", "batch.kubernetes.io/controller-uid"];

const PROCESSING_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Namespace and name of a Job, used for every store lookup
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobKey {
    pub namespace: String,
    pub name: String,
}

impl JobKey {
    /// Build the key for an incoming Job.
    ///
    /// The namespace falls back to the one of the admission request, and then to `default`.
    /// A Job without a name cannot be looked up, which is a client error.
    pub fn for_job(job: &Job, request_namespace: Option<&str>) -> Result<Self> {
        let name = match job.metadata.name.as_deref() {
            Some("") | None => return Err(Error::MissingName),
            Some(name) => name.to_owned(),
        };

        let namespace = [job.metadata.namespace.as_deref(), request_namespace]
            .into_iter()
            .flatten()
            .find(|ns| !ns.is_empty())
            .unwrap_or("default")
            .to_owned();

        Ok(Self { namespace, name })
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A field of a container that can take part in the comparison
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ComparisonSelector {
    Image,
    Env,
    EnvFrom,
}

impl ComparisonSelector {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComparisonSelector::Image => "image",
            ComparisonSelector::Env => "env",
            ComparisonSelector::EnvFrom => "envFrom",
        }
    }
}

impl FromStr for ComparisonSelector {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "image" => Ok(ComparisonSelector::Image),
            "env" => Ok(ComparisonSelector::Env),
            "envFrom" => Ok(ComparisonSelector::EnvFrom),
            other => Err(format!("unknown comparison selector {other:?}")),
        }
    }
}

impl fmt::Display for ComparisonSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The set of container fields a Job owner asked us to compare
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ComparisonPolicy(BTreeSet<ComparisonSelector>);

impl ComparisonPolicy {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, selector: ComparisonSelector) -> bool {
        self.0.contains(&selector)
    }

    pub fn iter(&self) -> impl Iterator<Item = ComparisonSelector> + '_ {
        self.0.iter().copied()
    }
}

impl FromIterator<ComparisonSelector> for ComparisonPolicy {
    fn from_iter<T: IntoIterator<Item = ComparisonSelector>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl FromStr for ComparisonPolicy {
    type Err = std::convert::Infallible;

    // unknown tokens are dropped here, so nothing downstream needs to re-check them
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(s.split(',').filter_map(|token| token.parse().ok()).collect())
    }
}

impl fmt::Display for ComparisonPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tokens: Vec<&str> = self.iter().map(|s| s.as_str()).collect();
        f.write_str(&tokens.join(","))
    }
}

/// Whether the Job carries an annotation map at all
pub fn has_annotations(job: &Job) -> bool {
    job.metadata
        .annotations
        .as_ref()
        .is_some_and(|annotations| !annotations.is_empty())
}

/// Whether the Job opted into comparison by carrying the comparison annotation
pub fn has_policy_annotation(job: &Job) -> bool {
    job.annotations().contains_key(COMPARISON_ANNOTATION)
}

/// Parse the comparison policy of a Job; absent or unrecognised input yields an empty policy
pub fn parse_policy(job: &Job) -> ComparisonPolicy {
    job.annotations()
        .get(COMPARISON_ANNOTATION)
        .and_then(|value| value.parse().ok())
        .unwrap_or_default()
}

/// True if this Job is the echo of a recreate we performed; only presence matters
pub fn is_processing_echo(job: &Job) -> bool {
    job.annotations().contains_key(PROCESSING_ANNOTATION)
}

pub fn strip_processing_marker(job: &mut Job) {
    if let Some(annotations) = job.metadata.annotations.as_mut() {
        annotations.remove(PROCESSING_ANNOTATION);
    }
}

pub fn stamp_processing_marker(job: &mut Job, now: DateTime<Utc>) {
    job.annotations_mut().insert(
        PROCESSING_ANNOTATION.to_owned(),
        now.format(PROCESSING_TIMESTAMP_FORMAT).to_string(),
    );
}

/// Clear everything the API server assigned to the Job we are replacing, so the Job can be created afresh
pub fn sanitize_for_create(job: &mut Job) {
    let meta = &mut job.metadata;
    meta.resource_version = None;
    meta.uid = None;
    meta.creation_timestamp = None;
    meta.deletion_timestamp = None;
    meta.deletion_grace_period_seconds = None;
    meta.generation = None;
    meta.managed_fields = None;
    meta.self_link = None;
    if let Some(annotations) = meta.annotations.as_mut() {
        annotations.remove(LAST_APPLIED_ANNOTATION);
    }

    job.status = None;

    if let Some(spec) = job.spec.as_mut() {
        spec.selector = None;
        if let Some(labels) = spec
            .template
            .metadata
            .as_mut()
            .and_then(|m| m.labels.as_mut())
        {
            for label in CONTROLLER_UID_LABELS {
                labels.remove(label);
            }
        }
    }
}

/// The containers of the Job's pod template, empty if the Job has no spec
pub fn containers(job: &Job) -> &[Container] {
    job.spec
        .as_ref()
        .and_then(|spec| spec.template.spec.as_ref())
        .map(|pod| pod.containers.as_slice())
        .unwrap_or_default()
}
