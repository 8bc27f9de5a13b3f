use actix_web::{post, web, web::Data, HttpResponse};
use chrono::Utc;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use kube::api::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use kube::ResourceExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;
use tracing::*;

use crate::controllers::hostaliases::HostAliasInjector;
use crate::controllers::jobmutator::{Decision, JobAdmission, JobStore, KubeJobStore, Orchestrator};
use crate::{telemetry, Error, Result, State};

pub const JOB_WEBHOOK_PATH: &str = "/mutate-batch-v1-job";
pub const POD_WEBHOOK_PATH: &str = "/mutate-core-v1-pod";

/// Everything the admission endpoints need
pub struct Webhooks {
    pub jobs: Orchestrator<KubeJobStore>,
    pub pods: HostAliasInjector,
    pub state: State,
}

#[post("/mutate-batch-v1-job")]
async fn mutate_job(webhooks: Data<Webhooks>, body: web::Bytes) -> HttpResponse {
    let received_at = Instant::now();
    let request = match admission_request(&body) {
        Ok(request) => request,
        Err(response) => return HttpResponse::Ok().json(response.into_review()),
    };

    let state = &webhooks.state;
    let _timer = state.metrics.measure("job");
    state.diagnostics.write().await.last_event = Utc::now();

    let response = match review_job(&webhooks.jobs, &request, received_at).await {
        Ok((decision, response)) => {
            state.job_admitted(&decision, request.dry_run).await;
            response
        }
        Err(err) => {
            state.metrics.admission_failure("job", &err);
            denied(&request, &err)
        }
    };

    HttpResponse::Ok().json(response.into_review())
}

#[post("/mutate-core-v1-pod")]
async fn mutate_pod(webhooks: Data<Webhooks>, body: web::Bytes) -> HttpResponse {
    let request = match admission_request(&body) {
        Ok(request) => request,
        Err(response) => return HttpResponse::Ok().json(response.into_review()),
    };

    let state = &webhooks.state;
    let _timer = state.metrics.measure("pod");
    state.diagnostics.write().await.last_event = Utc::now();

    let response = match review_pod(&webhooks.pods, &request).await {
        Ok(response) => {
            state.metrics.admitted("pod", "Allow");
            response
        }
        Err(err) => {
            state.metrics.admission_failure("pod", &err);
            denied(&request, &err)
        }
    };

    HttpResponse::Ok().json(response.into_review())
}

/// Register the admission endpoints on an actix App
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(mutate_job).service(mutate_pod);
}

/// Unwrap the request from an AdmissionReview; a malformed envelope gets an invalid response
pub fn admission_request(
    body: &[u8],
) -> std::result::Result<AdmissionRequest<DynamicObject>, AdmissionResponse> {
    let review: AdmissionReview<DynamicObject> = serde_json::from_slice(body).map_err(|err| {
        error!(error = %err, "Failed to parse admission review");
        AdmissionResponse::invalid(err.to_string())
    })?;
    let request: std::result::Result<AdmissionRequest<DynamicObject>, _> = review.try_into();
    request.map_err(|err| {
        error!(error = %err, "Failed to parse admission request");
        AdmissionResponse::invalid(err.to_string())
    })
}

/// The admitted object both as a typed resource and as it arrived on the wire
pub fn decode_object<K: DeserializeOwned>(
    request: &AdmissionRequest<DynamicObject>,
) -> Result<(K, Value)> {
    let object = request
        .object
        .as_ref()
        .ok_or_else(|| Error::DecodeError("admission request carries no object".into()))?;
    let original = serde_json::to_value(object)?;
    let typed =
        serde_json::from_value(original.clone()).map_err(|err| Error::DecodeError(err.to_string()))?;
    Ok((typed, original))
}

/// JSON patch turning the original object into the mutated one
pub fn mutation_patch<K: Serialize>(original: &Value, mutated: &K) -> Result<json_patch::Patch> {
    let mutated = serde_json::to_value(mutated)?;
    Ok(json_patch::diff(original, &mutated))
}

#[instrument(skip_all, fields(uid = %request.uid, operation = ?request.operation, trace_id))]
pub async fn review_job<S: JobStore>(
    orchestrator: &Orchestrator<S>,
    request: &AdmissionRequest<DynamicObject>,
    received_at: Instant,
) -> Result<(Decision, AdmissionResponse)> {
    if let Some(trace_id) = telemetry::get_trace_id() {
        Span::current().record("trace_id", field::display(&trace_id));
    }

    let (job, original) = decode_object::<Job>(request)?;
    let decision = orchestrator
        .reconcile(JobAdmission {
            uid: request.uid.clone(),
            job,
            namespace: request.namespace.clone(),
            dry_run: request.dry_run,
            received_at,
        })
        .await?;

    let response = job_response(request, &original, &decision)?;
    Ok((decision, response))
}

/// Encode a decision as an admission response
pub fn job_response(
    request: &AdmissionRequest<DynamicObject>,
    original: &Value,
    decision: &Decision,
) -> Result<AdmissionResponse> {
    let response = AdmissionResponse::from(request);
    match decision {
        Decision::AllowUnchanged(reason) => Ok(allowed_because(response, reason.to_string())),
        Decision::AllowMergedMetadata(job) => {
            let patch = mutation_patch(original, job.as_ref())?;
            debug!(operations = patch.0.len(), "Patching admitted Job");
            Ok(response.with_patch(patch)?)
        }
        Decision::Replace(job) if request.dry_run => Ok(allowed_because(
            response,
            format!("dry run, job {} would be deleted and recreated", job.name_any()),
        )),
        // the recreated Job is authoritative; the in-flight request is only acknowledged
        Decision::Replace(job) => Ok(allowed_because(
            response,
            format!("job {} was deleted and recreated", job.name_any()),
        )),
    }
}

#[instrument(skip_all, fields(uid = %request.uid, trace_id))]
pub async fn review_pod(
    injector: &HostAliasInjector,
    request: &AdmissionRequest<DynamicObject>,
) -> Result<AdmissionResponse> {
    if let Some(trace_id) = telemetry::get_trace_id() {
        Span::current().record("trace_id", field::display(&trace_id));
    }

    let (pod, original) = decode_object::<Pod>(request)?;
    let response = AdmissionResponse::from(request);
    match injector.inject(pod).await? {
        None => Ok(response),
        Some(pod) => Ok(response.with_patch(mutation_patch(&original, &pod)?)?),
    }
}

fn allowed_because(mut response: AdmissionResponse, message: String) -> AdmissionResponse {
    response.result.message = message;
    response
}

/// Deny the request, reporting the error and its status code
pub fn denied(request: &AdmissionRequest<DynamicObject>, err: &Error) -> AdmissionResponse {
    warn!(uid = %request.uid, error = %err, "Denying admission request");
    let mut response = AdmissionResponse::from(request).deny(err.to_string());
    response.result.code = err.status_code();
    response
}
