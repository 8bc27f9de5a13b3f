use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("SerializationError: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Kube Error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Failed to serialize patch: {0}")]
    PatchError(#[from] kube::core::admission::SerializePatchError),

    #[error("Failed to decode admitted object: {0}")]
    DecodeError(String),

    #[error("resource name is required")]
    MissingName,

    #[error("{operation} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        operation: &'static str,
        attempts: u32,
        #[source]
        source: kube::Error,
    },

    #[error("Job {job} was still present {waited:?} after it was deleted")]
    DeletionTimeout { job: String, waited: Duration },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn metric_label(&self) -> &'static str {
        match self {
            Error::SerializationError(_) => "SerializationError",
            Error::KubeError(_) => "KubeError",
            Error::PatchError(_) => "PatchError",
            Error::DecodeError(_) => "DecodeError",
            Error::MissingName => "MissingName",
            Error::RetriesExhausted { .. } => "RetriesExhausted",
            Error::DeletionTimeout { .. } => "DeletionTimeout",
        }
    }

    /// HTTP status reported when the error denies an admission request
    pub fn status_code(&self) -> u16 {
        match self {
            Error::DecodeError(_) | Error::MissingName => 400,
            _ => 500,
        }
    }
}

pub mod controllers;

/// Admission review endpoints
pub mod webhook;

/// Log and trace integrations
pub mod telemetry;

/// Metrics
mod metrics;

pub use controllers::State;
pub use metrics::Metrics;

/// Kubernetes resources handled by the webhooks
pub mod resources;
