pub mod compare;
pub mod controller;
pub mod store;

pub use controller::{Config, Decision, JobAdmission, Orchestrator, SkipReason};
pub use store::{JobStore, KubeJobStore, RetryPolicy};
