use clap::Parser;
use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhook, MutatingWebhookConfiguration, RuleWithOperations, ServiceReference,
    WebhookClientConfig,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{
    LabelSelector, LabelSelectorRequirement, ObjectMeta,
};

use job_mutator::controllers::hostaliases::controller::WATCHING_LABEL;
use job_mutator::webhook::{JOB_WEBHOOK_PATH, POD_WEBHOOK_PATH};

/// Print the MutatingWebhookConfiguration registering both webhooks
#[derive(Debug, clap::Parser)]
struct Arguments {
    #[arg(long, default_value = "job-mutator")]
    service_name: String,
    #[arg(long, default_value = "job-mutator-system")]
    service_namespace: String,
    #[arg(long, default_value_t = 443)]
    service_port: i32,
    #[arg(long, default_value_t = 10)]
    timeout_seconds: i32,
}

fn main() {
    let args = Arguments::parse();

    let client_config = |path: &str| WebhookClientConfig {
        service: Some(ServiceReference {
            name: args.service_name.clone(),
            namespace: args.service_namespace.clone(),
            path: Some(path.to_owned()),
            port: Some(args.service_port),
        }),
        ..Default::default()
    };

    let rule = |group: &str, resource: &str, operations: &[&str]| RuleWithOperations {
        api_groups: Some(vec![group.to_owned()]),
        api_versions: Some(vec!["v1".to_owned()]),
        operations: Some(operations.iter().map(|o| o.to_string()).collect()),
        resources: Some(vec![resource.to_owned()]),
        ..Default::default()
    };

    let configuration = MutatingWebhookConfiguration {
        metadata: ObjectMeta {
            name: Some(args.service_name.clone()),
            ..Default::default()
        },
        webhooks: Some(vec![
            MutatingWebhook {
                name: "mjob.sre.rootcloud.info".to_owned(),
                admission_review_versions: vec!["v1".to_owned()],
                client_config: client_config(JOB_WEBHOOK_PATH),
                rules: Some(vec![rule("batch", "jobs", &["CREATE", "UPDATE"])]),
                failure_policy: Some("Ignore".to_owned()),
                // deletes and recreates Jobs, but never for dry-run requests
                side_effects: "NoneOnDryRun".to_owned(),
                timeout_seconds: Some(args.timeout_seconds),
                ..Default::default()
            },
            MutatingWebhook {
                name: "mpod.sre.rootcloud.info".to_owned(),
                admission_review_versions: vec!["v1".to_owned()],
                client_config: client_config(POD_WEBHOOK_PATH),
                rules: Some(vec![rule("", "pods", &["CREATE"])]),
                failure_policy: Some("Ignore".to_owned()),
                side_effects: "None".to_owned(),
                timeout_seconds: Some(args.timeout_seconds),
                object_selector: Some(LabelSelector {
                    match_expressions: Some(vec![LabelSelectorRequirement {
                        key: WATCHING_LABEL.to_owned(),
                        operator: "Exists".to_owned(),
                        values: None,
                    }]),
                    match_labels: None,
                }),
                ..Default::default()
            },
        ]),
    };

    print!("{}", serde_yaml::to_string(&configuration).unwrap())
}
