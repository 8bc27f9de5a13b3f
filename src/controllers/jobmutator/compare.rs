use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Container;

use crate::resources::jobs::{containers, ComparisonPolicy, ComparisonSelector};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Comparison {
    Same,
    Different,
}

/// Compare the pod template containers of two Jobs under a policy.
///
/// Containers are paired by position rather than by name, so reordering containers is seen as a
/// change of whatever the policy selects. A differing number of containers is always a change.
pub fn compare(old: &Job, new: &Job, policy: &ComparisonPolicy) -> Comparison {
    let old = containers(old);
    let new = containers(new);

    if old.len() != new.len() {
        return Comparison::Different;
    }

    let same = old.iter().zip(new).all(|(old, new)| {
        policy
            .iter()
            .all(|selector| selector_matches(selector, old, new))
    });

    if same {
        Comparison::Same
    } else {
        Comparison::Different
    }
}

fn selector_matches(selector: ComparisonSelector, old: &Container, new: &Container) -> bool {
    match selector {
        ComparisonSelector::Image => old.image == new.image,
        // an absent list equals an empty one; entries are compared by full value and in order
        ComparisonSelector::Env => {
            old.env.as_deref().unwrap_or_default() == new.env.as_deref().unwrap_or_default()
        }
        ComparisonSelector::EnvFrom => {
            old.env_from.as_deref().unwrap_or_default()
                == new.env_from.as_deref().unwrap_or_default()
        }
    }
}
