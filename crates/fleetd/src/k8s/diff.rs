//! Node change detection.
//!
//! Two snapshots of the same node are compared field group by field group;
//! the resulting list of changed-field names rides on the update event and
//! decides whether the change is worth an info-level log line.

use std::collections::HashMap;
use std::collections::HashSet;

use k8s_openapi::api::core::v1::Node;
use k8s_openapi::api::core::v1::Taint;

/// Changed fields that warrant an info-level log line.
const IMPORTANT_CHANGES: [&str; 4] = ["status", "schedulable", "taints", "conditions"];

/// Compare two snapshots of one node, naming the field groups that differ.
/// An empty result means the update carries nothing consumers react to.
pub fn detect_changes(old: &Node, new: &Node) -> Vec<String> {
    let mut changes = Vec::new();

    if old.metadata.labels != new.metadata.labels {
        changes.push("labels".to_string());
    }
    if !taints_equal(taints(old), taints(new)) {
        changes.push("taints".to_string());
    }
    if is_schedulable(old) != is_schedulable(new) {
        changes.push("schedulable".to_string());
    }
    if old.metadata.annotations != new.metadata.annotations {
        changes.push("annotations".to_string());
    }
    if ready_status(old) != ready_status(new) {
        changes.push("status".to_string());
    }
    if condition_map(old) != condition_map(new) {
        changes.push("conditions".to_string());
    }

    changes
}

/// Whether a change set touches a field operators watch in logs.
pub fn is_important_change(changes: &[String]) -> bool {
    changes
        .iter()
        .any(|change| IMPORTANT_CHANGES.contains(&change.as_str()))
}

/// Derived readiness from the `Ready` condition: `Ready` when true,
/// `NotReady` for any other recorded status, `Unknown` when the condition is
/// missing entirely.
pub fn ready_status(node: &Node) -> &'static str {
    let conditions = node
        .status
        .as_ref()
        .and_then(|status| status.conditions.as_deref())
        .unwrap_or_default();

    for condition in conditions {
        if condition.type_ == "Ready" {
            return if condition.status == "True" {
                "Ready"
            } else {
                "NotReady"
            };
        }
    }
    "Unknown"
}

/// Whether the node accepts new pods.
pub fn is_schedulable(node: &Node) -> bool {
    !node
        .spec
        .as_ref()
        .and_then(|spec| spec.unschedulable)
        .unwrap_or(false)
}

fn taints(node: &Node) -> &[Taint] {
    node.spec
        .as_ref()
        .and_then(|spec| spec.taints.as_deref())
        .unwrap_or_default()
}

/// Order-insensitive taint comparison keyed by `key=value:effect`.
fn taints_equal(old: &[Taint], new: &[Taint]) -> bool {
    if old.len() != new.len() {
        return false;
    }
    let taint_key = |taint: &Taint| {
        format!(
            "{}={}:{}",
            taint.key,
            taint.value.as_deref().unwrap_or_default(),
            taint.effect
        )
    };
    let old_keys: HashSet<String> = old.iter().map(taint_key).collect();
    new.iter().all(|taint| old_keys.contains(&taint_key(taint)))
}

/// Condition `type` to `status` mapping; other condition fields (heartbeat
/// times, messages) churn constantly and are deliberately ignored.
fn condition_map(node: &Node) -> HashMap<String, String> {
    node.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .map(|condition| (condition.type_.clone(), condition.status.clone()))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::api::core::v1::NodeCondition;
    use k8s_openapi::api::core::v1::NodeSpec;
    use k8s_openapi::api::core::v1::NodeStatus;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use super::*;

    fn test_node(name: &str) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(BTreeMap::from([(
                    "zone".to_string(),
                    "eu-west".to_string(),
                )])),
                ..Default::default()
            },
            spec: Some(NodeSpec::default()),
            status: Some(NodeStatus {
                conditions: Some(vec![NodeCondition {
                    type_: "Ready".to_string(),
                    status: "True".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
        }
    }

    fn taint(key: &str, value: &str, effect: &str) -> Taint {
        Taint {
            key: key.to_string(),
            value: Some(value.to_string()),
            effect: effect.to_string(),
            time_added: None,
        }
    }

    #[test]
    fn identical_nodes_produce_no_changes() {
        let node = test_node("worker-1");
        assert!(
            detect_changes(&node, &node.clone()).is_empty(),
            "identical snapshots must be suppressed"
        );
    }

    #[test]
    fn label_change_is_detected() {
        let old = test_node("worker-1");
        let mut new = test_node("worker-1");
        new.metadata
            .labels
            .get_or_insert_with(Default::default)
            .insert("tier".to_string(), "gold".to_string());

        assert_eq!(detect_changes(&old, &new), vec!["labels".to_string()]);
    }

    #[test]
    fn schedulable_flip_is_detected_and_important() {
        let old = test_node("worker-1");
        let mut new = test_node("worker-1");
        new.spec = Some(NodeSpec {
            unschedulable: Some(true),
            ..Default::default()
        });

        let changes = detect_changes(&old, &new);
        assert_eq!(changes, vec!["schedulable".to_string()]);
        assert!(is_important_change(&changes));
    }

    #[test]
    fn reordered_taints_are_equal() {
        let mut old = test_node("worker-1");
        old.spec = Some(NodeSpec {
            taints: Some(vec![
                taint("a", "1", "NoSchedule"),
                taint("b", "2", "NoExecute"),
            ]),
            ..Default::default()
        });
        let mut new = old.clone();
        if let Some(taints) = new.spec.as_mut().and_then(|spec| spec.taints.as_mut()) {
            taints.reverse();
        }

        assert!(
            detect_changes(&old, &new).is_empty(),
            "taint order must not count as a change"
        );
    }

    #[test]
    fn removed_taint_is_detected() {
        let mut old = test_node("worker-1");
        old.spec = Some(NodeSpec {
            taints: Some(vec![taint("a", "1", "NoSchedule")]),
            ..Default::default()
        });
        let mut new = old.clone();
        new.spec = Some(NodeSpec::default());

        assert_eq!(detect_changes(&old, &new), vec!["taints".to_string()]);
    }

    #[test]
    fn readiness_transition_reports_status_and_conditions() {
        let old = test_node("worker-1");
        let mut new = test_node("worker-1");
        new.status = Some(NodeStatus {
            conditions: Some(vec![NodeCondition {
                type_: "Ready".to_string(),
                status: "False".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        });

        let changes = detect_changes(&old, &new);
        assert!(changes.contains(&"status".to_string()));
        assert!(changes.contains(&"conditions".to_string()));
        assert_eq!(ready_status(&new), "NotReady");
    }

    #[test]
    fn condition_heartbeat_churn_is_ignored() {
        let old = test_node("worker-1");
        let mut new = test_node("worker-1");
        if let Some(conditions) = new
            .status
            .as_mut()
            .and_then(|status| status.conditions.as_mut())
        {
            conditions[0].message = Some("kubelet is posting ready status".to_string());
        }

        assert!(
            detect_changes(&old, &new).is_empty(),
            "condition message changes alone must not produce events"
        );
    }

    #[test]
    fn missing_ready_condition_reads_unknown() {
        let mut node = test_node("worker-1");
        node.status = Some(NodeStatus::default());
        assert_eq!(ready_status(&node), "Unknown");
    }

    #[test]
    fn annotation_change_is_detected_but_not_important() {
        let old = test_node("worker-1");
        let mut new = test_node("worker-1");
        new.metadata.annotations = Some(BTreeMap::from([(
            "note".to_string(),
            "drained".to_string(),
        )]));

        let changes = detect_changes(&old, &new);
        assert_eq!(changes, vec!["annotations".to_string()]);
        assert!(!is_important_change(&changes));
    }
}
