//! Readiness predicates over API object state.
//!
//! A predicate decides that an object has reached its target state. Each
//! waitable kind has a built-in predicate; object specs can override it with
//! a custom field-path predicate.
use kiln_common::config::WaitOptions;
use serde_json::Value;

/// Kinds the engine knows how to wait for.
pub fn kind_is_waitable(kind: &str) -> bool {
    matches!(
        kind,
        "Pod"
            | "Deployment"
            | "StatefulSet"
            | "ReplicaSet"
            | "DaemonSet"
            | "Job"
            | "VirtualMachine"
            | "VirtualMachineInstance"
    )
}

/// Evaluate readiness of `obj` (spec/status document without metadata).
///
/// A custom predicate takes precedence when its kind restriction matches.
pub fn is_ready(kind: &str, obj: &Value, custom: Option<&WaitOptions>) -> bool {
    if let Some(opts) = custom {
        if opts.kind.as_deref().map_or(true, |k| k == kind) {
            return path_equals(obj, &opts.status_path, &opts.expected_value);
        }
    }
    match kind {
        "Pod" => condition_true(obj, "Ready"),
        "Deployment" | "StatefulSet" | "ReplicaSet" => {
            let desired = lookup_path(obj, "spec.replicas")
                .and_then(Value::as_i64)
                .unwrap_or(1);
            let ready = lookup_path(obj, "status.readyReplicas")
                .and_then(Value::as_i64)
                .unwrap_or(0);
            ready >= desired
        }
        "DaemonSet" => {
            let desired = lookup_path(obj, "status.desiredNumberScheduled")
                .and_then(Value::as_i64)
                .unwrap_or(0);
            let ready = lookup_path(obj, "status.numberReady")
                .and_then(Value::as_i64)
                .unwrap_or(0);
            desired > 0 && ready >= desired
        }
        "Job" => condition_true(obj, "Complete"),
        "VirtualMachine" => path_equals(obj, "status.printableStatus", "Running"),
        "VirtualMachineInstance" => path_equals(obj, "status.phase", "Running"),
        _ => true,
    }
}

/// `status.conditions[type=<name>].status == "True"`.
pub fn condition_true(obj: &Value, condition: &str) -> bool {
    path_equals(
        obj,
        &format!("status.conditions[type={condition}].status"),
        "True",
    )
}

/// Compare the value at `path` against a literal, as strings.
pub fn path_equals(obj: &Value, path: &str, expected: &str) -> bool {
    match lookup_path(obj, path) {
        Some(Value::String(s)) => s == expected,
        Some(Value::Bool(b)) => b.to_string() == expected,
        Some(Value::Number(n)) => n.to_string() == expected,
        _ => false,
    }
}

/// Walk a dotted path where each segment is a field name with an optional
/// single `[key=value]` filter selecting an element from an array field.
pub fn lookup_path<'a>(obj: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = obj;
    for segment in path.split('.') {
        let (field, filter) = parse_segment(segment)?;
        current = current.get(field)?;
        if let Some((key, want)) = filter {
            current = current
                .as_array()?
                .iter()
                .find(|entry| entry.get(key).and_then(Value::as_str) == Some(want))?;
        }
    }
    Some(current)
}

fn parse_segment(segment: &str) -> Option<(&str, Option<(&str, &str)>)> {
    match segment.split_once('[') {
        None => Some((segment, None)),
        Some((field, rest)) => {
            let filter = rest.strip_suffix(']')?;
            let (key, value) = filter.split_once('=')?;
            Some((field, Some((key, value))))
        }
    }
}
