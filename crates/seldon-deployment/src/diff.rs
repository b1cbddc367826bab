//! Semantic comparison of desired and live objects
//!
//! The API server fills in defaults the operator never sets (`clusterIP`,
//! `imagePullPolicy`, probe thresholds, `revisionHistoryLimit`, ...). A live
//! object therefore matches a desired one when every field the operator
//! sets has the same value live; extra live fields are ignored. Labels are
//! compared exactly because they drive selection. Annotations use the same
//! subset rule since controllers add their own (`deployment.kubernetes.io/revision`).
//! Resource quantities compare by amount, since the server rewrites them
//! into canonical form ("0.5" comes back as "500m", "1024Mi" as "1Gi").

use seldon_common::config::parse_quantity;
use serde_json::Value;

/// Paths at which `live` differs from `desired`, empty when they match
pub fn diff(desired: &Value, live: &Value) -> Vec<String> {
    let mut out = Vec::new();

    let desired_meta = desired.get("metadata");
    let live_meta = live.get("metadata");
    let labels = |meta: Option<&Value>| {
        meta.and_then(|m| m.get("labels"))
            .cloned()
            .filter(|l| !is_empty(l))
            .unwrap_or(Value::Null)
    };
    if labels(desired_meta) != labels(live_meta) {
        out.push("metadata.labels".to_string());
    }
    if let Some(annotations) = desired_meta.and_then(|m| m.get("annotations")) {
        let live_annotations = live_meta.and_then(|m| m.get("annotations"));
        subset("metadata.annotations", annotations, live_annotations, &mut out);
    }

    if let Value::Object(fields) = desired {
        for (key, value) in fields {
            if matches!(key.as_str(), "metadata" | "status" | "apiVersion" | "kind") {
                continue;
            }
            subset(key, value, live.get(key), &mut out);
        }
    }
    out
}

fn subset(path: &str, desired: &Value, live: Option<&Value>, out: &mut Vec<String>) {
    let live = live.unwrap_or(&Value::Null);
    match (desired, live) {
        (d, Value::Null) if is_empty(d) => {}
        (Value::Object(d), Value::Object(l)) => {
            for (key, value) in d {
                subset(&join(path, key), value, l.get(key), out);
            }
        }
        (Value::Array(d), Value::Array(l)) => {
            if d.len() != l.len() {
                out.push(path.to_string());
                return;
            }
            for (i, (dv, lv)) in d.iter().zip(l).enumerate() {
                subset(&format!("{path}[{i}]"), dv, Some(lv), out);
            }
        }
        (Value::Number(d), Value::Number(l)) => {
            if d.as_f64() != l.as_f64() {
                out.push(path.to_string());
            }
        }
        (Value::String(d), Value::String(l)) if is_quantity_path(path) => {
            let same = match (parse_quantity(d), parse_quantity(l)) {
                (Some(d), Some(l)) => d == l,
                _ => d == l,
            };
            if !same {
                out.push(path.to_string());
            }
        }
        (d, l) => {
            if d != l {
                out.push(path.to_string());
            }
        }
    }
}

/// Fields holding a `resource.Quantity`: container resources, HPA metric
/// targets and `emptyDir` size limits
fn is_quantity_path(path: &str) -> bool {
    let (parent, field) = path.rsplit_once('.').unwrap_or(("", path));
    parent.ends_with(".requests")
        || parent.ends_with(".limits")
        || matches!(field, "averageValue" | "sizeLimit")
        || (field == "value" && parent.ends_with(".target"))
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

fn join(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{path}.{key}")
    }
}
