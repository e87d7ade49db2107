//! Per-cluster values rendering.
//!
//! A values template is plain text with `{{ .Cluster.<path> }}` placeholders.
//! The path is resolved against the cluster's serialized form, so
//! `.Cluster.metadata.name` and `.Cluster.metadata.labels.region` work, and
//! label keys containing dots or slashes resolve as whole keys.

use chartfleet_state::Cluster;
use serde_json::Value;

use crate::error::{ControllerError, ControllerResult};

const OPEN: &str = "{{";
const CLOSE: &str = "}}";
const ROOT: &str = ".Cluster";

/// Render `template` for `cluster`.
pub fn render(template: &str, cluster: &Cluster) -> ControllerResult<String> {
    let fail = |reason: String| ControllerError::ValuesTemplate {
        cluster: cluster.metadata.key().to_string(),
        reason,
    };

    if !template.contains(OPEN) {
        return Ok(template.to_string());
    }
    let root = serde_json::to_value(cluster).map_err(|e| fail(e.to_string()))?;

    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find(OPEN) {
        out.push_str(&rest[..start]);
        let after = &rest[start + OPEN.len()..];
        let end = after
            .find(CLOSE)
            .ok_or_else(|| fail(format!("unterminated placeholder at {:?}", &rest[start..])))?;
        let expr = after[..end].trim();
        out.push_str(&resolve(&root, expr).map_err(fail)?);
        rest = &after[end + CLOSE.len()..];
    }
    out.push_str(rest);
    Ok(out)
}

fn resolve(root: &Value, expr: &str) -> Result<String, String> {
    let path = expr
        .strip_prefix(ROOT)
        .ok_or_else(|| format!("placeholder {expr:?} must start with {ROOT}"))?;
    let path = path
        .strip_prefix('.')
        .ok_or_else(|| format!("placeholder {expr:?} names no field"))?;
    let segments: Vec<&str> = path.split('.').collect();

    let mut current = root;
    let mut i = 0;
    while i < segments.len() {
        let map = current
            .as_object()
            .ok_or_else(|| format!("{expr:?}: {} is not an object", segments[..i].join(".")))?;
        // Longest match first so keys like `example.com/zone` resolve whole.
        let (next, used) = (1..=segments.len() - i)
            .rev()
            .find_map(|n| map.get(&segments[i..i + n].join(".")).map(|v| (v, n)))
            .ok_or_else(|| format!("{expr:?}: no field {:?}", segments[i]))?;
        current = next;
        i += used;
    }

    match current {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        _ => Err(format!("{expr:?} does not resolve to a scalar")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster() -> Cluster {
        Cluster::new(
            "fleet",
            "eu-1",
            &[("region", "eu"), ("topology.example.com/zone", "eu-west-1a")],
        )
    }

    #[test]
    fn plain_text_passes_through() {
        assert_eq!(render("replicas: 3\n", &cluster()).unwrap(), "replicas: 3\n");
    }

    #[test]
    fn substitutes_cluster_fields() {
        let out = render(
            "name: {{ .Cluster.metadata.name }}\nns: {{.Cluster.metadata.namespace}}\nregion: {{ .Cluster.metadata.labels.region }}\n",
            &cluster(),
        )
        .unwrap();
        assert_eq!(out, "name: eu-1\nns: fleet\nregion: eu\n");
    }

    #[test]
    fn dotted_label_keys_resolve_whole() {
        let out = render(
            "zone: {{ .Cluster.metadata.labels.topology.example.com/zone }}",
            &cluster(),
        )
        .unwrap();
        assert_eq!(out, "zone: eu-west-1a");
    }

    #[test]
    fn numbers_render_as_text() {
        let out = render("gen: {{ .Cluster.metadata.generation }}", &cluster()).unwrap();
        assert_eq!(out, "gen: 0");
    }

    #[test]
    fn errors_are_reported() {
        for bad in [
            "{{ .Cluster.metadata.nope }}",
            "{{ .Cluster.metadata.labels }}",
            "{{ .Other.name }}",
            "{{ .Cluster }}",
            "x: {{ .Cluster.metadata.name",
            "{{ .Cluster.metadata.name.first }}",
        ] {
            let err = render(bad, &cluster()).unwrap_err();
            assert!(
                matches!(err, ControllerError::ValuesTemplate { .. }),
                "{bad}: {err}"
            );
        }
    }
}
