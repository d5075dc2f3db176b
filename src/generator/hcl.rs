//! YAML-to-HCL value rendering for module inputs.
//!
//! Scalar strings become quoted HCL strings, numbers and booleans pass
//! through bare, sequences and mappings render structurally. Replacement
//! tokens are already expanded by the time values arrive here.

use serde_yaml::Value;

const INDENT: &str = "  ";

/// Render one input value as an HCL expression at the given nesting depth.
pub fn render(value: &Value, depth: usize) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => quote(s),
        Value::Sequence(items) => render_sequence(items, depth),
        Value::Mapping(map) => render_mapping(map, depth),
        Value::Tagged(tagged) => render(&tagged.value, depth),
    }
}

/// Render one `key = value` assignment line.
pub fn render_assignment(key: &str, value: &Value, depth: usize) -> String {
    format!(
        "{}{} = {}",
        INDENT.repeat(depth),
        render_key(key),
        render(value, depth)
    )
}

fn render_sequence(items: &[Value], depth: usize) -> String {
    if items.is_empty() {
        return "[]".to_string();
    }
    let inner: Vec<String> = items
        .iter()
        .map(|v| format!("{}{}", INDENT.repeat(depth + 1), render(v, depth + 1)))
        .collect();
    format!(
        "[\n{}\n{}]",
        inner.join(",\n"),
        INDENT.repeat(depth)
    )
}

fn render_mapping(map: &serde_yaml::Mapping, depth: usize) -> String {
    if map.is_empty() {
        return "{}".to_string();
    }
    let inner: Vec<String> = map
        .iter()
        .map(|(k, v)| {
            let key = yaml_key(k);
            format!(
                "{}{} = {}",
                INDENT.repeat(depth + 1),
                render_key(&key),
                render(v, depth + 1)
            )
        })
        .collect();
    format!("{{\n{}\n{}}}", inner.join("\n"), INDENT.repeat(depth))
}

fn yaml_key(key: &Value) -> String {
    match key {
        Value::String(s) => s.clone(),
        other => render(other, 0),
    }
}

/// Bare identifiers stay bare; anything else is quoted.
fn render_key(key: &str) -> String {
    let bare = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if bare {
        key.to_string()
    } else {
        quote(key)
    }
}

fn quote(s: &str) -> String {
    let escaped = s
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n");
    format!("\"{escaped}\"")
}
