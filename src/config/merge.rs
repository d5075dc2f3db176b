//! # Base Profile Merge
//!
//! Deep-merges a named base profile under the user's config. The merge
//! works on raw YAML documents so "field present in the user config" keeps
//! its meaning; the merged document is deserialized afterwards.
//!
//! Rules:
//! - step lists merge by `(name, workspace)`; a user step with
//!   `remove: true` drops the matching base step; unmatched user steps
//!   append (keeping `remove` for the runtime destroy flow)
//! - module lists inside a step merge by `name` with the same rule
//! - module `inputs` maps merge key-wise, user value wins per key
//! - everything else: user overrides base

use serde_yaml::{Mapping, Value};

/// Merge the user's document over the base profile document.
pub fn merge_documents(base: Value, user: Value) -> Value {
    merge_value(base, user, MergeContext::Root)
}

#[derive(Clone, Copy, PartialEq)]
enum MergeContext {
    Root,
    Step,
    Module,
    Inputs,
}

fn merge_value(base: Value, user: Value, context: MergeContext) -> Value {
    match (base, user) {
        (Value::Mapping(base_map), Value::Mapping(user_map)) => {
            Value::Mapping(merge_mappings(base_map, user_map, context))
        }
        // Scalars, sequences and mismatched shapes: user wins.
        (_, user) => user,
    }
}

fn merge_mappings(base: Mapping, user: Mapping, context: MergeContext) -> Mapping {
    let mut result = Mapping::new();
    for (key, base_value) in base {
        let merged = match user.get(&key) {
            Some(user_value) => merge_field(&key, base_value, user_value.clone(), context),
            None => base_value,
        };
        result.insert(key, merged);
    }
    for (key, user_value) in user {
        if !result.contains_key(&key) {
            result.insert(key, user_value);
        }
    }
    result
}

fn merge_field(key: &Value, base: Value, user: Value, context: MergeContext) -> Value {
    let key_name = key.as_str().unwrap_or_default();
    match (context, key_name) {
        (MergeContext::Root, "steps") => merge_named_list(base, user, step_key, MergeContext::Step),
        (MergeContext::Step, "modules") => {
            merge_named_list(base, user, module_key, MergeContext::Module)
        }
        (MergeContext::Module, "inputs") => merge_value(base, user, MergeContext::Inputs),
        (MergeContext::Inputs, _) => user,
        _ => merge_value(base, user, context),
    }
}

/// Merge two lists of named entries: base order first, matches merged,
/// `remove: true` matches dropped, new user entries appended.
fn merge_named_list(
    base: Value,
    user: Value,
    key_of: fn(&Value) -> Option<String>,
    context: MergeContext,
) -> Value {
    let (base_items, user_items) = match (base, user) {
        (Value::Sequence(b), Value::Sequence(u)) => (b, u),
        (_, user) => return user,
    };

    let mut result = Vec::new();
    let mut matched = vec![false; user_items.len()];

    for base_item in base_items {
        let base_key = key_of(&base_item);
        let user_match = user_items
            .iter()
            .enumerate()
            .find(|(_, u)| base_key.is_some() && key_of(u) == base_key);
        match user_match {
            Some((i, user_item)) => {
                matched[i] = true;
                if is_removed(user_item) {
                    continue;
                }
                result.push(merge_value(base_item, user_item.clone(), context));
            }
            None => result.push(base_item),
        }
    }

    for (i, user_item) in user_items.into_iter().enumerate() {
        if !matched[i] {
            result.push(user_item);
        }
    }

    Value::Sequence(result)
}

fn is_removed(item: &Value) -> bool {
    item.get("remove").and_then(Value::as_bool).unwrap_or(false)
}

fn step_key(item: &Value) -> Option<String> {
    let name = item.get("name")?.as_str()?;
    let workspace = item.get("workspace").and_then(Value::as_str).unwrap_or("");
    Some(format!("{name}\u{1f}{workspace}"))
}

fn module_key(item: &Value) -> Option<String> {
    Some(item.get("name")?.as_str()?.to_string())
}
