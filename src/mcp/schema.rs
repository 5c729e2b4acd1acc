//! Tool-catalog schema normalization.
//!
//! Downstream consumers of the merged catalog enforce stricter JSON-Schema
//! typing than most child servers emit. This pass rewrites a deep copy of
//! each tool so that every node carries exactly one `type` drawn from
//! `{object, array, string, number, boolean}` wherever one can be
//! determined: `integer` collapses to `number`, union types collapse to a
//! single best candidate, and missing types are inferred from structure.
//!
//! The pass is idempotent: normalizing an already-normalized tree is a
//! no-op.

use serde_json::{Map, Value};

const TYPE_PRIORITY: [&str; 5] = ["object", "array", "string", "number", "boolean"];

/// Normalize a merged tool catalog. Returns a deep copy; the input (still
/// referenced by routing state) is untouched.
pub fn normalize_tools(tools: &[Value]) -> Vec<Value> {
    tools.iter().map(normalize_tool).collect()
}

/// Normalize one tool object (deep copy).
pub fn normalize_tool(tool: &Value) -> Value {
    let mut tool = tool.clone();
    let Some(obj) = tool.as_object_mut() else {
        return tool;
    };

    alias_schema_fields(obj);

    if let Some(schema) = obj.get_mut("inputSchema") {
        walk(schema);
    }
    if let Some(schema) = obj.get_mut("outputSchema") {
        walk(schema);
    }

    tool
}

/// Snake-case aliases and the legacy `parameters` field. `input_schema` is
/// copied (not moved) so children that rely on it keep working; `parameters`
/// only fills the gap when no input schema of either spelling exists.
fn alias_schema_fields(tool: &mut Map<String, Value>) {
    if !tool.contains_key("inputSchema") {
        if let Some(snake) = tool.get("input_schema").cloned() {
            tool.insert("inputSchema".to_string(), snake);
        }
    }
    if !tool.contains_key("outputSchema") {
        if let Some(snake) = tool.get("output_schema").cloned() {
            tool.insert("outputSchema".to_string(), snake);
        }
    }
    if !tool.contains_key("inputSchema") && !tool.contains_key("input_schema") {
        if let Some(params) = tool.remove("parameters") {
            tool.insert("inputSchema".to_string(), params);
        }
    }
}

/// Recursive schema visit. `serde_json::Value` trees are acyclic by
/// construction, so node identity never repeats and plain recursion is the
/// cycle-safe traversal.
fn walk(node: &mut Value) {
    let Some(obj) = node.as_object_mut() else {
        return;
    };

    rewrite_type(obj);
    sanitize_required(obj);

    for key in ["properties", "patternProperties", "dependentSchemas", "$defs", "definitions"] {
        if let Some(Value::Object(children)) = obj.get_mut(key) {
            for child in children.values_mut() {
                walk(child);
            }
        }
    }

    if let Some(additional) = obj.get_mut("additionalProperties") {
        if additional.is_object() {
            walk(additional);
        }
    }
    if let Some(names) = obj.get_mut("propertyNames") {
        walk(names);
    }

    match obj.get_mut("items") {
        Some(Value::Array(items)) => {
            for item in items.iter_mut() {
                walk(item);
            }
        }
        Some(item) => walk(item),
        None => {}
    }

    for key in ["anyOf", "oneOf", "allOf"] {
        if let Some(Value::Array(variants)) = obj.get_mut(key) {
            for variant in variants.iter_mut() {
                walk(variant);
            }
        }
    }
}

fn rewrite_type(obj: &mut Map<String, Value>) {
    let rewritten = match obj.get("type") {
        Some(Value::String(s)) if s == "integer" => Some("number".to_string()),
        Some(Value::Array(_)) => Some(collapse_union(obj)),
        Some(_) => None,
        None if !obj.contains_key("$ref") => Some(infer_type(obj).to_string()),
        None => None,
    };
    if let Some(t) = rewritten {
        obj.insert("type".to_string(), Value::String(t));
    }
}

/// Collapse a union `type` array to one string.
fn collapse_union(obj: &Map<String, Value>) -> String {
    let Some(Value::Array(members)) = obj.get("type") else {
        return "string".to_string();
    };

    let mut candidates: Vec<String> = Vec::new();
    for member in members {
        let Some(s) = member.as_str() else { continue };
        if matches!(s, "null" | "undefined" | "") {
            continue;
        }
        let s = if s == "integer" { "number" } else { s };
        if !candidates.iter().any(|c| c == s) {
            candidates.push(s.to_string());
        }
    }

    match candidates.len() {
        0 => return "string".to_string(),
        1 => return candidates.remove(0),
        _ => {}
    }

    // Prefer the candidate the node's own structure points at.
    let has = |t: &str| candidates.iter().any(|c| c == t);
    if obj.get("properties").map(Value::is_object).unwrap_or(false) && has("object") {
        return "object".to_string();
    }
    if obj.contains_key("items") && has("array") {
        return "array".to_string();
    }
    if let Some(Value::Array(variants)) = obj.get("enum") {
        if let Some(first) = variants.first() {
            let native = native_type(first);
            if has(native) {
                return native.to_string();
            }
        }
    }

    for t in TYPE_PRIORITY {
        if has(t) {
            return t.to_string();
        }
    }
    candidates.remove(0)
}

/// Infer a `type` for a node that has none (and no `$ref`).
fn infer_type(obj: &Map<String, Value>) -> &'static str {
    if let Some(Value::Array(variants)) = obj.get("enum") {
        if let Some(first) = variants.first() {
            return native_type(first);
        }
    }
    if obj.contains_key("properties") {
        "object"
    } else if obj.contains_key("items") {
        "array"
    } else {
        "string"
    }
}

/// Native type name of a JSON value, host-language semantics: a plain array
/// maps to "array", a plain object to "object", null to "object".
fn native_type(value: &Value) -> &'static str {
    match value {
        Value::Array(_) => "array",
        Value::Object(_) | Value::Null => "object",
        Value::String(_) => "string",
        Value::Number(_) => "number",
        Value::Bool(_) => "boolean",
    }
}

fn sanitize_required(obj: &mut Map<String, Value>) {
    let malformed = match obj.get_mut("required") {
        Some(Value::Array(entries)) => {
            entries.retain(Value::is_string);
            false
        }
        Some(_) => true,
        None => false,
    };
    if malformed {
        obj.remove("required");
    }
}
