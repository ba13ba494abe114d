//! Splits GraphQL response trees into normalized entities.
//!
//! Objects carrying `__typename` and `id` become entities and are replaced by
//! references. Objects shaped like a cursor connection (`edges`/`nodes` plus
//! `pageInfo`) become [`Connection`] values. Anything else is kept inline.

use std::collections::BTreeMap;

use serde_json::Value as Json;

use crate::connection::{Connection, PageInfo};
use crate::entity::{EntityKey, Fields};
use crate::error::ExecutionError;
use crate::value::Value;

/// Output of normalizing one response tree.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Normalized {
    /// Value to store under the requested field (usually a ref or connection).
    pub value: Value,
    /// Entities found in the tree, merged per key.
    pub entities: BTreeMap<EntityKey, Fields>,
}

/// Storage field name for a field with arguments, e.g. `stories({"status":"open"})`.
///
/// `serde_json` maps are key-sorted, so equal arguments always give the same name.
#[must_use]
pub fn field_key(name: &str, args: Option<&Json>) -> String {
    match args {
        None | Some(Json::Null) => name.to_string(),
        Some(Json::Object(map)) if map.is_empty() => name.to_string(),
        Some(args) => format!("{name}({args})"),
    }
}

/// Extracts the entity key of a response object, if it has one.
#[must_use]
pub fn identify(obj: &serde_json::Map<String, Json>) -> Option<EntityKey> {
    let typename = obj.get("__typename")?.as_str()?;
    let id = match obj.get("id")? {
        Json::String(s) => s.clone(),
        Json::Number(n) => n.to_string(),
        _ => return None,
    };
    Some(EntityKey::new(typename, id))
}

/// Normalize a response tree.
pub fn normalize(json: &Json) -> Result<Normalized, ExecutionError> {
    let mut entities = BTreeMap::new();
    let value = normalize_into(json, &mut entities)?;
    Ok(Normalized { value, entities })
}

fn normalize_into(
    json: &Json,
    entities: &mut BTreeMap<EntityKey, Fields>,
) -> Result<Value, ExecutionError> {
    Ok(match json {
        Json::Null => Value::Null,
        Json::Bool(b) => Value::Bool(*b),
        Json::Number(n) => match n.as_i64() {
            Some(i) => Value::Int(i),
            None => Value::Float(n.as_f64().unwrap_or(0.0)),
        },
        Json::String(s) => Value::String(s.clone()),
        Json::Array(items) => Value::List(
            items
                .iter()
                .map(|item| normalize_into(item, entities))
                .collect::<Result<_, _>>()?,
        ),
        Json::Object(obj) => {
            if let Some(key) = identify(obj) {
                let mut fields = Fields::new();
                for (name, child) in obj {
                    if name == "__typename" {
                        continue;
                    }
                    fields.insert(name.clone(), normalize_into(child, entities)?);
                }
                entities.entry(key.clone()).or_default().extend(fields);
                Value::Ref(key)
            } else if is_connection(obj) {
                Value::Connection(normalize_connection(obj, entities)?)
            } else {
                Value::Json(json.clone())
            }
        }
    })
}

static NULL: Json = Json::Null;

fn is_connection(obj: &serde_json::Map<String, Json>) -> bool {
    obj.contains_key("pageInfo") && (obj.contains_key("edges") || obj.contains_key("nodes"))
}

fn normalize_connection(
    obj: &serde_json::Map<String, Json>,
    entities: &mut BTreeMap<EntityKey, Fields>,
) -> Result<Connection, ExecutionError> {
    let nodes: Vec<&Json> = match (obj.get("edges"), obj.get("nodes")) {
        (Some(Json::Array(edges)), _) => edges
            .iter()
            .map(|edge| edge.get("node").unwrap_or(&NULL))
            .collect(),
        (_, Some(Json::Array(nodes))) => nodes.iter().collect(),
        _ => {
            return Err(ExecutionError::MalformedPayload {
                reason: "connection edges/nodes must be an array".to_string(),
            })
        }
    };

    let mut keys = Vec::with_capacity(nodes.len());
    for node in nodes {
        match normalize_into(node, entities)? {
            Value::Ref(key) => keys.push(key),
            Value::Null => {}
            other => {
                return Err(ExecutionError::MalformedPayload {
                    reason: format!("connection node without __typename/id ({})", other.type_name()),
                })
            }
        }
    }

    let page_info = obj
        .get("pageInfo")
        .map(|pi| PageInfo {
            end_cursor: pi.get("endCursor").and_then(Json::as_str).map(str::to_string),
            has_next_page: pi.get("hasNextPage").and_then(Json::as_bool).unwrap_or(false),
        })
        .unwrap_or_default();
    let total_count = obj.get("totalCount").and_then(Json::as_i64);

    Ok(Connection::new(keys, page_info, total_count))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_field_key_is_stable() {
        let a = json!({"status": "open", "page": 1});
        let b = json!({"page": 1, "status": "open"});
        assert_eq!(field_key("stories", Some(&a)), field_key("stories", Some(&b)));
        assert_eq!(field_key("me", None), "me");
        assert_eq!(field_key("me", Some(&json!({}))), "me");
    }

    #[test]
    fn test_normalize_nested_entities() {
        let data = json!({
            "__typename": "Story",
            "id": 7,
            "title": "Pricing",
            "batch": {
                "__typename": "SuggestionBatch",
                "id": "b1",
                "suggestions": [
                    {"__typename": "Suggestion", "id": "42", "status": "open"},
                    {"__typename": "Suggestion", "id": "43", "status": "open"}
                ]
            }
        });

        let out = normalize(&data).unwrap();
        assert_eq!(out.value, Value::Ref(EntityKey::new("Story", "7")));
        assert_eq!(out.entities.len(), 4);

        let batch = &out.entities[&EntityKey::new("SuggestionBatch", "b1")];
        assert_eq!(
            batch["suggestions"],
            Value::List(vec![
                Value::Ref(EntityKey::new("Suggestion", "42")),
                Value::Ref(EntityKey::new("Suggestion", "43")),
            ])
        );
        let story = &out.entities[&EntityKey::new("Story", "7")];
        assert!(!story.contains_key("__typename"));
        assert_eq!(story["id"], Value::Int(7));
    }

    #[test]
    fn test_normalize_connection() {
        let data = json!({
            "edges": [
                {"cursor": "a", "node": {"__typename": "Story", "id": "1"}},
                {"cursor": "b", "node": {"__typename": "Story", "id": "2"}},
                {"cursor": "c", "node": {"__typename": "Story", "id": "1"}}
            ],
            "pageInfo": {"endCursor": "c", "hasNextPage": true},
            "totalCount": 10
        });

        let out = normalize(&data).unwrap();
        let conn = out.value.as_connection().unwrap();
        assert_eq!(conn.edges(), &[EntityKey::new("Story", "1"), EntityKey::new("Story", "2")]);
        assert_eq!(conn.page_info().end_cursor.as_deref(), Some("c"));
        assert!(conn.page_info().has_next_page);
        assert_eq!(conn.total_count(), Some(10));
    }

    #[test]
    fn test_connection_with_anonymous_node_is_rejected() {
        let data = json!({"nodes": [{"title": "no id"}], "pageInfo": {}});
        assert!(matches!(
            normalize(&data),
            Err(ExecutionError::MalformedPayload { .. })
        ));
    }

    #[test]
    fn test_plain_objects_stay_inline() {
        let data = json!({"settings": {"theme": "dark"}});
        let out = normalize(&data).unwrap();
        assert!(out.entities.is_empty());
        assert_eq!(out.value, Value::Json(data));
    }
}
