//! Field values held by stored entities.
//!
//! A field is a scalar, a list, a reference to another entity, or a paginated
//! connection of references. References are what make the store normalized:
//! nested objects are never copied into their parent.

use serde::{Deserialize, Serialize};

use crate::connection::Connection;
use crate::entity::EntityKey;

/// Possible values of an entity field.
///
/// # Examples
///
/// ```
/// use smartcache::{EntityKey, Value};
///
/// let title = Value::from("Homepage hero");
/// let story = Value::Ref(EntityKey::new("Story", "7"));
///
/// assert!(title.is_string());
/// assert_eq!(story.as_ref_key(), Some(&EntityKey::new("Story", "7")));
/// ```
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Ref(EntityKey),
    List(Vec<Value>),
    Connection(Connection),
    /// Opaque JSON scalar (custom GraphQL scalars such as `JSON`).
    Json(serde_json::Value),
}

impl Value {
    /// Returns true for `Null`.
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Returns true for `String`.
    pub const fn is_string(&self) -> bool {
        matches!(self, Self::String(_))
    }

    /// Returns true for a reference.
    pub const fn is_ref(&self) -> bool {
        matches!(self, Self::Ref(_))
    }

    /// Returns true for a connection.
    pub const fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_))
    }

    /// The boolean, if this is one.
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// The integer, if this is one.
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// The string, if this is one.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(v) => Some(v),
            _ => None,
        }
    }

    /// Target of a reference.
    pub const fn as_ref_key(&self) -> Option<&EntityKey> {
        match self {
            Self::Ref(key) => Some(key),
            _ => None,
        }
    }

    /// Items of a list.
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    /// The connection, if this is one.
    pub const fn as_connection(&self) -> Option<&Connection> {
        match self {
            Self::Connection(conn) => Some(conn),
            _ => None,
        }
    }

    /// Mutable access to a connection.
    pub fn as_connection_mut(&mut self) -> Option<&mut Connection> {
        match self {
            Self::Connection(conn) => Some(conn),
            _ => None,
        }
    }

    /// Returns a human-readable type name.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Ref(_) => "ref",
            Self::List(_) => "list",
            Self::Connection(_) => "connection",
            Self::Json(_) => "json",
        }
    }

    /// Collects every entity key this value references, in order.
    pub fn collect_references(&self, out: &mut Vec<EntityKey>) {
        match self {
            Self::Ref(key) => out.push(key.clone()),
            Self::List(items) => {
                for item in items {
                    item.collect_references(out);
                }
            }
            Self::Connection(conn) => out.extend(conn.edges().iter().cloned()),
            _ => {}
        }
    }

    /// Rewrites references to `from` so they name `to`.
    ///
    /// Connections keep their dedup invariant: if `to` is already an edge, the
    /// `from` edge is dropped instead of duplicated. Returns true if anything changed.
    pub fn replace_reference(&mut self, from: &EntityKey, to: &EntityKey) -> bool {
        match self {
            Self::Ref(key) if key == from => {
                *key = to.clone();
                true
            }
            Self::List(items) => {
                let mut changed = false;
                for item in items.iter_mut() {
                    changed |= item.replace_reference(from, to);
                }
                changed
            }
            Self::Connection(conn) => conn.replace(from, to),
            _ => false,
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Self::Null
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::String(v) => write!(f, "{v:?}"),
            Self::Ref(key) => write!(f, "ref:{key}"),
            Self::List(items) => write!(f, "list[{}]", items.len()),
            Self::Connection(conn) => write!(f, "connection[{}]", conn.len()),
            Self::Json(v) => write!(f, "{v}"),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<EntityKey> for Value {
    fn from(key: EntityKey) -> Self {
        Self::Ref(key)
    }
}

impl From<Connection> for Value {
    fn from(conn: Connection) -> Self {
        Self::Connection(conn)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collect_references_walks_lists_and_connections() {
        let a = EntityKey::new("Tag", "a");
        let b = EntityKey::new("Tag", "b");
        let c = EntityKey::new("Comment", "c");
        let value = Value::List(vec![
            Value::Ref(a.clone()),
            Value::from(3),
            Value::Connection(Connection::from_edges(vec![b.clone(), c.clone()])),
        ]);

        let mut refs = Vec::new();
        value.collect_references(&mut refs);
        assert_eq!(refs, vec![a, b, c]);
    }

    #[test]
    fn test_replace_reference_in_list() {
        let temp = EntityKey::placeholder("Tag");
        let real = EntityKey::new("Tag", "9");
        let mut value = Value::List(vec![Value::Ref(temp.clone()), Value::from("x")]);

        assert!(value.replace_reference(&temp, &real));
        assert_eq!(value.as_list().unwrap()[0], Value::Ref(real));
        assert!(!value.replace_reference(&temp, &EntityKey::new("Tag", "10")));
    }

    #[test]
    fn test_option_into_value() {
        assert_eq!(Value::from(None::<i64>), Value::Null);
        assert_eq!(Value::from(Some("x")), Value::String("x".to_string()));
    }

    #[test]
    fn test_display() {
        assert_eq!(Value::from("hi").to_string(), "\"hi\"");
        assert_eq!(Value::Ref(EntityKey::new("Story", "1")).to_string(), "ref:Story:1");
        assert_eq!(Value::Null.to_string(), "null");
    }
}
