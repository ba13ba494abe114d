//! Query result materialization.
//!
//! Key invariants:
//! - Materialization is a pure function of store contents and the shape.
//! - Missing data surfaces as `ResultNode::Missing`, never as an error.
//! - Dangling references in lists and connections are skipped, not resolved.
//! - Unchanged subtrees keep the previous `Arc` (see `stabilize`).

use std::collections::HashSet;
use std::sync::Arc;

use crate::connection::PageInfo;
use crate::entity::{EntityKey, Fields};
use crate::storage::{EntityStore, StorageError};
use crate::value::Value;

use super::shape::{FieldSelection, SelectionSet};

/// Materialized object: an entity (or inline value) projected onto a selection.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultObject {
    /// Source entity, if the object came from the store.
    pub key: Option<EntityKey>,
    /// Fields in selection order.
    pub fields: Vec<(String, ResultNode)>,
}

impl ResultObject {
    /// Look up an output field.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ResultNode> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }
}

/// Materialized connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultConnection {
    /// Materialized edges; dangling edges are skipped.
    pub nodes: Vec<ResultNode>,
    /// Pagination state.
    pub page_info: PageInfo,
    /// Server-side total, if requested.
    pub total_count: Option<i64>,
}

/// A node of a materialized result tree.
///
/// Nodes are immutable snapshots; the shared parts are reference-counted so an
/// unchanged subtree can be handed out again without copying.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultNode {
    /// The field or entity is not (yet) in the store.
    Missing,
    /// A leaf value.
    Scalar(Value),
    /// An entity or embedded object with its selected fields.
    Object(Arc<ResultObject>),
    /// A plain list.
    List(Arc<[ResultNode]>),
    /// A paginated list of entities.
    Connection(Arc<ResultConnection>),
}

impl ResultNode {
    /// Returns true for [`ResultNode::Missing`].
    #[must_use]
    pub const fn is_missing(&self) -> bool {
        matches!(self, Self::Missing)
    }

    /// The object, if this is one.
    #[must_use]
    pub fn as_object(&self) -> Option<&ResultObject> {
        match self {
            Self::Object(obj) => Some(obj),
            _ => None,
        }
    }

    /// The scalar, if this is one.
    #[must_use]
    pub fn as_scalar(&self) -> Option<&Value> {
        match self {
            Self::Scalar(v) => Some(v),
            _ => None,
        }
    }

    /// Items of a list.
    #[must_use]
    pub fn as_list(&self) -> Option<&[ResultNode]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    /// The connection, if this is one.
    #[must_use]
    pub fn as_connection(&self) -> Option<&ResultConnection> {
        match self {
            Self::Connection(conn) => Some(conn),
            _ => None,
        }
    }

    /// Follows a dotted path of output field names through objects.
    #[must_use]
    pub fn path(&self, path: &str) -> Option<&ResultNode> {
        let mut node = self;
        for part in path.split('.').filter(|p| !p.is_empty()) {
            node = node.as_object()?.get(part)?;
        }
        Some(node)
    }

    /// Returns true if both nodes share the same allocation (or are equal scalars).
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Object(a), Self::Object(b)) => Arc::ptr_eq(a, b),
            (Self::List(a), Self::List(b)) => Arc::ptr_eq(a, b),
            (Self::Connection(a), Self::Connection(b)) => Arc::ptr_eq(a, b),
            (Self::Missing, Self::Missing) => true,
            (Self::Scalar(a), Self::Scalar(b)) => a == b,
            _ => false,
        }
    }
}

/// Whether every requested field was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completeness {
    /// Nothing missing.
    Complete,
    /// Paths (`batch.suggestions[0].status`) that were missing.
    Partial { missing: Vec<String> },
}

/// A materialized query result.
#[derive(Debug, Clone, PartialEq)]
pub struct Materialized {
    /// Result tree rooted at the requested entity.
    pub data: ResultNode,
    /// Whether anything was missing.
    pub completeness: Completeness,
    /// Every entity key read while materializing, including keys that were absent.
    pub dependencies: HashSet<EntityKey>,
}

impl Materialized {
    /// Every requested field was found.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        matches!(self.completeness, Completeness::Complete)
    }
}

/// Resolves query shapes against an entity store.
pub struct Materializer<'a> {
    store: &'a dyn EntityStore,
}

struct Walk {
    dependencies: HashSet<EntityKey>,
    missing: Vec<String>,
}

impl<'a> Materializer<'a> {
    /// Create an empty instance.
    #[must_use]
    pub fn new(store: &'a dyn EntityStore) -> Self {
        Self { store }
    }

    /// Materialize `selection` rooted at the entity `root`.
    pub fn materialize(&self, selection: &SelectionSet, root: &EntityKey) -> Result<Materialized, StorageError> {
        let mut walk = Walk {
            dependencies: HashSet::new(),
            missing: Vec::new(),
        };

        let data = match self.load(root, &mut walk)? {
            Some(fields) => self.object(Some(root), &fields, selection, "", &mut walk)?,
            None => {
                walk.missing.push(String::new());
                ResultNode::Missing
            }
        };

        let completeness = if walk.missing.is_empty() {
            Completeness::Complete
        } else {
            Completeness::Partial {
                missing: walk.missing,
            }
        };

        Ok(Materialized {
            data,
            completeness,
            dependencies: walk.dependencies,
        })
    }

    /// Materialize and reuse every unchanged subtree of `previous`.
    pub fn materialize_with_previous(
        &self,
        selection: &SelectionSet,
        root: &EntityKey,
        previous: Option<&Materialized>,
    ) -> Result<Materialized, StorageError> {
        let mut next = self.materialize(selection, root)?;
        if let Some(prev) = previous {
            next.data = stabilize(&prev.data, next.data);
        }
        Ok(next)
    }

    fn load(&self, key: &EntityKey, walk: &mut Walk) -> Result<Option<Fields>, StorageError> {
        walk.dependencies.insert(key.clone());
        self.store.read(key)
    }

    fn object(
        &self,
        key: Option<&EntityKey>,
        fields: &Fields,
        selection: &SelectionSet,
        path: &str,
        walk: &mut Walk,
    ) -> Result<ResultNode, StorageError> {
        let mut out = Vec::with_capacity(selection.fields().len());
        for field in selection.fields() {
            let child_path = join(path, field.output_name());
            let node = if field.name == "__typename" {
                match key {
                    Some(k) => ResultNode::Scalar(Value::String(k.typename.to_string())),
                    None => ResultNode::Missing,
                }
            } else {
                match fields.get(&field.name) {
                    Some(value) => self.value(value, field, &child_path, walk)?,
                    None => ResultNode::Missing,
                }
            };
            if node.is_missing() {
                walk.missing.push(child_path);
            }
            out.push((field.output_name().to_string(), node));
        }
        Ok(ResultNode::Object(Arc::new(ResultObject {
            key: key.cloned(),
            fields: out,
        })))
    }

    fn value(
        &self,
        value: &Value,
        field: &FieldSelection,
        path: &str,
        walk: &mut Walk,
    ) -> Result<ResultNode, StorageError> {
        let Some(selection) = field.selection.as_ref() else {
            return Ok(ResultNode::Scalar(value.clone()));
        };

        match value {
            Value::Ref(key) => match self.load(key, walk)? {
                Some(fields) => self.object(Some(key), &fields, selection, path, walk),
                None => Ok(ResultNode::Missing),
            },
            Value::List(items) => {
                let mut out = Vec::with_capacity(items.len());
                for (i, item) in items.iter().enumerate() {
                    let item_path = format!("{path}[{i}]");
                    if let Value::Ref(key) = item {
                        // Evicted entities drop out of lists lazily.
                        match self.load(key, walk)? {
                            Some(fields) => out.push(self.object(Some(key), &fields, selection, &item_path, walk)?),
                            None => continue,
                        }
                    } else {
                        out.push(self.value(item, field, &item_path, walk)?);
                    }
                }
                Ok(ResultNode::List(out.into()))
            }
            Value::Connection(conn) => {
                let mut nodes = Vec::with_capacity(conn.len());
                for key in conn.edges() {
                    let node_path = format!("{path}[{}]", nodes.len());
                    if let Some(fields) = self.load(key, walk)? {
                        nodes.push(self.object(Some(key), &fields, selection, &node_path, walk)?);
                    }
                }
                Ok(ResultNode::Connection(Arc::new(ResultConnection {
                    nodes,
                    page_info: conn.page_info().clone(),
                    total_count: conn.total_count(),
                })))
            }
            other => Ok(ResultNode::Scalar(other.clone())),
        }
    }
}

fn join(path: &str, name: &str) -> String {
    if path.is_empty() {
        name.to_string()
    } else {
        format!("{path}.{name}")
    }
}

/// Returns `next`, substituting `prev`'s allocations wherever content is unchanged.
#[must_use]
pub fn stabilize(prev: &ResultNode, next: ResultNode) -> ResultNode {
    if *prev == next {
        return prev.clone();
    }

    match (prev, next) {
        (ResultNode::Object(p), ResultNode::Object(n)) => {
            let n = Arc::try_unwrap(n).unwrap_or_else(|shared| (*shared).clone());
            let fields = n
                .fields
                .into_iter()
                .map(|(name, node)| match p.get(&name) {
                    Some(prev_child) => {
                        let node = stabilize(prev_child, node);
                        (name, node)
                    }
                    None => (name, node),
                })
                .collect();
            ResultNode::Object(Arc::new(ResultObject { key: n.key, fields }))
        }
        (ResultNode::List(p), ResultNode::List(n)) => {
            let items: Vec<ResultNode> = n
                .iter()
                .cloned()
                .map(|node| stabilize_by_key(p, node))
                .collect();
            ResultNode::List(items.into())
        }
        (ResultNode::Connection(p), ResultNode::Connection(n)) => {
            let n = Arc::try_unwrap(n).unwrap_or_else(|shared| (*shared).clone());
            let nodes = n
                .nodes
                .into_iter()
                .map(|node| stabilize_by_key(&p.nodes, node))
                .collect();
            ResultNode::Connection(Arc::new(ResultConnection {
                nodes,
                page_info: n.page_info,
                total_count: n.total_count,
            }))
        }
        (_, next) => next,
    }
}

// List items are matched by entity key so removing one item does not
// invalidate its siblings.
fn stabilize_by_key(prev_items: &[ResultNode], node: ResultNode) -> ResultNode {
    let key = node.as_object().and_then(|o| o.key.clone());
    match key {
        Some(key) => {
            let prev = prev_items
                .iter()
                .find(|p| p.as_object().and_then(|o| o.key.as_ref()) == Some(&key));
            match prev {
                Some(prev) => stabilize(prev, node),
                None => node,
            }
        }
        None => node,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;
    use crate::storage::InMemoryEntityStore;

    fn seed() -> (InMemoryEntityStore, EntityKey) {
        let store = InMemoryEntityStore::new();
        let batch = EntityKey::new("SuggestionBatch", "b1");
        let s42 = EntityKey::new("Suggestion", "42");
        let s43 = EntityKey::new("Suggestion", "43");

        store.write_field(&s42, "status", Value::from("open")).unwrap();
        store.write_field(&s43, "status", Value::from("open")).unwrap();
        store
            .write_field(
                &batch,
                "suggestions",
                Value::Connection(Connection::from_edges(vec![s42, s43])),
            )
            .unwrap();
        store.write_field(&batch, "title", Value::from("Hero copy")).unwrap();
        (store, batch)
    }

    #[test]
    fn test_materialize_connection() {
        let (store, batch) = seed();
        let shape = SelectionSet::parse("title suggestions { __typename status }").unwrap();
        let out = Materializer::new(&store).materialize(&shape, &batch).unwrap();

        assert!(out.is_complete());
        let conn = out.data.path("suggestions").unwrap().as_connection().unwrap();
        assert_eq!(conn.nodes.len(), 2);
        assert_eq!(
            conn.nodes[0].path("__typename").unwrap().as_scalar(),
            Some(&Value::from("Suggestion"))
        );
        assert!(out.dependencies.contains(&EntityKey::new("Suggestion", "43")));
    }

    #[test]
    fn test_missing_fields_are_reported_not_thrown() {
        let (store, batch) = seed();
        let shape = SelectionSet::parse("title author { name } suggestions { body }").unwrap();
        let out = Materializer::new(&store).materialize(&shape, &batch).unwrap();

        assert_eq!(
            out.completeness,
            Completeness::Partial {
                missing: vec![
                    "author".to_string(),
                    "suggestions[0].body".to_string(),
                    "suggestions[1].body".to_string(),
                ]
            }
        );
        assert!(out.data.path("author").unwrap().is_missing());
    }

    #[test]
    fn test_missing_root() {
        let store = InMemoryEntityStore::new();
        let shape = SelectionSet::parse("title").unwrap();
        let out = Materializer::new(&store)
            .materialize(&shape, &EntityKey::new("Story", "nope"))
            .unwrap();
        assert!(out.data.is_missing());
        assert!(!out.is_complete());
    }

    #[test]
    fn test_evicted_edges_are_filtered() {
        let (store, batch) = seed();
        store.evict(&EntityKey::new("Suggestion", "42")).unwrap();

        let shape = SelectionSet::parse("suggestions { status }").unwrap();
        let out = Materializer::new(&store).materialize(&shape, &batch).unwrap();
        let conn = out.data.path("suggestions").unwrap().as_connection().unwrap();
        assert_eq!(conn.nodes.len(), 1);
        assert_eq!(
            conn.nodes[0].as_object().unwrap().key,
            Some(EntityKey::new("Suggestion", "43"))
        );
        // The evicted key is still a dependency so its return is noticed.
        assert!(out.dependencies.contains(&EntityKey::new("Suggestion", "42")));
    }

    #[test]
    fn test_rematerialize_is_pure_and_stable() {
        let (store, batch) = seed();
        let shape = SelectionSet::parse("title suggestions { status }").unwrap();
        let m = Materializer::new(&store);

        let first = m.materialize(&shape, &batch).unwrap();
        let second = m.materialize_with_previous(&shape, &batch, Some(&first)).unwrap();
        assert_eq!(first, second);
        assert!(first.data.ptr_eq(&second.data));
    }

    #[test]
    fn test_unchanged_siblings_keep_their_allocation() {
        let (store, batch) = seed();
        let shape = SelectionSet::parse("title suggestions { status }").unwrap();
        let m = Materializer::new(&store);
        let first = m.materialize(&shape, &batch).unwrap();

        store
            .write_field(&EntityKey::new("Suggestion", "42"), "status", Value::from("applied"))
            .unwrap();
        let second = m.materialize_with_previous(&shape, &batch, Some(&first)).unwrap();

        assert!(!first.data.ptr_eq(&second.data));
        let before = first.data.path("suggestions").unwrap().as_connection().unwrap();
        let after = second.data.path("suggestions").unwrap().as_connection().unwrap();
        assert!(!before.nodes[0].ptr_eq(&after.nodes[0]));
        assert!(before.nodes[1].ptr_eq(&after.nodes[1]));
    }
}
