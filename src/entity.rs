//! Entity identity for the normalized store.
//!
//! Every addressable domain object (story, comment, suggestion, batch,
//! attachment, tag, story link) is stored once under a stable composite key
//! `(typename, id)`. Two references to the same key always resolve to the same
//! stored value.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::value::Value;

/// Prefix used when rendering placeholder ids.
pub const PLACEHOLDER_PREFIX: &str = "temp:";

/// Field map of a stored entity.
///
/// A `BTreeMap` keeps field order canonical so snapshots compare exactly.
pub type Fields = BTreeMap<String, Value>;

/// GraphQL `__typename` of an entity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Typename(String);

impl Typename {
    /// Creates a typename.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the typename as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Typename {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Typename {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Primary key half of an [`EntityKey`].
///
/// Server ids come from the API. Placeholder ids are minted on the client for
/// entities that exist only optimistically (a comment before the server has
/// assigned its id) and can never collide with a server id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum EntityId {
    /// Id assigned by the API.
    Server(String),
    /// Client-minted id of an optimistic entity.
    Placeholder(Uuid),
}

impl EntityId {
    /// Creates a server id.
    #[must_use]
    pub fn server(id: impl Into<String>) -> Self {
        Self::Server(id.into())
    }

    /// Creates a fresh placeholder id.
    #[must_use]
    pub fn placeholder() -> Self {
        Self::Placeholder(Uuid::new_v4())
    }

    /// Returns true for client-minted placeholder ids.
    #[must_use]
    pub const fn is_placeholder(&self) -> bool {
        matches!(self, Self::Placeholder(_))
    }

    /// Parses the rendered form produced by `Display`.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        if let Some(rest) = s.strip_prefix(PLACEHOLDER_PREFIX) {
            if let Ok(uuid) = Uuid::parse_str(rest) {
                return Self::Placeholder(uuid);
            }
        }
        Self::Server(s.to_string())
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Server(id) => f.write_str(id),
            Self::Placeholder(uuid) => write!(f, "{PLACEHOLDER_PREFIX}{uuid}"),
        }
    }
}

impl From<&str> for EntityId {
    fn from(s: &str) -> Self {
        Self::server(s)
    }
}

impl From<String> for EntityId {
    fn from(s: String) -> Self {
        Self::Server(s)
    }
}

impl From<i64> for EntityId {
    fn from(id: i64) -> Self {
        Self::Server(id.to_string())
    }
}

/// Stable composite identity of a stored entity.
///
/// # Examples
///
/// ```
/// use smartcache::EntityKey;
///
/// let key = EntityKey::new("Suggestion", "42");
/// assert_eq!(key.to_string(), "Suggestion:42");
/// assert!(!key.is_placeholder());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    /// Entity type.
    pub typename: Typename,
    /// Primary key.
    pub id: EntityId,
}

impl EntityKey {
    /// Typename of the root query entity.
    pub const ROOT_QUERY_TYPENAME: &'static str = "Query";

    /// Creates a key for a server-identified entity.
    #[must_use]
    pub fn new(typename: impl Into<String>, id: impl Into<EntityId>) -> Self {
        Self {
            typename: Typename::new(typename),
            id: id.into(),
        }
    }

    /// Creates a fresh placeholder key of the given type.
    #[must_use]
    pub fn placeholder(typename: impl Into<String>) -> Self {
        Self {
            typename: Typename::new(typename),
            id: EntityId::placeholder(),
        }
    }

    /// Key of the root query entity, whose fields hold top-level query results.
    #[must_use]
    pub fn root_query() -> Self {
        Self::new(Self::ROOT_QUERY_TYPENAME, "ROOT")
    }

    /// Returns true for the root query entity.
    #[must_use]
    pub fn is_root_query(&self) -> bool {
        self.typename.as_str() == Self::ROOT_QUERY_TYPENAME
            && self.id == EntityId::server("ROOT")
    }

    /// Returns true if this key names a placeholder entity.
    #[must_use]
    pub const fn is_placeholder(&self) -> bool {
        self.id.is_placeholder()
    }

    /// Parses `Typename:id` as rendered by `Display`.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        let (typename, id) = s.split_once(':')?;
        if typename.is_empty() || id.is_empty() {
            return None;
        }
        Some(Self {
            typename: Typename::new(typename),
            id: EntityId::parse(id),
        })
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.typename, self.id)
    }
}
