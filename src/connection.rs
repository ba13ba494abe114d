//! Cursor-paginated lists of entity references.
//!
//! Key invariant: a connection never holds the same entity key twice.
//! Appending a page, inserting an edge, and rewriting a placeholder edge all
//! deduplicate by key.

use serde::{Deserialize, Serialize};

use crate::entity::EntityKey;

/// Pagination metadata of a connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageInfo {
    /// Cursor of the last fetched edge.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_cursor: Option<String>,
    /// Whether the server has more edges after `end_cursor`.
    #[serde(default)]
    pub has_next_page: bool,
}

/// Ordered list of entity references plus pagination metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    edges: Vec<EntityKey>,
    page_info: PageInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    total_count: Option<i64>,
}

impl Connection {
    /// Creates a connection, dropping duplicate edges (first occurrence wins).
    #[must_use]
    pub fn new(edges: Vec<EntityKey>, page_info: PageInfo, total_count: Option<i64>) -> Self {
        let mut conn = Self {
            edges: Vec::with_capacity(edges.len()),
            page_info,
            total_count,
        };
        for key in edges {
            if !conn.contains(&key) {
                conn.edges.push(key);
            }
        }
        conn
    }

    /// Creates a single-page connection with no further pages.
    #[must_use]
    pub fn from_edges(edges: Vec<EntityKey>) -> Self {
        Self::new(edges, PageInfo::default(), None)
    }

    /// Edge keys in display order.
    #[must_use]
    pub fn edges(&self) -> &[EntityKey] {
        &self.edges
    }

    /// Pagination state of the last loaded page.
    #[must_use]
    pub const fn page_info(&self) -> &PageInfo {
        &self.page_info
    }

    /// Server-side total, when the query asked for it.
    #[must_use]
    pub const fn total_count(&self) -> Option<i64> {
        self.total_count
    }

    /// Number of loaded edges.
    #[must_use]
    pub fn len(&self) -> usize {
        self.edges.len()
    }

    /// Returns true if nothing is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Returns true if `key` is an edge.
    #[must_use]
    pub fn contains(&self, key: &EntityKey) -> bool {
        self.edges.iter().any(|k| k == key)
    }

    /// Index of `key` among the edges.
    #[must_use]
    pub fn position(&self, key: &EntityKey) -> Option<usize> {
        self.edges.iter().position(|k| k == key)
    }

    /// Appends the next page. Edges already present are skipped; page info and
    /// total count are taken from the newer page.
    ///
    /// Returns the number of edges actually appended.
    pub fn append_page(&mut self, page: Connection) -> usize {
        let before = self.edges.len();
        for key in page.edges {
            if !self.contains(&key) {
                self.edges.push(key);
            }
        }
        self.page_info = page.page_info;
        if page.total_count.is_some() {
            self.total_count = page.total_count;
        }
        self.edges.len() - before
    }

    /// Inserts an edge at `index` (clamped to the end). No-op if already present.
    pub fn insert(&mut self, index: usize, key: EntityKey) -> bool {
        if self.contains(&key) {
            return false;
        }
        let index = index.min(self.edges.len());
        self.edges.insert(index, key);
        if let Some(total) = self.total_count.as_mut() {
            *total += 1;
        }
        true
    }

    /// Removes an edge, returning the position it occupied.
    pub fn remove(&mut self, key: &EntityKey) -> Option<usize> {
        let index = self.position(key)?;
        self.edges.remove(index);
        if let Some(total) = self.total_count.as_mut() {
            *total = (*total - 1).max(0);
        }
        Some(index)
    }

    /// Rewrites the edge `from` into `to`, keeping its position.
    ///
    /// When `to` is already an edge the `from` edge is dropped so no duplicate
    /// appears. Total count is left alone: the edge represents the same entity.
    pub fn replace(&mut self, from: &EntityKey, to: &EntityKey) -> bool {
        let Some(index) = self.position(from) else {
            return false;
        };
        if self.contains(to) {
            self.edges.remove(index);
        } else {
            self.edges[index] = to.clone();
        }
        true
    }

    /// Keeps only edges for which `keep` returns true.
    pub fn retain(&mut self, mut keep: impl FnMut(&EntityKey) -> bool) {
        self.edges.retain(|k| keep(k));
    }
}
