//! Query shapes: the tree of fields a view asks for.

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// One requested field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSelection {
    /// Stored field name (may carry an argument suffix, see `normalize::field_key`).
    pub name: String,
    /// Output name; defaults to `name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    /// Sub-selection applied to referenced entities, list items, or connection nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<SelectionSet>,
}

impl FieldSelection {
    /// Output name of this field.
    #[must_use]
    pub fn output_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

/// Ordered set of field selections.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SelectionSet {
    fields: Vec<FieldSelection>,
}

impl SelectionSet {
    /// An empty selection.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a leaf field.
    #[must_use]
    pub fn scalar(mut self, name: impl Into<String>) -> Self {
        self.fields.push(FieldSelection {
            name: name.into(),
            alias: None,
            selection: None,
        });
        self
    }

    /// Adds a field with a sub-selection.
    #[must_use]
    pub fn nested(mut self, name: impl Into<String>, selection: SelectionSet) -> Self {
        self.fields.push(FieldSelection {
            name: name.into(),
            alias: None,
            selection: Some(selection),
        });
        self
    }

    /// Adds a field under an output alias.
    #[must_use]
    pub fn aliased(
        mut self,
        alias: impl Into<String>,
        name: impl Into<String>,
        selection: Option<SelectionSet>,
    ) -> Self {
        self.fields.push(FieldSelection {
            name: name.into(),
            alias: Some(alias.into()),
            selection,
        });
        self
    }

    /// Selected fields in request order.
    #[must_use]
    pub fn fields(&self) -> &[FieldSelection] {
        &self.fields
    }

    /// Returns true if nothing is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Parses a compact selection syntax: `title batch { id suggestions { id status } }`.
    ///
    /// `alias: name` renames a field. Arguments are not parsed; address argument
    /// fields by their stored name through the builder API instead.
    pub fn parse(src: &str) -> Result<Self, ValidationError> {
        let tokens = tokenize(src)?;
        let mut pos = 0;
        let set = parse_set(&tokens, &mut pos, 0)?;
        if pos != tokens.len() {
            return Err(invalid(format!("unexpected token '{}'", tokens[pos])));
        }
        Ok(set)
    }
}

fn invalid(reason: String) -> ValidationError {
    ValidationError::InvalidShape { reason }
}

fn tokenize(src: &str) -> Result<Vec<String>, ValidationError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    for ch in src.chars() {
        match ch {
            '{' | '}' | ':' => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
                tokens.push(ch.to_string());
            }
            c if c.is_whitespace() || c == ',' => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c if c.is_alphanumeric() || c == '_' => current.push(c),
            c => return Err(invalid(format!("unexpected character '{c}'"))),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    Ok(tokens)
}

fn parse_set(tokens: &[String], pos: &mut usize, depth: usize) -> Result<SelectionSet, ValidationError> {
    const MAX_DEPTH: usize = 32;
    if depth > MAX_DEPTH {
        return Err(invalid("selection nested too deeply".to_string()));
    }

    let mut set = SelectionSet::new();
    while *pos < tokens.len() {
        let tok = tokens[*pos].as_str();
        if tok == "}" {
            break;
        }
        if tok == "{" || tok == ":" {
            return Err(invalid(format!("expected field name, found '{tok}'")));
        }
        *pos += 1;

        let (alias, name) = if tokens.get(*pos).map(String::as_str) == Some(":") {
            *pos += 1;
            let name = tokens
                .get(*pos)
                .filter(|t| !matches!(t.as_str(), "{" | "}" | ":"))
                .ok_or_else(|| invalid(format!("alias '{tok}' has no field")))?;
            *pos += 1;
            (Some(tok.to_string()), name.clone())
        } else {
            (None, tok.to_string())
        };

        let selection = if tokens.get(*pos).map(String::as_str) == Some("{") {
            *pos += 1;
            let inner = parse_set(tokens, pos, depth + 1)?;
            if tokens.get(*pos).map(String::as_str) != Some("}") {
                return Err(invalid(format!("unclosed selection on '{name}'")));
            }
            *pos += 1;
            if inner.is_empty() {
                return Err(invalid(format!("empty selection on '{name}'")));
            }
            Some(inner)
        } else {
            None
        };

        set.fields.push(FieldSelection {
            name,
            alias,
            selection,
        });
    }
    Ok(set)
}
