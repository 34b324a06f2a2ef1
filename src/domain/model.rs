//! Domain value objects for catalog lookups.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// =============================================================================
// Entity Type
// =============================================================================

/// The kinds of catalog entities the pipeline can look up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Book,
    Author,
    Publisher,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Book => "book",
            EntityType::Author => "author",
            EntityType::Publisher => "publisher",
        }
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Priority
// =============================================================================

/// Dispatch priority for a lookup. `High` is for interactive, user-facing
/// requests; `Low` for bulk/background work. Ordered so that
/// `High > Low` and `max()` picks the more urgent of the two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    High,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::High => write!(f, "high"),
            Priority::Low => write!(f, "low"),
        }
    }
}

// =============================================================================
// Lookup Key
// =============================================================================

/// Composite key identifying one logical catalog entity.
///
/// The identifier is case-normalized at construction so that different
/// spellings of the same real-world entity map to the same key: ISBNs keep
/// digits (and a trailing `X` check digit) only, names are trimmed,
/// lower-cased, and have inner whitespace collapsed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LookupKey {
    entity: EntityType,
    identifier: String,
}

impl LookupKey {
    /// Build a key from a raw identifier, normalizing it first.
    pub fn new(entity: EntityType, raw: &str) -> Result<Self> {
        let identifier = match entity {
            EntityType::Book => normalize_isbn(raw),
            EntityType::Author | EntityType::Publisher => normalize_name(raw),
        };

        if identifier.is_empty() {
            return Err(Error::InvalidIdentifier(format!(
                "{} identifier '{}' is empty after normalization",
                entity, raw
            )));
        }

        Ok(Self { entity, identifier })
    }

    pub fn entity(&self) -> EntityType {
        self.entity
    }

    /// The normalized identifier.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }
}

impl std::fmt::Display for LookupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.entity, self.identifier)
    }
}

/// Strip an ISBN down to digits, keeping a trailing `X` check digit
/// (ISBN-10), upper-cased.
fn normalize_isbn(raw: &str) -> String {
    let mut out: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();

    // An ISBN-10 may end in 'x' standing for check value 10. Keep it only
    // when it actually terminates the raw input and nine digits precede it.
    if out.len() == 9 {
        if let Some(last) = raw.trim().chars().last() {
            if last.eq_ignore_ascii_case(&'x') {
                out.push('X');
            }
        }
    }

    out
}

/// Trim, lower-case, and collapse inner whitespace runs to single spaces.
fn normalize_name(raw: &str) -> String {
    raw.split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

// =============================================================================
// Catalog Record
// =============================================================================

/// A catalog row for a book, author, or publisher.
///
/// This is the shape exchanged with the local store and the upstream
/// client; the surrounding CRUD layer owns the full relational schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogRecord {
    /// Which entity kind this record describes
    pub entity: EntityType,

    /// Normalized natural key (ISBN digits, normalized name)
    pub key: String,

    /// Human-readable title or name
    pub display_name: String,

    /// Remaining upstream fields, passed through opaquely
    #[serde(default)]
    pub extra: serde_json::Value,

    /// When this record was fetched from upstream
    pub fetched_at: DateTime<Utc>,
}

impl CatalogRecord {
    /// Create a record for the given key.
    pub fn new(key: &LookupKey, display_name: impl Into<String>) -> Self {
        Self {
            entity: key.entity(),
            key: key.identifier().to_string(),
            display_name: display_name.into(),
            extra: serde_json::Value::Null,
            fetched_at: Utc::now(),
        }
    }

    /// Attach opaque upstream fields.
    pub fn with_extra(mut self, extra: serde_json::Value) -> Self {
        self.extra = extra;
        self
    }
}

// =============================================================================
// Lookup Result
// =============================================================================

/// Where a lookup result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    /// Served from the local store without touching the dispatcher
    Cache,
    /// Fetched from the upstream catalog on this call
    Upstream,
}

/// A resolved lookup: the record plus its provenance.
#[derive(Debug, Clone)]
pub struct LookupResult {
    pub record: CatalogRecord,
    pub source: Source,
}

// =============================================================================
// Tests
// =============================================================================
