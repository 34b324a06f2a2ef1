//! Domain Ports (Port/Adapter Pattern)
//!
//! The pipeline depends on two external collaborators, expressed as traits:
//! the relational store holding catalog rows, and the third-party catalog
//! API. Infrastructure adapters in [`crate::adapters`] provide concrete
//! implementations; tests substitute scripted ones.

use async_trait::async_trait;

use super::model::{CatalogRecord, EntityType, LookupKey};
use crate::error::Result;

// =============================================================================
// Local Store Port
// =============================================================================

/// Port for the local catalog store.
///
/// The lookup service is the sole writer of upstream-originated records and
/// only ever writes through `upsert_if_absent`, so a locally-authored row is
/// never overwritten by a lower-confidence upstream one.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Find a record by its normalized key.
    async fn find_by_key(&self, key: &LookupKey) -> Result<Option<CatalogRecord>>;

    /// Insert the record if no row exists for its natural key; return the
    /// stored row either way. Must be atomic so two lookups resolving to
    /// the same normalized key cannot create duplicate rows.
    async fn upsert_if_absent(&self, record: CatalogRecord) -> Result<CatalogRecord>;
}

// =============================================================================
// Upstream Client Port
// =============================================================================

/// Port for the third-party catalog API.
///
/// Implementations translate transport failures into the taxonomy consumed
/// by the dispatcher: `NotFound`, `BadRequest`, `RateLimited`, `Timeout`,
/// `Network`, `Server`.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// Fetch one record by its normalized key.
    async fn fetch_by_key(&self, key: &LookupKey) -> Result<CatalogRecord>;

    /// Free-text search over the upstream catalog.
    async fn search(
        &self,
        entity: EntityType,
        query: &str,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<CatalogRecord>>;
}
