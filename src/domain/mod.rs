//! Domain layer: value objects and the ports the pipeline depends on.

pub mod model;
pub mod ports;

pub use model::{CatalogRecord, EntityType, LookupKey, LookupResult, Priority, Source};
pub use ports::{LocalStore, UpstreamClient};
