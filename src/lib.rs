//! MetaShelf - Catalog Metadata Lookup Pipeline
//!
//! An asynchronous pipeline that resolves book, author, and publisher
//! metadata from a third-party catalog API without hammering it, without
//! duplicating concurrent work, and without blocking interactive callers
//! behind bulk imports.
//!
//! # Architecture
//!
//! ```text
//! lookup(entity, id, priority)
//!        │
//!        ▼
//! ┌──────────────────┐   miss   ┌──────────────────┐
//! │   Cache-Aside    │─────────▶│    In-Flight     │ one entry per key,
//! │  Lookup Service  │          │     Registry     │ broadcast on resolve
//! └──────────────────┘          └──────────────────┘
//!        │ hit                          │ new
//!        ▼                              ▼
//!   local store              ┌──────────────────┐   ┌──────────────┐
//!                            │     Priority     │──▶│ Rate Limiter │
//!                            │    Dispatcher    │   │ (token bucket)│
//!                            │  high ▸▸ low     │   └──────────────┘
//!                            └──────────────────┘          │
//!                                   workers ───────────────┴──▶ upstream API
//! ```
//!
//! # Modules
//!
//! - [`adapters`] - Infrastructure adapters implementing domain ports
//! - [`config`] - Pipeline configuration
//! - [`dispatcher`] - Two-lane priority queue and worker pool
//! - [`domain`] - Domain layer with value objects and ports
//! - [`error`] - Error types
//! - [`limiter`] - Token-bucket rate limiter
//! - [`registry`] - In-flight lookup deduplication
//! - [`service`] - Cache-aside lookup service

pub mod adapters;
pub mod config;
pub mod dispatcher;
pub mod domain;
pub mod error;
pub mod limiter;
pub mod registry;
pub mod service;

// Re-export commonly used types
pub use config::LookupConfig;
pub use dispatcher::{PriorityDispatcher, QueueStats};
pub use domain::{CatalogRecord, EntityType, LookupKey, LookupResult, Priority, Source};
pub use error::{Error, Result};
pub use limiter::RateLimiter;
pub use registry::InFlightRegistry;
pub use service::{CacheAsideLookupService, PipelineStats};
