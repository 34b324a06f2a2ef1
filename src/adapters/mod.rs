//! Infrastructure adapters implementing the domain ports.

pub mod memory_store;
pub mod openlibrary;

pub use memory_store::InMemoryStore;
pub use openlibrary::OpenLibraryClient;
