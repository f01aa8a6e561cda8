//! Free-range catalogs
//!
//! - `CatalogBlockIndices`: in-memory sorted set of closed block ranges
//! - `CatalogBlockOperations`: the same set persisted across CATALOG blocks
//! - `CachedCatalogBlockOperations`: write-behind cache over a persistent catalog

mod cached;
mod indices;
mod operations;

pub use cached::CachedCatalogBlockOperations;
pub use indices::CatalogBlockIndices;
pub use operations::{CatalogBlockOperations, CatalogHost};
