//! Durable storage for agents, metrics and IP changes
//!
//! ## Design
//!
//! - **Trait-based**: `StorageBackend` lets the server swap drivers
//! - **Async**: Every operation is a future; dropping it cancels the work
//! - **Portable SQL**: Drivers build statements through [`query::QueryBuilder`]
//!
//! ## Backends
//!
//! - **SQLite** (default): Embedded database, versioned migrations through `sqlx::migrate`
//! - **In-Memory**: No persistence, for tests and throwaway deployments
//!
//! ## Usage
//!
//! ```no_run
//! use wameter::config::StorageConfig;
//!
//! #[tokio::main]
//! async fn main() -> wameter::Result<()> {
//!     let storage = wameter::storage::connect(&StorageConfig::default()).await?;
//!     storage.ping().await?;
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod cache;
pub mod memory;
#[cfg(feature = "storage-sqlite")]
pub mod migrate;
pub mod query;
pub mod schema;
#[cfg(feature = "storage-sqlite")]
pub mod sqlite;
pub mod stats;

use std::sync::Arc;

pub use backend::{
    CleanupSummary, IpChangeSummary, MAX_QUERY_LIMIT, OrderBy, Page, QueryParams, SortOrder,
    StorageBackend,
};
pub use memory::MemoryBackend;
pub use stats::StorageStats;

use crate::config::{StorageConfig, StorageDriver};
use crate::error::Result;
#[cfg(not(feature = "storage-sqlite"))]
use crate::error::Error;

/// Open the backend selected by `config.driver`
pub async fn connect(config: &StorageConfig) -> Result<Arc<dyn StorageBackend>> {
    match config.driver {
        #[cfg(feature = "storage-sqlite")]
        StorageDriver::Sqlite => Ok(Arc::new(sqlite::SqliteBackend::connect(config).await?)),
        #[cfg(not(feature = "storage-sqlite"))]
        StorageDriver::Sqlite => Err(Error::invalid_config(
            "storage.connect",
            "sqlite support was not compiled in",
        )),
        StorageDriver::Memory => Ok(Arc::new(match config.max_batch_size {
            Some(size) => MemoryBackend::with_batch_size(size),
            None => MemoryBackend::new(),
        })),
    }
}
