//! Concurrency-safe persistence for opportunity records: a repository
//! contract, three interchangeable backends, and a selecting facade.

mod filesystem;
mod lock;
mod memory;
mod postgres;
mod query;
mod repository;
mod store;

pub use filesystem::{FileSystemRepository, StoreIndex};
pub use lock::{FileLock, LockConfig, DEFAULT_LOCK_STALE_AFTER, DEFAULT_LOCK_TIMEOUT};
pub use memory::MemoryRepository;
pub use postgres::PostgresRepository;
pub use repository::{
    OpportunityFilter, OpportunityRepository, Page, Pagination, StorageError, StorageResult,
    UpsertError, UpsertErrorCode, UpsertResult, DEFAULT_PAGE_LIMIT, MAX_PAGE_LIMIT,
};
pub use store::{BackendConfig, OpportunityStore};

pub const CRATE_NAME: &str = "dealfold-storage";
