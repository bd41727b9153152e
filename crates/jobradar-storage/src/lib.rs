//! Outbound HTTP fetching and durable storage for postings, source state and run audits.

pub mod fetcher;
pub mod memory;
pub mod postgres;
pub mod store;

pub use fetcher::{
    BackoffPolicy, FetchError, FetchRequest, FetchStats, FetchStatsSnapshot, FetchedResponse,
    HttpClientConfig, HttpFetcher, PacingWindow, StatusCode,
};
pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use store::{
    CrawlRunRepository, PostingBatch, PostingStore, SourceStateRepository, StoreError, Stores,
};

pub const CRATE_NAME: &str = "jobradar-storage";
