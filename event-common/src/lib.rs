pub mod best_effort;
pub mod cache;
pub mod config;
pub mod event;
pub mod metadata;
pub mod metrics;
pub mod pgqueue;
pub mod retry;
pub mod store;
pub mod time;
pub mod upsert;
