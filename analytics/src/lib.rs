pub mod api;
pub mod config;
pub mod engine;
pub mod funnel;
pub mod handlers;
pub mod journey;
pub mod retention;
pub mod router;
pub mod server;
pub mod timeseries;
