pub mod api;
pub mod buffer;
pub mod capture;
pub mod config;
pub mod event;
pub mod prometheus;
pub mod router;
pub mod server;
pub mod sinks;
