//! ValueBot Backend Library
//!
//! Multi-source property valuation: one address in, a live per-source event
//! stream and a consolidated estimate out. The server binary and the sweep
//! client are thin shells over these modules.

pub mod api;
pub mod client;
pub mod config;
pub mod consolidate;
pub mod error;
pub mod fetchers;
pub mod history;
pub mod middleware;
pub mod models;
pub mod orchestrator;
pub mod service;
pub mod sources;

pub use config::Config;
pub use error::SweepError;
pub use service::ValuationService;
