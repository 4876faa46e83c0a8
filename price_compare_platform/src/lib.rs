//! Price Compare Platform - Core Library
//!
//! Fans a product search out to several store sources concurrently,
//! delivers partial results while sources are still running and merges
//! everything into one deduplicated, filterable result set.

pub mod cache;
pub mod cli;
pub mod context;
pub mod error;
pub mod fetcher;
pub mod finalizer;
pub mod item;
pub mod middleware;
pub mod orchestrator;
pub mod pool;
pub mod ranker;
pub mod refresher;
pub mod registry;
pub mod runner;
pub mod server;
pub mod settings;
pub mod store;
pub mod telemetry;

pub use error::OrchestratorError;
pub use item::{Filters, Item};
pub use orchestrator::{Orchestrator, SubmitOutcome};
pub use registry::{StatusReport, TaskId};
