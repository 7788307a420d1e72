//! containerwatch: keeps running containers synchronized with the latest
//! registry images.

pub mod api;
pub mod config;
pub mod depgraph;
pub mod filter;
pub mod hooks;
pub mod metrics;
pub mod notify;
pub mod registry;
pub mod runtime;
pub mod scheduler;
pub mod session;

pub use config::Config;
pub use metrics::{Metrics, Report};
