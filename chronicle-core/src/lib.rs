//! # chronicle-core
//!
//! Core library for chronicle - a live monitor for concurrent coding-agent
//! sessions.
//!
//! This library provides:
//! - Domain types for sessions, events and session summaries
//! - A backend abstraction with a local-server and a hosted implementation
//! - A reconnecting subscription client with backoff, heartbeats, health
//!   monitoring and a debounced visible status
//! - An event cache with deduplication and bounded memory
//! - The dashboard store a front end renders from
//! - Configuration management and logging infrastructure
//!
//! ## Architecture
//!
//! Data flows through three layers:
//! - **Transport:** [`connection`] keeps one live link per backend alive and
//!   speaks a [`protocol`] over it
//! - **Backend:** [`backend`] pairs REST queries with that live link
//! - **Store:** [`store`] merges fetched pages and live pushes into views
//!
//! ## Example
//!
//! ```rust,no_run
//! use chronicle_core::{create_backend, Config, Dashboard};
//!
//! # async fn run() -> chronicle_core::Result<()> {
//! let config = Config::load()?;
//! let backend = create_backend(&config)?;
//!
//! let dashboard = Dashboard::new(backend, &config.cache);
//! dashboard.start().await?;
//! for view in dashboard.awaiting_input() {
//!     println!("{} is waiting for you", view.session.id);
//! }
//! # Ok(())
//! # }
//! ```

// Re-export commonly used items at the crate root
pub use backend::{create_backend, Backend};
pub use config::Config;
pub use connection::{ConnectionManager, ConnectionQuality, ConnectionState, ConnectionStatus};
pub use error::{Error, Result};
pub use observer::ListenerHandle;
pub use store::{Dashboard, DashboardChange, ProjectGroup, SessionView};
pub use types::*;

// Public modules
pub mod backend;
pub mod backoff;
pub mod cache;
pub mod config;
pub mod connection;
pub mod error;
pub mod logging;
pub mod observer;
pub mod protocol;
pub mod store;
pub mod summary;
pub mod types;
