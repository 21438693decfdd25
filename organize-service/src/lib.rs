//! # Organize Service
//!
//! Configuration and composition root of the organize service.
//!
//! - [`OrganizeConfig`]: environment-driven settings with defaults
//! - [`Dependencies`]: the stores, directory, bus and broker to build from
//! - [`Organize`]: the wired hierarchy and membership services, audit
//!   publisher and queue consumers, with an orderly shutdown
//!
//! ## Usage
//!
//! ```rust,no_run
//! use organize_service::{Dependencies, Organize, OrganizeConfig};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = OrganizeConfig::from_env()?;
//! let deps = Dependencies::from_config(&config).await?;
//!
//! let mut app = Organize::build(&config, deps)?;
//! app.spawn_consumers();
//!
//! // serve requests through app.hierarchy() and app.members()
//!
//! app.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod app;
pub mod config;

pub use app::{Dependencies, Organize, ServiceError};
pub use config::{Backend, ConfigError, OrganizeConfig};
