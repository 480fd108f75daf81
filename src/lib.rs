#![allow(unused_assignments)]

//! # throwaway-db
//!
//! Disposable database instances for automated tests and local development.
//!
//! ## Features
//!
//! - **Private instances**: each database gets its own owner-only working
//!   directory and a pair of free loopback ports
//! - **Readiness detection**: `start()` resolves once the server is accepting
//!   client connections, not merely once it was spawned
//! - **Crash-safe cleanup**: the server process and its files are removed on
//!   `stop()`, on drop, on SIGINT/SIGTERM/SIGQUIT, on panic and on normal exit
//! - **Cancellation**: `stop()` may be called at any point, including while
//!   `start()` is still in progress
//!
//! ## Quick Start
//!
//! ```no_run
//! use throwaway_db::{Options, ThrowawayDb};
//!
//! # async fn example() -> Result<(), throwaway_db::Error> {
//! let db = ThrowawayDb::new(Options::default())?;
//! let info = db.start().ready().await?;
//! println!("connect to {}:{}", info.host, info.driver_port);
//!
//! db.create_db("test").await?;
//!
//! db.stop().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Concurrency Model
//!
//! - Every method takes `&self`; a `ThrowawayDb` can be shared across tasks
//! - Cleanup runs exactly once even with concurrent `stop()` calls
//! - Several instances may run in one process; they never share ports or
//!   directories

pub mod config;
pub mod engine;
pub mod error;
pub mod instance;
pub mod port;
pub mod process;
pub mod readiness;
pub mod tempdir;
mod throwaway;

// Re-export commonly used types
pub use config::Options;
pub use engine::{ClientDriver, Connection, EngineKind, TcpDriver};
pub use error::{Error, Result};
pub use instance::{InstanceId, InstanceState, SeedOperation, Seeder, ServingInfo};
pub use throwaway::{StartHandle, ThrowawayDb, ThrowawayDbBuilder};
