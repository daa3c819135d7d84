//! Kiln Remote
//!
//! Remote execution plumbing for Kiln:
//! - A pool of persistent SSH connections keyed by `user@host`, with
//!   liveness probing and background reclamation of idle connections
//! - The `Shell` seam used to run commands locally or on a login host
//! - A file browser rooted at a profile's home directory
//!
//! # Example
//!
//! ```no_run
//! use kiln_remote::{ConnectionManager, OpenSshConnector, PoolConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), kiln_remote::ConnectionError> {
//!     let config = PoolConfig::default();
//!     let connector = Arc::new(OpenSshConnector::new(&config));
//!     let pool = ConnectionManager::new(config, connector);
//!     pool.spawn_reclaimer();
//!
//!     let conn = pool.connection("della.princeton.edu", "alice").await?;
//!     let output = conn.exec("squeue --me").await?;
//!     println!("{}", output.stdout);
//!
//!     pool.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod connection;
pub mod error;
pub mod files;
pub mod manager;
pub mod openssh;
pub mod shell;

// Re-export commonly used types
pub use connection::{CommandOutput, Connection, ConnectionInfo, Connector};
pub use error::{ConnectionError, FileError, ShellError};
pub use files::{FileBrowser, FileEntry, format_permissions, resolve_path};
pub use manager::{ConnectionManager, ConnectionStatus, PoolConfig, PooledConnection};
pub use openssh::OpenSshConnector;
pub use shell::{LocalShell, RemoteShell, Shell, quote};
