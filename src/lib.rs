//! # sftpgate
//!
//! A multi-tenant SFTP server with pluggable storage backends.
//!
//! Each authenticated session gets a private, permission-filtered view of
//! the backend named by its access descriptor: local disk, S3 or an
//! in-memory store, optionally wrapped in read-only or sync-and-delete
//! decorators.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use sftpgate::{Config, MemoryUserProvider, Server, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> sftpgate::Result<()> {
//!     let config: Config = serde_json::from_str(Config::default_template())
//!         .expect("default template parses");
//!     let provider = Arc::new(MemoryUserProvider::from_accesses(&config.accesses));
//!
//!     Server::new(ServerConfig::new().port(2022), provider, config.accesses)
//!         .run()
//!         .await
//! }
//! ```
//!
//! ## Custom backend
//!
//! Implement the [`Backend`] trait for custom storage:
//!
//! ```rust,ignore
//! use async_trait::async_trait;
//! use sftpgate::backend::{Backend, BackendResult, ListerAt, ReaderAt, Request, WriterAt};
//!
//! struct MyBackend;
//!
//! #[async_trait]
//! impl Backend for MyBackend {
//!     async fn file_read(&self, req: &Request) -> BackendResult<Box<dyn ReaderAt>> {
//!         todo!()
//!     }
//!     // ... other operations
//! }
//! ```

pub mod auth;
pub mod backend;
pub mod config;
pub mod error;
pub mod handle;
pub mod hostkey;
pub mod jail;
pub mod server;
pub mod session;
pub mod sftp_handler;
pub mod ssh_handler;

// Re-exports for convenience
pub use auth::{MemoryUserProvider, PermissionSet, User, UserProvider};
pub use backend::{Backend, DiskBackend, MemoryBackend, S3Backend, StagedBackend};
pub use config::{Access, Config};
pub use error::{Error, Result};
pub use server::{Server, ServerConfig};
pub use session::{SessionContext, SessionFs};
