//! WPAD/NBNS Security Audit Tool
//!
//! Spoofs NBNS name resolution to make LAN clients believe this host is
//! the WPAD host, serves a crafted proxy autoconfiguration script pointing
//! at an interception proxy, and terminates TLS with freshly generated
//! untrusted certificates to observe which local processes validate server
//! certificates. Nothing is ever forwarded upstream.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use wpad_audit::{AuditProxy, Supervisor, Worker};
//!
//! #[tokio::main]
//! async fn main() -> wpad_audit::Result<()> {
//!   let proxy = AuditProxy::new("192.168.1.10:8080".parse().unwrap(), true, Vec::new());
//!   let workers: Vec<Arc<dyn Worker>> = vec![Arc::new(proxy)];
//!   Supervisor::new(workers).run().await
//! }
//! ```

pub mod attribution;
pub mod capture;
pub mod cert;
pub mod config;
pub mod error;
pub mod nameservice;
pub mod nbns;
pub mod pac;
pub mod proxy;
pub mod worker;

pub use attribution::ProcessOwner;
pub use capture::PoisonEngine;
pub use cert::EphemeralCertificate;
pub use config::Config;
pub use error::{Error, Result};
pub use pac::PacHost;
pub use proxy::{AuditProxy, ConnectionRecord, TunnelOutcome};
pub use worker::{Shutdown, Supervisor, Worker};
