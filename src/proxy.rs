//! TLS-interception proxy
//!
//! The proxy victims are redirected to by the PAC script. It terminates
//! CONNECT tunnels with a freshly generated untrusted certificate and
//! records whether each client completed the handshake — it never forwards
//! anything upstream. Every request, tunneled or not, is answered with a
//! fixed 503: this proxy never proxies, it only observes.

use crate::attribution::{self, ProcessOwner};
use crate::cert::EphemeralCertificate;
use crate::error::{Error, Result};
use crate::worker::{Shutdown, Worker};
use async_trait::async_trait;
use bytes::BytesMut;
use regex::Regex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::OnceLock;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;

/// Reply for an accepted CONNECT, sent before the TLS handshake.
pub const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";

/// Reply for everything else. The proxy terminates every exchange with it.
pub const WILL_NOT_PROXY: &[u8] = b"HTTP/1.1 503 wpad-audit will not proxy requests\r\n\r\n";

/// Reply for connections from deny-listed processes.
pub const NOT_FOUND: &[u8] = b"HTTP/1.1 404 Not Found\r\n\r\n";

/// Upper bound on a buffered preamble.
const MAX_PREAMBLE_SIZE: usize = 1024 * 1024;

fn connect_regex() -> &'static Regex {
  static CONNECT: OnceLock<Regex> = OnceLock::new();
  CONNECT.get_or_init(|| Regex::new(r"CONNECT\s+([^\s:]+):(\d+)").expect("valid regex"))
}

/// Extract the target host from a CONNECT preamble: the text between
/// `"CONNECT "` and the following `":"`. `None` means plain HTTP.
pub fn connect_host(preamble: &str) -> Option<String> {
  connect_regex()
    .captures(preamble)
    .map(|captures| captures[1].to_string())
}

/// Seam over [`attribution::resolve`] so tests can script lookups.
pub trait PortResolver: Send + Sync {
  fn resolve(&self, local_port: u16) -> Option<ProcessOwner>;
}

/// The live operating-system lookup.
pub struct SystemResolver;

impl PortResolver for SystemResolver {
  fn resolve(&self, local_port: u16) -> Option<ProcessOwner> {
    attribution::resolve(local_port)
  }
}

/// How a tunneled connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelOutcome {
  /// The owning process is deny-listed; answered 404, nothing intercepted.
  Denied,
  /// Plain HTTP, no CONNECT; answered 503.
  NotConnect,
  /// The peer refused the untrusted certificate — the desired signal.
  CertificateRejected { host: String },
  /// The peer completed the handshake and sent cleartext through the
  /// tunnel; it was answered 503 and nothing was forwarded.
  CertificateAccepted { host: String, preamble: String },
}

/// Everything observed about one accepted socket. Created on accept,
/// consumed by the connection task, never persisted.
#[derive(Debug)]
pub struct ConnectionRecord {
  pub peer: SocketAddr,
  pub process: Option<ProcessOwner>,
  pub preamble: String,
  pub outcome: TunnelOutcome,
}

/// Shared, immutable state for connection handlers.
pub struct ProxyContext {
  deny_processes: Vec<String>,
  resolver: Arc<dyn PortResolver>,
}

impl ProxyContext {
  fn is_denied(&self, owner: Option<&ProcessOwner>) -> bool {
    owner.is_some_and(|owner| {
      self
        .deny_processes
        .iter()
        .any(|denied| denied.eq_ignore_ascii_case(&owner.name))
    })
  }
}

/// The interception proxy worker.
pub struct AuditProxy {
  endpoint: SocketAddr,
  enabled: bool,
  context: Arc<ProxyContext>,
}

impl AuditProxy {
  pub fn new(endpoint: SocketAddr, enabled: bool, deny_processes: Vec<String>) -> Self {
    Self::with_resolver(endpoint, enabled, deny_processes, Arc::new(SystemResolver))
  }

  pub fn with_resolver(
    endpoint: SocketAddr,
    enabled: bool,
    deny_processes: Vec<String>,
    resolver: Arc<dyn PortResolver>,
  ) -> Self {
    Self {
      endpoint,
      enabled,
      context: Arc::new(ProxyContext {
        deny_processes,
        resolver,
      }),
    }
  }
}

#[async_trait]
impl Worker for AuditProxy {
  fn name(&self) -> &'static str {
    "proxy"
  }

  fn enabled(&self) -> bool {
    self.enabled
  }

  async fn run(&self, shutdown: Shutdown) -> Result<()> {
    let listener = TcpListener::bind(self.endpoint)
      .await
      .map_err(|e| Error::proxy(format!("Failed to bind to {}: {}", self.endpoint, e)))?;
    tracing::info!("Starting the proxy on {}", self.endpoint);

    loop {
      if shutdown.is_cancelled() {
        return Ok(());
      }
      tokio::select! {
        _ = shutdown.cancelled() => return Ok(()),
        accepted = listener.accept() => {
          match accepted {
            Ok((stream, peer)) => {
              let context = self.context.clone();
              tokio::spawn(async move {
                match handle_connection(stream, peer, context).await {
                  Ok(record) => log_record(&record),
                  Err(e) => tracing::error!("Error handling connection from {}: {}", peer, e),
                }
              });
            }
            Err(e) => {
              tracing::error!("Failed to accept connection: {}", e);
            }
          }
        }
      }
    }
  }

  async fn cleanup(&self) -> Result<()> {
    // The listener is owned by run() and closes when the loop returns.
    tracing::info!("Stopping the proxy");
    Ok(())
  }
}

/// Drive one accepted socket through the audit state machine.
///
/// Generic over the stream so tests can run it over in-memory pipes.
pub async fn handle_connection<S>(
  mut stream: S,
  peer: SocketAddr,
  context: Arc<ProxyContext>,
) -> Result<ConnectionRecord>
where
  S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
  let preamble = read_preamble(&mut stream).await?;

  // Attribution may miss; that is a normal outcome, never an error.
  let process = {
    let resolver = context.resolver.clone();
    let port = peer.port();
    tokio::task::spawn_blocking(move || resolver.resolve(port))
      .await
      .unwrap_or(None)
  };

  if context.is_denied(process.as_ref()) {
    stream.write_all(NOT_FOUND).await?;
    stream.flush().await?;
    return Ok(ConnectionRecord {
      peer,
      process,
      preamble,
      outcome: TunnelOutcome::Denied,
    });
  }

  let Some(host) = connect_host(&preamble) else {
    // Not a CONNECT, so this must be plain HTTP. Terminate it.
    stream.write_all(WILL_NOT_PROXY).await?;
    stream.flush().await?;
    return Ok(ConnectionRecord {
      peer,
      process,
      preamble,
      outcome: TunnelOutcome::NotConnect,
    });
  };

  stream.write_all(CONNECT_ESTABLISHED).await?;
  stream.flush().await?;

  // A fresh untrusted certificate per connection: nothing a client could
  // have pinned or cached from an earlier tunnel.
  let acceptor = EphemeralCertificate::generate()?.into_acceptor()?;

  let mut tls_stream = match acceptor.accept(stream).await {
    Ok(tls_stream) => tls_stream,
    Err(e) => {
      tracing::debug!("TLS handshake with {} failed: {}", peer, e);
      return Ok(ConnectionRecord {
        peer,
        process,
        preamble,
        outcome: TunnelOutcome::CertificateRejected { host },
      });
    }
  };

  // The handshake completed; whatever arrives now is the tunneled
  // cleartext. An immediate close still counts as a rejection.
  let tunneled = read_preamble(&mut tls_stream).await.unwrap_or_default();
  if tunneled.is_empty() {
    return Ok(ConnectionRecord {
      peer,
      process,
      preamble,
      outcome: TunnelOutcome::CertificateRejected { host },
    });
  }

  tls_stream.write_all(WILL_NOT_PROXY).await?;
  tls_stream.flush().await?;
  let _ = tls_stream.shutdown().await;

  Ok(ConnectionRecord {
    peer,
    process,
    preamble,
    outcome: TunnelOutcome::CertificateAccepted {
      host,
      preamble: tunneled,
    },
  })
}

/// Read until the stream closes or an HTTP header terminator is seen,
/// buffering everything read. A POST body past the headers is irrelevant
/// here and left on the wire.
pub async fn read_preamble<S>(stream: &mut S) -> Result<String>
where
  S: AsyncRead + Unpin,
{
  let mut buffer = BytesMut::new();
  let mut chunk = [0u8; 1024];

  loop {
    let n = stream.read(&mut chunk).await?;
    if n == 0 {
      break;
    }
    buffer.extend_from_slice(&chunk[..n]);
    if buffer.len() > MAX_PREAMBLE_SIZE {
      return Err(Error::invalid_request(
        "Preamble size exceeds maximum allowed",
      ));
    }
    if buffer.windows(4).any(|window| window == b"\r\n\r\n") {
      break;
    }
  }

  Ok(String::from_utf8_lossy(&buffer).to_string())
}

fn log_record(record: &ConnectionRecord) {
  let (name, pid) = match &record.process {
    Some(owner) => (owner.name.as_str(), owner.pid),
    None => ("<unknown>", 0),
  };
  let port = record.peer.port();

  match &record.outcome {
    TunnelOutcome::Denied => {
      tracing::info!("{}:{}(port:{}) is deny-listed, answered 404", name, pid, port);
    }
    TunnelOutcome::NotConnect => {
      tracing::info!(
        "{}:{}(port:{}) sent an http message through the proxy\r\n{}",
        name,
        pid,
        port,
        sanitize_message(&record.preamble)
      );
    }
    TunnelOutcome::CertificateRejected { host } => {
      tracing::info!(
        "{}:{}(port:{}) did not accept the server certificate from the proxy for {}",
        name,
        pid,
        port,
        host
      );
    }
    TunnelOutcome::CertificateAccepted { host, preamble } => {
      tracing::warn!(
        "{}:{}(port:{}) accepted the server certificate from the proxy for {}\r\n{}",
        name,
        pid,
        port,
        host,
        sanitize_message(preamble)
      );
    }
  }
}

/// Indent a captured message for display.
fn sanitize_message(message: &str) -> String {
  format!("\t{}", message.replace("\r\n", "\r\n\t"))
}
