//! Proxy autoconfiguration host
//!
//! Serves the `/wpad.dat` script poisoned clients fetch after resolving
//! WPAD. The script routes the configured hosts (or everything) through
//! the interception proxy; requests from deny-listed processes and for
//! any other path get a 404.

use crate::error::{Error, Result};
use crate::proxy::{PortResolver, SystemResolver, NOT_FOUND};
use crate::worker::{Shutdown, Worker};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;

/// Path WPAD clients request, per the WPAD draft.
pub const PAC_PATH: &str = "/wpad.dat";

const PAC_CONTENT_TYPE: &str = "application/x-ns-proxy-autoconfig";

/// Generate the FindProxyForURL script.
///
/// No hosts means everything is proxied unconditionally; otherwise each
/// host gets a `shExpMatch` branch and the rest goes DIRECT.
pub fn generate_script(proxy: SocketAddr, hosts_to_proxy: &[String]) -> String {
  let proxy_clause = format!("PROXY {}:{}", proxy.ip(), proxy.port());

  if hosts_to_proxy.is_empty() {
    return format!(
      "function FindProxyForURL(url, host) {{\n  return \"{}\";\n}}\n",
      proxy_clause
    );
  }

  let mut script = String::from("function FindProxyForURL(url, host) {\n");
  for host in hosts_to_proxy {
    script.push_str(&format!(
      "  if (shExpMatch(host, \"{}\")) return \"{}\";\n",
      host, proxy_clause
    ));
  }
  script.push_str("  return \"DIRECT\";\n}\n");
  script
}

fn pac_response(script: &str) -> String {
  format!(
    "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nCache-Control: no-cache\r\nContent-Length: {}\r\n\r\n{}",
    PAC_CONTENT_TYPE,
    script.len(),
    script
  )
}

/// True when the request line asks for exactly the PAC path. Paths that
/// merely contain it (`/wpad.dat.bak`) are not the PAC file.
fn requests_pac_file(preamble: &str) -> bool {
  let Some(line) = preamble.lines().next() else {
    return false;
  };
  let mut tokens = line.split_whitespace();
  tokens.next() == Some("GET") && tokens.next() == Some(PAC_PATH)
}

/// Shared, immutable state for request handlers.
struct PacContext {
  script: String,
  deny_processes: Vec<String>,
  resolver: Arc<dyn PortResolver>,
}

impl PacContext {
  fn is_denied(&self, peer_port: u16) -> bool {
    self
      .resolver
      .resolve(peer_port)
      .is_some_and(|owner| {
        self
          .deny_processes
          .iter()
          .any(|denied| denied.eq_ignore_ascii_case(&owner.name))
      })
  }
}

async fn handle_request<S>(mut stream: S, peer: SocketAddr, context: Arc<PacContext>) -> Result<()>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  let preamble = crate::proxy::read_preamble(&mut stream).await?;

  if context.is_denied(peer.port()) {
    tracing::info!("denied a PAC request from a deny-listed process on {}", peer);
    stream.write_all(NOT_FOUND).await?;
    stream.flush().await?;
    return Ok(());
  }

  if requests_pac_file(&preamble) {
    tracing::info!("serving the autoconfiguration script to {}", peer);
    stream
      .write_all(pac_response(&context.script).as_bytes())
      .await?;
  } else {
    stream.write_all(NOT_FOUND).await?;
  }
  stream.flush().await?;
  Ok(())
}

/// The autoconfiguration host worker.
pub struct PacHost {
  endpoint: SocketAddr,
  context: Arc<PacContext>,
}

impl PacHost {
  pub fn new(
    endpoint: SocketAddr,
    proxy: SocketAddr,
    hosts_to_proxy: &[String],
    deny_processes: Vec<String>,
  ) -> Self {
    Self {
      endpoint,
      context: Arc::new(PacContext {
        script: generate_script(proxy, hosts_to_proxy),
        deny_processes,
        resolver: Arc::new(SystemResolver),
      }),
    }
  }

  /// The script this host serves, for startup logging.
  pub fn script(&self) -> &str {
    &self.context.script
  }

  /// Accept loop over an already-bound listener. Each request runs as its
  /// own task so a stalled client never delays other clients or shutdown.
  async fn serve(&self, listener: TcpListener, shutdown: Shutdown) -> Result<()> {
    loop {
      tokio::select! {
        _ = shutdown.cancelled() => return Ok(()),
        accepted = listener.accept() => {
          match accepted {
            Ok((stream, peer)) => {
              let context = self.context.clone();
              tokio::spawn(async move {
                if let Err(e) = handle_request(stream, peer, context).await {
                  tracing::error!("Error serving a PAC request from {}: {}", peer, e);
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
}

#[async_trait]
impl Worker for PacHost {
  fn name(&self) -> &'static str {
    "pac"
  }

  async fn run(&self, shutdown: Shutdown) -> Result<()> {
    let listener = TcpListener::bind(self.endpoint)
      .await
      .map_err(|e| Error::proxy(format!("Failed to bind to {}: {}", self.endpoint, e)))?;
    tracing::info!("Hosting the autoconfiguration file on {}", self.endpoint);
    self.serve(listener, shutdown).await
  }

  async fn cleanup(&self) -> Result<()> {
    tracing::info!("Stopping the autoconfiguration host");
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::time::Duration;
  use tokio::io::AsyncReadExt;

  fn proxy() -> SocketAddr {
    "192.168.1.10:8080".parse().unwrap()
  }

  fn pac_host() -> PacHost {
    PacHost::new("127.0.0.1:0".parse().unwrap(), proxy(), &[], Vec::new())
  }

  #[test]
  fn empty_host_list_proxies_everything() {
    let script = generate_script(proxy(), &[]);
    assert!(script.contains("return \"PROXY 192.168.1.10:8080\";"));
    assert!(!script.contains("shExpMatch"));
    assert!(!script.contains("DIRECT"));
  }

  #[test]
  fn listed_hosts_get_match_branches_and_a_direct_fallback() {
    let hosts = vec!["*.example.com".to_string(), "intranet".to_string()];
    let script = generate_script(proxy(), &hosts);
    assert!(script.contains("shExpMatch(host, \"*.example.com\")"));
    assert!(script.contains("shExpMatch(host, \"intranet\")"));
    assert!(script.contains("return \"DIRECT\";"));
    assert_eq!(script.matches("PROXY 192.168.1.10:8080").count(), 2);
  }

  #[test]
  fn only_the_exact_pac_path_matches() {
    assert!(requests_pac_file("GET /wpad.dat HTTP/1.1\r\n\r\n"));
    assert!(!requests_pac_file("GET /wpad.dat.bak HTTP/1.1\r\n\r\n"));
    assert!(!requests_pac_file("GET /sub/wpad.dat HTTP/1.1\r\n\r\n"));
    assert!(!requests_pac_file("POST /wpad.dat HTTP/1.1\r\n\r\n"));
    assert!(!requests_pac_file(""));
  }

  #[tokio::test]
  async fn serves_the_script_for_the_wpad_path() {
    let host = pac_host();
    let (mut client, server) = tokio::io::duplex(8192);
    client
      .write_all(b"GET /wpad.dat HTTP/1.1\r\nHost: wpad\r\n\r\n")
      .await
      .unwrap();
    client.shutdown().await.unwrap();

    handle_request(server, "127.0.0.1:50000".parse().unwrap(), host.context.clone())
      .await
      .unwrap();

    let mut response = Vec::new();
    client.read_to_end(&mut response).await.unwrap();
    let response = String::from_utf8(response).unwrap();
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.contains("Content-Type: application/x-ns-proxy-autoconfig"));
    assert!(response.contains("Cache-Control: no-cache"));
    assert!(response.contains("FindProxyForURL"));
  }

  #[tokio::test]
  async fn other_paths_get_404() {
    let host = pac_host();
    for request in [
      &b"GET /favicon.ico HTTP/1.1\r\n\r\n"[..],
      &b"GET /wpad.dat.bak HTTP/1.1\r\n\r\n"[..],
    ] {
      let (mut client, server) = tokio::io::duplex(8192);
      client.write_all(request).await.unwrap();
      client.shutdown().await.unwrap();

      handle_request(server, "127.0.0.1:50001".parse().unwrap(), host.context.clone())
        .await
        .unwrap();

      let mut response = Vec::new();
      client.read_to_end(&mut response).await.unwrap();
      assert_eq!(response, NOT_FOUND);
    }
  }

  #[tokio::test]
  async fn stalled_client_does_not_block_shutdown() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = listener.local_addr().unwrap();
    let host = pac_host();
    let shutdown = Shutdown::new();

    let serving = {
      let shutdown = shutdown.clone();
      tokio::spawn(async move { host.serve(listener, shutdown).await })
    };

    // Connect and send nothing: the request never completes.
    let _stalled = tokio::net::TcpStream::connect(endpoint).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(2), serving)
      .await
      .expect("the accept loop must return promptly after cancellation")
      .unwrap()
      .unwrap();
  }
}
