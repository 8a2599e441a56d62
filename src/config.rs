//! Settings loading and validation
//!
//! Settings come from a JSON file. Malformed or missing required settings
//! are fatal at startup; nothing here is retried or defaulted silently
//! except where a default is documented.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::Path;

/// Default settings file looked up next to the binary's working directory.
pub const DEFAULT_CONFIG_PATH: &str = "wpad-audit.json";

/// Runtime settings for all workers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
  /// pcap device name to capture on. When absent the device inventory is
  /// printed at startup so the operator can pick one.
  pub device: Option<String>,
  /// Overrides the capture filter's source MAC (`AA:BB:CC:DD:EE:FF`).
  /// Defaults to the capture device's own address.
  pub capture_mac: Option<String>,
  /// pcap read timeout in milliseconds. Also bounds shutdown latency.
  pub capture_read_timeout_ms: i32,
  /// Port the PAC file host listens on. WPAD clients expect 80.
  pub pac_port: u16,
  /// Port the interception proxy listens on.
  pub proxy_port: u16,
  /// Run the local interception proxy. When false `proxy_server` must name
  /// the external proxy the PAC script should point at.
  pub enable_local_proxy: bool,
  /// External proxy address, used only when `enable_local_proxy` is false.
  pub proxy_server: Option<Ipv4Addr>,
  /// Hosts the PAC script routes through the proxy. Empty proxies everything.
  pub hosts_to_proxy: Vec<String>,
  /// Process names that are never poisoned or intercepted.
  pub deny_processes: Vec<String>,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      device: None,
      capture_mac: None,
      capture_read_timeout_ms: 1000,
      pac_port: 80,
      proxy_port: 8080,
      enable_local_proxy: true,
      proxy_server: None,
      hosts_to_proxy: Vec::new(),
      deny_processes: Vec::new(),
    }
  }
}

impl Config {
  /// Load settings from a JSON file and validate them.
  pub fn load(path: impl AsRef<Path>) -> Result<Self> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
      .map_err(|e| Error::config(format!("unable to read {}: {}", path.display(), e)))?;
    let config: Config = serde_json::from_str(&contents)
      .map_err(|e| Error::config(format!("unable to parse {}: {}", path.display(), e)))?;
    config.validate()?;
    Ok(config)
  }

  /// Check the cross-field requirements that serde cannot express.
  pub fn validate(&self) -> Result<()> {
    if !self.enable_local_proxy && self.proxy_server.is_none() {
      return Err(Error::config(
        "proxy_server is required when enable_local_proxy is false",
      ));
    }
    if self.capture_read_timeout_ms <= 0 {
      return Err(Error::config("capture_read_timeout_ms must be positive"));
    }
    if let Some(mac) = &self.capture_mac {
      parse_mac(mac)?;
    }
    Ok(())
  }

  /// The endpoint the PAC script advertises and the local proxy binds to.
  /// Derived once from the capture device's address and never mutated
  /// after worker start.
  pub fn proxy_endpoint(&self, device_ip: Ipv4Addr) -> SocketAddr {
    let addr = if self.enable_local_proxy {
      device_ip
    } else {
      // validate() guarantees the external address is present
      self.proxy_server.unwrap_or(device_ip)
    };
    SocketAddr::V4(SocketAddrV4::new(addr, self.proxy_port))
  }

  /// The endpoint the PAC file host binds to.
  pub fn pac_endpoint(&self, device_ip: Ipv4Addr) -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(device_ip, self.pac_port))
  }

  /// True when `name` is on the do-not-poison list (case-insensitive).
  pub fn is_denied(&self, name: &str) -> bool {
    self
      .deny_processes
      .iter()
      .any(|denied| denied.eq_ignore_ascii_case(name))
  }
}

/// Parse a `AA:BB:CC:DD:EE:FF` MAC address override.
pub fn parse_mac(value: &str) -> Result<pnet::datalink::MacAddr> {
  value
    .parse::<pnet::datalink::MacAddr>()
    .map_err(|_| Error::config(format!("unable to parse the MAC address {}", value)))
}
