//! Name-service cache flushing
//!
//! Clients cache WPAD lookups aggressively: the NBNS cache, the DNS
//! resolver cache, the WinHTTP autoproxy service, and WinINET's own
//! connection settings all remember an earlier answer. Flushing them at
//! startup makes clients re-resolve WPAD while the poisoner is listening;
//! flushing again at shutdown lets normal resolution return.

/// Flush every name-service cache the platform exposes. Reports overall
/// success; individual step failures are logged and do not stop the rest.
pub async fn flush() -> bool {
  platform::flush().await
}

#[cfg(windows)]
mod platform {
  use tokio::process::Command;

  const CONNECTION_SETTINGS_KEY: &str =
    r"HKCU\Software\Microsoft\Windows\CurrentVersion\Internet Settings\Connections";

  /// Run one flush command, logging stderr on failure.
  async fn run_step(description: &str, program: &str, args: &[&str]) -> bool {
    match Command::new(program).args(args).output().await {
      Ok(output) if output.status.success() => {
        tracing::info!("{}", description);
        true
      }
      Ok(output) => {
        tracing::warn!(
          "{} failed: {}",
          description,
          String::from_utf8_lossy(&output.stderr).trim()
        );
        false
      }
      Err(e) => {
        tracing::warn!("{} failed to start: {}", description, e);
        false
      }
    }
  }

  pub async fn flush() -> bool {
    let mut all_ok = true;

    // Cached WinINET proxy settings override a fresh WPAD resolution.
    all_ok &= run_step(
      "cleared the WinINET connection settings",
      "reg",
      &[
        "delete",
        CONNECTION_SETTINGS_KEY,
        "/v",
        "DefaultConnectionSettings",
        "/f",
      ],
    )
    .await;
    all_ok &= run_step(
      "cleared the saved legacy connection settings",
      "reg",
      &[
        "delete",
        CONNECTION_SETTINGS_KEY,
        "/v",
        "SavedLegacySettings",
        "/f",
      ],
    )
    .await;

    all_ok &= run_step("purged the NBNS name cache", "nbtstat", &["-R"]).await;
    all_ok &= run_step("flushed the DNS resolver cache", "ipconfig", &["/flushdns"]).await;

    // The autoproxy service caches the resolved PAC until restarted.
    all_ok &= run_step(
      "stopped the WinHTTP autoproxy service",
      "net",
      &["stop", "WinHttpAutoProxySvc"],
    )
    .await;
    all_ok &= run_step(
      "started the WinHTTP autoproxy service",
      "net",
      &["start", "WinHttpAutoProxySvc"],
    )
    .await;

    all_ok
  }
}

#[cfg(not(windows))]
mod platform {
  /// The caches being flushed are Windows components; elsewhere there is
  /// nothing to do.
  pub async fn flush() -> bool {
    tracing::debug!("no name-service caches to flush on this platform");
    true
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[cfg(not(windows))]
  #[tokio::test]
  async fn flush_is_a_successful_no_op_off_windows() {
    assert!(flush().await);
  }
}
