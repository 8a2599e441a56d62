//! Connection-to-process attribution
//!
//! Maps a local TCP port to the process that owns it by taking a snapshot
//! of the platform's extended TCP connection table. Only implemented on
//! Windows; other platforms always report no owner. Attribution misses are
//! normal (short-lived processes, insufficient privilege) and must never
//! fail the caller's connection handling.

use std::path::PathBuf;

/// The process on the other end of a local TCP port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOwner {
  pub pid: u32,
  pub name: String,
  /// Executable path; resolving it needs an elevated privilege context and
  /// can miss when the process already exited.
  pub path: Option<PathBuf>,
}

/// One decoded `MIB_TCPROW_OWNER_PID` record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpTableRow {
  pub local_port: u16,
  pub pid: u32,
}

/// Size of one record in the extended TCP table: five DWORD address/port
/// fields plus the owning pid.
const TCP_ROW_SIZE: usize = 24;

/// Field offsets inside a record.
const LOCAL_PORT_OFFSET: usize = 8;
const OWNING_PID_OFFSET: usize = 20;

/// Decode an extended-TCP-table buffer: a native-endian `u32` entry count
/// followed by fixed-size records. Bounds-checked throughout; a truncated
/// buffer yields only the rows that fit.
pub fn decode_tcp_table(buf: &[u8]) -> Vec<TcpTableRow> {
  let Some(count) = buf.get(0..4) else {
    return Vec::new();
  };
  let num_entries = u32::from_ne_bytes(count.try_into().unwrap()) as usize;

  let mut rows = Vec::with_capacity(num_entries.min(1024));
  for index in 0..num_entries {
    let offset = 4 + index * TCP_ROW_SIZE;
    let Some(record) = buf.get(offset..offset + TCP_ROW_SIZE) else {
      break;
    };
    // dwLocalPort keeps the port in network order in its low word
    let port_dword = u32::from_ne_bytes(
      record[LOCAL_PORT_OFFSET..LOCAL_PORT_OFFSET + 4]
        .try_into()
        .unwrap(),
    );
    let pid = u32::from_ne_bytes(
      record[OWNING_PID_OFFSET..OWNING_PID_OFFSET + 4]
        .try_into()
        .unwrap(),
    );
    rows.push(TcpTableRow {
      local_port: u16::from_be(port_dword as u16),
      pid,
    });
  }
  rows
}

/// Resolve the process owning `local_port`, if the platform can tell.
///
/// Absence is an expected outcome, not an error: a `None` means the
/// platform has no table support, the snapshot failed, or the owning
/// process went away between snapshot and lookup.
pub fn resolve(local_port: u16) -> Option<ProcessOwner> {
  let table = snapshot_tcp_table()?;
  let row = decode_tcp_table(&table)
    .into_iter()
    .find(|row| row.local_port == local_port && row.pid > 0)?;
  describe_pid(row.pid)
}

/// Look up a pid's name and executable path in the live process table.
fn describe_pid(pid: u32) -> Option<ProcessOwner> {
  let mut system = sysinfo::System::new();
  system.refresh_processes_specifics(
    sysinfo::ProcessesToUpdate::Some(&[sysinfo::Pid::from_u32(pid)]),
    true,
    sysinfo::ProcessRefreshKind::everything(),
  );

  let process = system.process(sysinfo::Pid::from_u32(pid))?;
  Some(ProcessOwner {
    pid,
    name: process.name().to_string_lossy().to_string(),
    path: process.exe().map(PathBuf::from),
  })
}

#[cfg(windows)]
mod platform {
  const AF_INET: u32 = 2;
  const TCP_TABLE_OWNER_PID_ALL: u32 = 5;
  const NO_ERROR: u32 = 0;
  const ERROR_INSUFFICIENT_BUFFER: u32 = 122;

  #[link(name = "iphlpapi")]
  extern "system" {
    fn GetExtendedTcpTable(
      p_tcp_table: *mut u8,
      pdw_size: *mut u32,
      b_order: i32,
      ul_af: u32,
      table_class: u32,
      reserved: u32,
    ) -> u32;
  }

  /// Take a point-in-time snapshot of the IPv4 TCP table with owning pids.
  pub fn snapshot_tcp_table() -> Option<Vec<u8>> {
    let mut size: u32 = 0;
    let ret = unsafe {
      GetExtendedTcpTable(
        std::ptr::null_mut(),
        &mut size,
        0,
        AF_INET,
        TCP_TABLE_OWNER_PID_ALL,
        0,
      )
    };
    if ret != ERROR_INSUFFICIENT_BUFFER {
      tracing::warn!("GetExtendedTcpTable size probe failed with code {}", ret);
      return None;
    }

    let mut buf = vec![0u8; size as usize];
    let ret = unsafe {
      GetExtendedTcpTable(
        buf.as_mut_ptr(),
        &mut size,
        0,
        AF_INET,
        TCP_TABLE_OWNER_PID_ALL,
        0,
      )
    };
    if ret != NO_ERROR {
      tracing::warn!("GetExtendedTcpTable failed with code {}", ret);
      return None;
    }
    Some(buf)
  }
}

#[cfg(not(windows))]
mod platform {
  /// The extended TCP table is a Windows capability; elsewhere attribution
  /// is stubbed out and every lookup misses.
  pub fn snapshot_tcp_table() -> Option<Vec<u8>> {
    None
  }
}

use platform::snapshot_tcp_table;

#[cfg(test)]
mod tests {
  use super::*;

  fn synthetic_table(rows: &[(u16, u32)]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&(rows.len() as u32).to_ne_bytes());
    for (port, pid) in rows {
      buf.extend_from_slice(&5u32.to_ne_bytes()); // state: established
      buf.extend_from_slice(&0u32.to_ne_bytes()); // local addr
      buf.extend_from_slice(&(u32::from(port.to_be()).to_ne_bytes())); // local port, network order low word
      buf.extend_from_slice(&0u32.to_ne_bytes()); // remote addr
      buf.extend_from_slice(&0u32.to_ne_bytes()); // remote port
      buf.extend_from_slice(&pid.to_ne_bytes());
    }
    buf
  }

  #[test]
  fn decodes_ports_in_host_order() {
    let buf = synthetic_table(&[(49712, 1234), (137, 4)]);
    let rows = decode_tcp_table(&buf);
    assert_eq!(
      rows,
      vec![
        TcpTableRow { local_port: 49712, pid: 1234 },
        TcpTableRow { local_port: 137, pid: 4 },
      ]
    );
  }

  #[test]
  fn truncated_buffers_never_panic() {
    let buf = synthetic_table(&[(80, 1), (443, 2)]);
    // Claimed entry count larger than the buffer holds
    let mut oversold = buf.clone();
    oversold[..4].copy_from_slice(&100u32.to_ne_bytes());
    assert_eq!(decode_tcp_table(&oversold).len(), 2);

    // Cut mid-record
    assert_eq!(decode_tcp_table(&buf[..30]).len(), 1);
    assert!(decode_tcp_table(&buf[..3]).is_empty());
    assert!(decode_tcp_table(&[]).is_empty());
  }

  #[cfg(not(windows))]
  #[test]
  fn resolve_is_a_miss_on_unsupported_platforms() {
    assert!(resolve(80).is_none());
  }
}
