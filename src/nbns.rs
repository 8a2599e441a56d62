//! NetBIOS Name Service wire format
//!
//! Just enough of RFC 1001/1002 to recognise a WPAD name query and bake a
//! positive response for it: the half-ASCII name encoding, the query header
//! checks, and a fixed response template with two mutable fields.

/// The hostname clients resolve to find their proxy autoconfiguration file.
pub const WPAD_HOST_NAME: &str = "WPAD";

/// Well-known NBNS port.
pub const NBNS_PORT: u16 = 137;

/// Offset of the responder IPv4 address inside [`RESPONSE_TEMPLATE`].
pub const ADDR_OFFSET: usize = 58;

/// Length of the encoded-name field of a question record.
pub const ENCODED_NAME_LEN: usize = 32;

/// Offset of the name length byte inside a query payload.
const NAME_LEN_OFFSET: usize = 12;

/// Baked positive NBNS response (RFC 1002 §4.2.1.1 layout). Every field is
/// fixed except the transaction id at [0:2) and the responder address at
/// [58:62), which are patched per query.
pub const RESPONSE_TEMPLATE: [u8; 62] = [
  0x00, 0x00, // Transaction id, copied from the query
  0x85, 0x00, // Flags: response, authoritative, recursion desired
  0x00, 0x00, // Questions
  0x00, 0x01, // Answer RRs
  0x00, 0x00, // Authority RRs
  0x00, 0x00, // Additional RRs
  0x20, // Name length
  // "WPAD" half-ASCII encoded, space padded
  0x46, 0x48, 0x46, 0x41, 0x45, 0x42, 0x45, 0x45, 0x43, 0x41, 0x43, 0x41, 0x43, 0x41, 0x43, 0x41,
  0x43, 0x41, 0x43, 0x41, 0x43, 0x41, 0x43, 0x41, 0x43, 0x41, 0x43, 0x41, 0x43, 0x41, 0x41, 0x41,
  0x00, // Name terminator
  0x00, 0x20, // Type: NB
  0x00, 0x01, // Class: IN
  0x00, 0x00, 0x00, 0xa5, // Time to live
  0x00, 0x06, // Data length
  0x00, 0x00, // Name flags
  0x00, 0x00, 0x00, 0x00, // Responder IPv4 address
];

/// A validated NBNS name query extracted from a UDP payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameQuery {
  /// Transaction id bytes, kept verbatim for the reply.
  pub transaction_id: [u8; 2],
  /// The decoded, trimmed question name.
  pub name: String,
}

/// Parse a UDP payload as an NBNS name query.
///
/// Returns `None` for anything that is not a query with opcode query
/// (top flag bits set), is truncated, or does not carry the expected
/// 0x20-byte encoded name.
pub fn parse_query(payload: &[u8]) -> Option<NameQuery> {
  if payload.len() < NAME_LEN_OFFSET + 1 + ENCODED_NAME_LEN {
    return None;
  }

  let flags = u16::from_be_bytes([payload[2], payload[3]]);
  // Response = query(0), OpCode = query(0)
  if flags & 0xc000 != 0 {
    return None;
  }
  if payload[NAME_LEN_OFFSET] != ENCODED_NAME_LEN as u8 {
    return None;
  }

  let encoded = &payload[NAME_LEN_OFFSET + 1..NAME_LEN_OFFSET + 1 + ENCODED_NAME_LEN];
  Some(NameQuery {
    transaction_id: [payload[0], payload[1]],
    name: decode_name(encoded),
  })
}

/// Decode a half-ASCII encoded NetBIOS name (RFC 1001 §14.1).
///
/// Each byte pair maps to one character; the result is truncated at the
/// first NUL and trimmed of the space padding.
pub fn decode_name(encoded: &[u8]) -> String {
  let mut name = String::with_capacity(encoded.len() / 2);
  for pair in encoded.chunks_exact(2) {
    let value = (pair[0].wrapping_sub(0x41) << 4) | (pair[1].wrapping_sub(0x41) & 0xf);
    name.push(char::from(value));
  }
  match name.split('\0').next() {
    Some(prefix) => prefix.trim().to_string(),
    None => name.trim().to_string(),
  }
}

/// Encode a name into the 32-byte half-ASCII form, space padded to 15
/// characters plus a NUL type byte.
pub fn encode_name(name: &str) -> [u8; ENCODED_NAME_LEN] {
  let mut padded = [b' '; ENCODED_NAME_LEN / 2];
  for (slot, byte) in padded.iter_mut().zip(name.bytes()) {
    *slot = byte;
  }
  padded[ENCODED_NAME_LEN / 2 - 1] = 0x00;

  let mut encoded = [0u8; ENCODED_NAME_LEN];
  for (index, byte) in padded.iter().enumerate() {
    encoded[index * 2] = 0x41 + (byte >> 4);
    encoded[index * 2 + 1] = 0x41 + (byte & 0xf);
  }
  encoded
}

/// Clone the baked response and patch in the transaction id from the query
/// and the responder's own IPv4 address.
pub fn build_reply(transaction_id: [u8; 2], responder: std::net::Ipv4Addr) -> [u8; 62] {
  let mut reply = RESPONSE_TEMPLATE;
  reply[..2].copy_from_slice(&transaction_id);
  reply[ADDR_OFFSET..ADDR_OFFSET + 4].copy_from_slice(&responder.octets());
  reply
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::net::Ipv4Addr;

  fn query_payload(transaction_id: [u8; 2], flags: u16, name: &str) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&transaction_id);
    payload.extend_from_slice(&flags.to_be_bytes());
    payload.extend_from_slice(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
    payload.push(ENCODED_NAME_LEN as u8);
    payload.extend_from_slice(&encode_name(name));
    payload.extend_from_slice(&[0x00, 0x00, 0x20, 0x00, 0x01]);
    payload
  }

  #[test]
  fn name_round_trips_through_half_ascii() {
    for name in ["WPAD", "FILESERVER", "A", "WORKSTATION-01"] {
      let encoded = encode_name(name);
      assert_eq!(decode_name(&encoded), name);
    }
  }

  #[test]
  fn template_name_field_decodes_to_wpad() {
    let encoded = &RESPONSE_TEMPLATE[13..13 + ENCODED_NAME_LEN];
    assert_eq!(decode_name(encoded), WPAD_HOST_NAME);
  }

  #[test]
  fn decode_discards_content_after_first_nul() {
    let mut encoded = encode_name("WPAD");
    // Corrupt the padding after the NUL terminator
    encoded[ENCODED_NAME_LEN - 2] = 0x5a;
    encoded[ENCODED_NAME_LEN - 1] = 0x5a;
    assert_eq!(decode_name(&encoded), "WPAD");
  }

  #[test]
  fn parses_a_wpad_query() {
    let payload = query_payload([0xab, 0xcd], 0x0110, WPAD_HOST_NAME);
    let query = parse_query(&payload).unwrap();
    assert_eq!(query.transaction_id, [0xab, 0xcd]);
    assert_eq!(query.name, WPAD_HOST_NAME);
  }

  #[test]
  fn rejects_responses_and_other_opcodes() {
    // Response bit set
    assert!(parse_query(&query_payload([0, 1], 0x8500, WPAD_HOST_NAME)).is_none());
    // High opcode bit set (reserved/WACK range)
    assert!(parse_query(&query_payload([0, 1], 0x4000, WPAD_HOST_NAME)).is_none());
  }

  #[test]
  fn rejects_truncated_payloads() {
    let payload = query_payload([0, 1], 0x0110, WPAD_HOST_NAME);
    assert!(parse_query(&payload[..20]).is_none());
    assert!(parse_query(&[]).is_none());
  }

  #[test]
  fn rejects_unexpected_name_length() {
    let mut payload = query_payload([0, 1], 0x0110, WPAD_HOST_NAME);
    payload[12] = 0x10;
    assert!(parse_query(&payload).is_none());
  }

  #[test]
  fn reply_varies_only_in_the_two_mutable_fields() {
    let first = build_reply([0x12, 0x34], Ipv4Addr::new(192, 168, 1, 10));
    let second = build_reply([0xfe, 0xff], Ipv4Addr::new(10, 0, 0, 1));

    assert_eq!(first.len(), RESPONSE_TEMPLATE.len());
    for (offset, (a, b)) in first.iter().zip(second.iter()).enumerate() {
      let mutable = offset < 2 || (ADDR_OFFSET..ADDR_OFFSET + 4).contains(&offset);
      if !mutable {
        assert_eq!(a, b, "fixed field diverged at offset {}", offset);
        assert_eq!(*a, RESPONSE_TEMPLATE[offset]);
      }
    }

    assert_eq!(&first[..2], &[0x12, 0x34]);
    assert_eq!(&first[ADDR_OFFSET..], &[192, 168, 1, 10]);
    assert_eq!(&second[ADDR_OFFSET..], &[10, 0, 0, 1]);
  }
}
