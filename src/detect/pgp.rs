//! OpenPGP packet framing (RFC 4880 §4). Only headers and the first few body bytes are
//! checked; nothing is decrypted or verified.

use byteorder::{ByteOrder, BE};

use super::{Detection, Detector, Finding};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Packet {
    pub tag: u8,
    pub offset: usize,
    /// Header plus body.
    pub len: usize,
}

pub fn tag_name(tag: u8) -> &'static str {
    match tag {
        1 => "Public-Key Encrypted Session Key",
        2 => "Signature",
        3 => "Symmetric-Key Encrypted Session Key",
        4 => "One-Pass Signature",
        5 => "Secret-Key",
        6 => "Public-Key",
        7 => "Secret-Subkey",
        8 => "Compressed Data",
        9 => "Symmetrically Encrypted Data",
        10 => "Marker",
        11 => "Literal Data",
        13 => "User ID",
        14 => "Public-Subkey",
        18 => "Sym. Encrypted Integrity Protected Data",
        19 => "Modification Detection Code",
        _ => "Unknown",
    }
}

/// Parses one packet header at the start of `data`: `(tag, header len, body len)`.
/// Partial and indeterminate lengths are not supported.
fn parse_header(data: &[u8]) -> Option<(u8, usize, usize)> {
    let first = *data.first()?;
    if first & 0x80 == 0 {
        return None;
    }
    if first & 0x40 != 0 {
        let tag = first & 0x3f;
        let o1 = *data.get(1)? as usize;
        match o1 {
            0..=191 => Some((tag, 2, o1)),
            192..=223 => {
                let o2 = *data.get(2)? as usize;
                Some((tag, 3, ((o1 - 192) << 8) + o2 + 192))
            }
            255 => Some((tag, 6, BE::read_u32(data.get(2..6)?) as usize)),
            _ => None,
        }
    } else {
        let tag = (first >> 2) & 0x0f;
        match first & 0x03 {
            0 => Some((tag, 2, *data.get(1)? as usize)),
            1 => Some((tag, 3, BE::read_u16(data.get(1..3)?) as usize)),
            2 => Some((tag, 5, BE::read_u32(data.get(1..5)?) as usize)),
            _ => None,
        }
    }
}

fn plausible_body(tag: u8, body: &[u8]) -> bool {
    let version = body.first().copied();
    match tag {
        1 => version == Some(3) && body.len() >= 10,
        2 => matches!(version, Some(3 | 4)),
        3 => version == Some(4),
        4 => version == Some(3) && body.len() == 13,
        5 | 6 | 7 | 14 => matches!(version, Some(3 | 4)),
        8 => matches!(version, Some(0..=3)),
        9 => body.len() >= 10,
        10 => body == b"PGP",
        11 => matches!(version, Some(b'b' | b't' | b'u')),
        13 => !body.is_empty() && std::str::from_utf8(body).is_ok(),
        18 => version == Some(1),
        19 => body.len() == 20,
        _ => false,
    }
}

/// One packet at the start of `data`, if it frames and looks plausible.
pub fn parse_packet(data: &[u8]) -> Option<(u8, usize)> {
    let (tag, header_len, body_len) = parse_header(data)?;
    let end = header_len.checked_add(body_len)?;
    let body = data.get(header_len..end)?;
    plausible_body(tag, body).then_some((tag, end))
}

/// Consecutive packets starting at `offset`.
pub fn parse_stream(data: &[u8], offset: usize) -> Vec<Packet> {
    let mut packets = Vec::new();
    let mut pos = offset;
    while let Some((tag, len)) = parse_packet(&data[pos..]) {
        packets.push(Packet {
            tag,
            offset: pos,
            len,
        });
        pos += len;
    }
    packets
}

/// Packets at offset 0, or failing that, every packet stream found at any offset.
pub fn find_packets(data: &[u8]) -> Vec<Packet> {
    let packets = parse_stream(data, 0);
    if !packets.is_empty() {
        return packets;
    }
    let mut all = Vec::new();
    let mut offset = 1;
    while offset < data.len() {
        let stream = parse_stream(data, offset);
        match stream.last() {
            Some(last) => {
                offset = last.offset + last.len;
                all.extend(stream);
            }
            None => offset += 1,
        }
    }
    all
}

pub struct PgpPackets;

impl Detector for PgpPackets {
    fn name(&self) -> &str {
        "PGP data"
    }

    fn safe_name(&self) -> &str {
        "pgp-data"
    }

    fn detect(&self, data: &[u8]) -> Detection {
        find_packets(data)
            .into_iter()
            .map(|p| Finding {
                description: format!(
                    "{} packet (tag {}) [offset {}, {} bytes]",
                    tag_name(p.tag),
                    p.tag,
                    p.offset,
                    p.len
                ),
                offset: p.offset,
            })
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    /// A marker packet followed by a literal data packet, both in the new format.
    fn message() -> Vec<u8> {
        let mut data = vec![0xca, 0x03];
        data.extend_from_slice(b"PGP");
        let literal = b"b\x04name\x00\x00\x00\x00hello";
        data.push(0xcb);
        data.push(literal.len() as u8);
        data.extend_from_slice(literal);
        data
    }

    #[test]
    fn stream_at_offset_zero() {
        let data = message();
        let packets = find_packets(&data);
        assert_eq!(
            packets,
            vec![
                Packet { tag: 10, offset: 0, len: 5 },
                Packet { tag: 11, offset: 5, len: 17 },
            ]
        );
    }

    #[test]
    fn stream_after_garbage() {
        let mut data = vec![0x00, 0x13, 0x37];
        data.extend_from_slice(&message());
        let detection = PgpPackets.detect(&data);
        assert_eq!(detection.findings.len(), 2);
        assert_eq!(detection.findings[0].offset, 3);
        assert!(detection.findings[1].description.starts_with("Literal Data packet"));
    }

    #[test]
    fn old_format_header() {
        // tag 2, one-octet length
        let mut data = vec![0x88, 0x04, 0x04, 0x00, 0x01, 0x08];
        assert_eq!(parse_packet(&data), Some((2, 6)));
        // unsupported version
        data[2] = 0x09;
        assert_eq!(parse_packet(&data), None);
    }

    #[test]
    fn truncated_body_is_rejected() {
        let mut data = message();
        data.truncate(10);
        assert_eq!(parse_stream(&data, 0).len(), 1);
        assert!(PgpPackets.detect(&[0xff; 64]).is_empty());
    }
}
