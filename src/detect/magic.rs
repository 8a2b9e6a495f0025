//! File-format signatures and known reference strings, searched forward and
//! byte-reversed in one pass.

use hex_literal::hex;

use super::{Detection, Detector, Finding};

pub const SIGNATURES: &[(&str, &[u8])] = &[
    // OLE2 compound file; DOC, XLS and PPT share it
    ("DOC/XLS/PPT Header", &hex!("d0cf11e0a1b11ae1")),
    ("DOC Footer", b"Word.Document."),
    (
        "XLS Footer",
        &hex!("feffffff000000000000000057006f0072006b0062006f006f006b00"),
    ),
    ("PPT Footer", &hex!("a0461df0")),
    ("ZIP Header", &hex!("504b030414")),
    ("ZIP Footer", &hex!("504b050600")),
    ("ZIPLock Footer", &hex!("504b030414000100630000000000")),
    ("JPG Header", &hex!("ffd8ffe000104a464946000101")),
    ("GIF Header", b"GIF89a"),
    ("GIF Footer", &hex!("2100003b00")),
    ("PDF Header", b"%PDF"),
    ("PDF Header (alternate)", b"&#205"),
    ("PDF Footer", b"%%EOF"),
    ("Torrent Header", b"announce"),
    ("GZ Header", &hex!("1f8b0808")),
    ("TAR Header", &hex!("1f8b0800")),
    ("TAR.GZ Header", &hex!("1f9d9070")),
    ("EPUB Header", &hex!("504b03040a000200")),
    ("PNG Header", &hex!("89504e470d0a1a0a")),
    ("8192 Header", b"mQQNB"),
    ("4096 Header", b"mQINBFg/"),
    ("2048 Header", &hex!("952e3e2e584b7a")),
    ("Secret Header", &hex!("526172211a0700")),
    ("RAR Header", b"mQENBFg"),
    ("OGG Header", b"OggS"),
    ("WAV/AVI Header (RIFF)", b"RIFF"),
    ("WAV Header (alternate)", b"WAVE"),
    ("AVI Header (alternate)", b"AVI "),
    ("MIDI Header", b"MThd"),
    ("7z Header", &hex!("377abcaf271c")),
    ("7z Footer", &hex!("0000001706")),
    ("DMG Header", &hex!("7801730d626260")),
    ("Wikileaks", b"Wikileaks"),
    ("Julian Assange", b"Julian Assange"),
    ("Mendax", b"Mendax"),
    (
        "Peter Todd OTS hello world",
        &hex!("1df8859e60bc679503d16dcb870e6ce91a57e9df"),
    ),
    ("OpenTimestamps", b"OpenTimestamps"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MagicMatch {
    pub label: &'static str,
    pub reversed: bool,
    pub offset: usize,
}

impl MagicMatch {
    pub fn description(&self) -> String {
        if self.reversed {
            format!("{} (reversed) [offset {}]", self.label, self.offset)
        } else {
            format!("{} [offset {}]", self.label, self.offset)
        }
    }
}

struct Pattern {
    label: &'static str,
    bytes: Vec<u8>,
    reversed: bool,
}

/// Reports the first offset of each signature, in each orientation. When signatures
/// overlap at one offset (one is a prefix of another) only the longest is reported.
pub struct MagicBytes {
    patterns: Vec<Pattern>,
    /// Pattern indices by first byte.
    by_first_byte: Vec<Vec<usize>>,
}

impl MagicBytes {
    pub fn new() -> Self {
        Self::with_signatures(SIGNATURES)
    }

    pub fn with_signatures(signatures: &[(&'static str, &[u8])]) -> Self {
        let mut patterns = Vec::with_capacity(signatures.len() * 2);
        for &(label, bytes) in signatures {
            if bytes.is_empty() {
                continue;
            }
            patterns.push(Pattern {
                label,
                bytes: bytes.to_vec(),
                reversed: false,
            });
            patterns.push(Pattern {
                label,
                bytes: bytes.iter().rev().copied().collect(),
                reversed: true,
            });
        }
        let mut by_first_byte = vec![Vec::new(); 256];
        for (i, p) in patterns.iter().enumerate() {
            by_first_byte[p.bytes[0] as usize].push(i);
        }
        Self {
            patterns,
            by_first_byte,
        }
    }

    pub fn search(&self, data: &[u8]) -> Vec<MagicMatch> {
        let mut found = vec![false; self.patterns.len()];
        let mut matches = Vec::new();
        for offset in 0..data.len() {
            // longest match at this offset, per orientation
            let mut best: [Option<usize>; 2] = [None, None];
            for &i in &self.by_first_byte[data[offset] as usize] {
                let pattern = &self.patterns[i];
                if found[i] || !data[offset..].starts_with(&pattern.bytes) {
                    continue;
                }
                let slot = &mut best[pattern.reversed as usize];
                if slot.map_or(true, |j| self.patterns[j].bytes.len() < pattern.bytes.len()) {
                    *slot = Some(i);
                }
            }
            for i in best.into_iter().flatten() {
                found[i] = true;
                let pattern = &self.patterns[i];
                matches.push(MagicMatch {
                    label: pattern.label,
                    reversed: pattern.reversed,
                    offset,
                });
            }
        }
        matches
    }
}

impl Default for MagicBytes {
    fn default() -> Self {
        Self::new()
    }
}

impl Detector for MagicBytes {
    fn name(&self) -> &str {
        "Magic bytes"
    }

    fn safe_name(&self) -> &str {
        "magic-bytes"
    }

    fn detect(&self, data: &[u8]) -> Detection {
        self.search(data)
            .into_iter()
            .map(|m| Finding {
                description: m.description(),
                offset: m.offset,
            })
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn forward_signature() {
        let mut data = vec![0_u8; 300];
        data[100..104].copy_from_slice(b"%PDF");
        let matches = MagicBytes::new().search(&data);
        assert_eq!(
            matches,
            vec![MagicMatch {
                label: "PDF Header",
                reversed: false,
                offset: 100
            }]
        );
    }

    #[test]
    fn reversed_signature() {
        let mut data = vec![0_u8; 300];
        data[50..54].copy_from_slice(b"SggO");
        let detection = MagicBytes::new().detect(&data);
        assert_eq!(
            detection.findings,
            vec![Finding {
                description: "OGG Header (reversed) [offset 50]".into(),
                offset: 50
            }]
        );
    }

    #[test]
    fn first_offset_only_and_shared_signatures() {
        let mut data = b"xxMendax..Mendax".to_vec();
        data.extend_from_slice(&hex!("d0cf11e0a1b11ae1"));
        data.extend_from_slice(b"..RIFF");
        let matches = MagicBytes::new().search(&data);
        let labels = matches.iter().map(|m| (m.label, m.offset)).collect::<Vec<_>>();
        assert_eq!(
            labels,
            vec![
                ("Mendax", 2),
                ("DOC/XLS/PPT Header", 16),
                ("WAV/AVI Header (RIFF)", 26)
            ]
        );
        assert!(MagicBytes::new().search(&[]).is_empty());
    }

    #[test]
    fn every_signature_matches_once_where_placed() {
        let magic = MagicBytes::new();
        for &(label, bytes) in SIGNATURES {
            let mut data = vec![0_u8; 300];
            data[100..100 + bytes.len()].copy_from_slice(bytes);
            let at_100 = magic
                .search(&data)
                .into_iter()
                .filter(|m| m.offset == 100 && !m.reversed)
                .collect::<Vec<_>>();
            assert_eq!(
                at_100,
                vec![MagicMatch {
                    label,
                    reversed: false,
                    offset: 100
                }],
                "{label}"
            );
        }
    }

    #[test]
    fn signature_labels_and_bytes_are_unique() {
        for (i, (label, bytes)) in SIGNATURES.iter().enumerate() {
            for (other_label, other_bytes) in &SIGNATURES[i + 1..] {
                assert_ne!(label, other_label);
                assert_ne!(bytes, other_bytes, "{label} / {other_label}");
            }
        }
    }
}
