use super::{Detection, Detector, Finding};

/// Runs this long are worth a look.
pub const INTERESTING_LEN: usize = 8;
/// Anything shorter is noise.
pub const ANY_LEN: usize = 5;

pub fn is_text_byte(x: u8) -> bool {
    matches!(x, b'\t' | b'\r' | b'\n' | b' ') || (0x20..0x7f).contains(&x)
}

/// `(offset, length)` of the longest run of text bytes; the first one wins a tie.
pub fn longest_text_run(data: &[u8]) -> Option<(usize, usize)> {
    let mut best: Option<(usize, usize)> = None;
    let mut start = 0;
    while start < data.len() {
        if !is_text_byte(data[start]) {
            start += 1;
            continue;
        }
        let len = data[start..].iter().take_while(|&&x| is_text_byte(x)).count();
        if best.map_or(true, |(_, l)| len > l) {
            best = Some((start, len));
        }
        start += len;
    }
    best
}

/// Reports the longest printable run if it reaches `min_len`.
#[derive(Debug, Clone)]
pub struct Plaintext {
    pub min_len: usize,
}

impl Default for Plaintext {
    fn default() -> Self {
        Self {
            min_len: INTERESTING_LEN,
        }
    }
}

impl Detector for Plaintext {
    fn name(&self) -> &str {
        "Plaintext"
    }

    fn safe_name(&self) -> &str {
        "plaintext"
    }

    fn detect(&self, data: &[u8]) -> Detection {
        longest_text_run(data)
            .filter(|&(_, len)| len >= self.min_len)
            .map(|(offset, len)| Finding {
                description: String::from_utf8_lossy(&data[offset..offset + len]).into_owned(),
                offset,
            })
            .into_iter()
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn longest_run_wins() {
        let data = b"\x00\x01abc\x02hello world\x03\xffxyz";
        assert_eq!(longest_text_run(data), Some((6, 11)));
        assert_eq!(longest_text_run(&[0, 1, 2]), None);
        assert_eq!(longest_text_run(b""), None);
    }

    #[test]
    fn threshold_is_inclusive() {
        let detector = Plaintext::default();
        let detection = detector.detect(b"\x00\x0012345678\x00");
        assert_eq!(
            detection.findings,
            vec![Finding {
                description: "12345678".into(),
                offset: 2
            }]
        );
        assert!(detector.detect(b"\x001234567\x00").is_empty());

        let any = Plaintext { min_len: ANY_LEN };
        assert!(!any.detect(b"\xffline\n\xfe").is_empty());
        assert!(any.detect(b"\xffabcd\xfe").is_empty());
    }
}
