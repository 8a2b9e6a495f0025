//! Content detectors: pure functions from a byte buffer to zero or more findings.

pub mod aes;
pub mod magic;
pub mod pgp;
pub mod plaintext;

pub use aes::AesKeys;
pub use magic::MagicBytes;
pub use pgp::PgpPackets;
pub use plaintext::Plaintext;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    pub description: String,
    /// Where in the buffer the match starts.
    pub offset: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Detection {
    pub findings: Vec<Finding>,
}

impl Detection {
    pub fn is_empty(&self) -> bool {
        self.findings.is_empty()
    }

    pub fn descriptions(&self) -> impl Iterator<Item = &str> {
        self.findings.iter().map(|x| x.description.as_str())
    }
}

impl FromIterator<Finding> for Detection {
    fn from_iter<T: IntoIterator<Item = Finding>>(iter: T) -> Self {
        Self {
            findings: iter.into_iter().collect(),
        }
    }
}

pub trait Detector {
    /// Human-readable name, used as a column header.
    fn name(&self) -> &str;

    /// File-name friendly name.
    fn safe_name(&self) -> &str;

    fn detect(&self, data: &[u8]) -> Detection;
}

/// Every detector with its default settings.
pub fn default_detectors() -> Vec<Box<dyn Detector>> {
    vec![
        Box::new(Plaintext::default()),
        Box::new(MagicBytes::new()),
        Box::new(PgpPackets),
        Box::new(AesKeys::new()),
    ]
}
