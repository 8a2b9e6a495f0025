//! Expanded AES key schedules sitting in memory-dump-like data.
//!
//! A window matches when every round key after the first is exactly what the
//! key schedule derives from the key at the start of the window.

use crate::EncodeHex;

use super::{Detection, Detector, Finding};

const RCON: [u8; 10] = [0x01, 0x02, 0x04, 0x08, 0x10, 0x20, 0x40, 0x80, 0x1b, 0x36];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySize {
    Aes128,
    Aes256,
}

impl KeySize {
    pub const ALL: [KeySize; 2] = [KeySize::Aes128, KeySize::Aes256];

    pub fn key_len(self) -> usize {
        match self {
            KeySize::Aes128 => 16,
            KeySize::Aes256 => 32,
        }
    }

    /// Bytes in the full expanded schedule.
    pub fn schedule_len(self) -> usize {
        match self {
            KeySize::Aes128 => 176,
            KeySize::Aes256 => 240,
        }
    }

    fn bits(self) -> u32 {
        self.key_len() as u32 * 8
    }
}

fn rotl8(x: u8, shift: u32) -> u8 {
    x.rotate_left(shift)
}

/// The AES S-box, walking GF(2^8) with generator 3 and its inverse.
fn compute_sbox() -> [u8; 256] {
    let mut sbox = [0_u8; 256];
    let mut p: u8 = 1;
    let mut q: u8 = 1;
    loop {
        // p *= 3
        p = p ^ (p << 1) ^ if p & 0x80 != 0 { 0x1b } else { 0 };
        // q /= 3
        q ^= q << 1;
        q ^= q << 2;
        q ^= q << 4;
        if q & 0x80 != 0 {
            q ^= 0x09;
        }
        let x = q ^ rotl8(q, 1) ^ rotl8(q, 2) ^ rotl8(q, 3) ^ rotl8(q, 4);
        sbox[p as usize] = x ^ 0x63;
        if p == 1 {
            break;
        }
    }
    sbox[0] = 0x63;
    sbox
}

pub struct AesKeys {
    sbox: [u8; 256],
}

impl AesKeys {
    pub fn new() -> Self {
        Self {
            sbox: compute_sbox(),
        }
    }

    fn sub_word(&self, w: [u8; 4]) -> [u8; 4] {
        w.map(|b| self.sbox[b as usize])
    }

    /// Word `i` of a schedule, from the words `i - 1` and `i - nk` before it.
    fn next_word(&self, i: usize, nk: usize, last: [u8; 4], back: [u8; 4]) -> [u8; 4] {
        let mut temp = last;
        if i % nk == 0 {
            temp.rotate_left(1);
            temp = self.sub_word(temp);
            temp[0] ^= RCON[i / nk - 1];
        } else if nk > 6 && i % nk == 4 {
            temp = self.sub_word(temp);
        }
        [
            back[0] ^ temp[0],
            back[1] ^ temp[1],
            back[2] ^ temp[2],
            back[3] ^ temp[3],
        ]
    }

    /// The full key schedule for `key` (16 or 32 bytes).
    pub fn expand_key(&self, key: &[u8], size: KeySize) -> Vec<u8> {
        let nk = size.key_len() / 4;
        let total = size.schedule_len() / 4;
        let mut words: Vec<[u8; 4]> = key
            .chunks_exact(4)
            .take(nk)
            .map(|c| [c[0], c[1], c[2], c[3]])
            .collect();
        for i in nk..total {
            let word = self.next_word(i, nk, words[i - 1], words[i - nk]);
            words.push(word);
        }
        words.concat()
    }

    /// Checks `window` word by word against the schedule of its leading key, giving up
    /// at the first word that differs. Earlier words already matched, so they are read
    /// straight from the window.
    fn is_schedule(&self, window: &[u8], size: KeySize) -> bool {
        let key = &window[..size.key_len()];
        // all-zero and all-equal regions expand to something, but never hold a key
        if key.iter().all(|&x| x == key[0]) {
            return false;
        }
        let word = |i: usize| -> [u8; 4] {
            let w = &window[i * 4..i * 4 + 4];
            [w[0], w[1], w[2], w[3]]
        };
        let nk = size.key_len() / 4;
        (nk..size.schedule_len() / 4)
            .all(|i| self.next_word(i, nk, word(i - 1), word(i - nk)) == word(i))
    }

    /// Every offset at which a complete expanded schedule starts.
    pub fn search(&self, data: &[u8]) -> Vec<(usize, KeySize)> {
        let mut found = Vec::new();
        for size in KeySize::ALL {
            let len = size.schedule_len();
            if data.len() < len {
                continue;
            }
            for offset in 0..=data.len() - len {
                if self.is_schedule(&data[offset..offset + len], size) {
                    found.push((offset, size));
                }
            }
        }
        found.sort_by_key(|&(offset, _)| offset);
        found
    }
}

impl Default for AesKeys {
    fn default() -> Self {
        Self::new()
    }
}

impl Detector for AesKeys {
    fn name(&self) -> &str {
        "AES key"
    }

    fn safe_name(&self) -> &str {
        "aes-keys"
    }

    fn detect(&self, data: &[u8]) -> Detection {
        self.search(data)
            .into_iter()
            .map(|(offset, size)| Finding {
                description: format!(
                    "AES-{} key {} [offset {}]",
                    size.bits(),
                    data[offset..offset + size.key_len()].hex(),
                    offset
                ),
                offset,
            })
            .collect()
    }
}
