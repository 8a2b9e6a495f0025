//! Parse blk*.dat container files.
//!
//! Record layout: `[4-byte magic][4-byte LE length][length bytes of block]`. Running
//! into EOF or a foreign magic at a record boundary means "no more usable data";
//! Bitcoin Core pre-allocates these files, so a zero-filled tail is normal.

use std::fs::File;
use std::io::{self, BufReader, ErrorKind, Read};
use std::path::{Path, PathBuf};

use bitcoin::consensus::Decodable;
use bitcoin::Block;
use byteorder::{ReadBytesExt, LE};
use bytesize::ByteSize;
use log::debug;

use crate::{Error, Result};

/// Anything bigger is garbage, not a block.
const MAX_RECORD_SIZE: u32 = 32 * 1024 * 1024;

pub fn blk_filename(number: u16) -> String {
    format!("blk{:05}.dat", number)
}

/// Undoes the `xor.dat` obfuscation Bitcoin Core applies to block files.
pub struct XorReader<R> {
    inner: R,
    key: [u8; 8],
    pos: u64,
}

impl<R: Read> XorReader<R> {
    pub fn new(inner: R, key: [u8; 8]) -> Self {
        Self { inner, key, pos: 0 }
    }
}

impl<R: Read> Read for XorReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        for (i, b) in buf[..n].iter_mut().enumerate() {
            *b ^= self.key[((self.pos + i as u64) % 8) as usize];
        }
        self.pos += n as u64;
        Ok(n)
    }
}

#[derive(Debug, Clone)]
pub struct BlockRecord {
    /// Position of the record among the records of its file.
    pub index_in_file: u32,
    /// Byte offset of the block data (just past the 8-byte record header).
    pub offset: u64,
    pub block: Block,
}

/// Lazily decodes the records of one container file. Restart by opening it again.
pub struct ContainerReader {
    path: PathBuf,
    reader: BufReader<Box<dyn Read + Send>>,
    magic: [u8; 4],
    next_index: u32,
    offset: u64,
    done: bool,
}

impl ContainerReader {
    pub fn open(path: impl AsRef<Path>, magic: [u8; 4]) -> Result<Self> {
        Self::open_with_xor(path, magic, None)
    }

    pub fn open_with_xor(
        path: impl AsRef<Path>,
        magic: [u8; 4],
        xor_key: Option<[u8; 8]>,
    ) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let inner: Box<dyn Read + Send> = match xor_key {
            Some(key) => Box::new(XorReader::new(file, key)),
            None => Box::new(file),
        };
        Ok(Self {
            path: path.into(),
            reader: BufReader::new(inner),
            magic,
            next_index: 0,
            offset: 0,
            done: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn format_error(&self, reason: impl Into<String>) -> Error {
        Error::ContainerFormat {
            path: self.path.clone(),
            record: self.next_index,
            reason: reason.into(),
        }
    }

    fn read_record(&mut self) -> Result<Option<BlockRecord>> {
        let mut magic = [0_u8; 4];
        match self.reader.read_exact(&mut magic) {
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            r => r?,
        }
        if magic != self.magic {
            debug!(
                "{}: magic {} at offset {}, treating as end of data",
                self.path.display(),
                hex::encode(magic),
                self.offset
            );
            return Ok(None);
        }

        let size = match self.reader.read_u32::<LE>() {
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                return Err(self.format_error("truncated record header"))
            }
            r => r?,
        };
        if size > MAX_RECORD_SIZE {
            return Err(self.format_error(format!(
                "record length {} exceeds {}",
                ByteSize(size as u64),
                ByteSize(MAX_RECORD_SIZE as u64)
            )));
        }

        let mut data = vec![0_u8; size as usize];
        match self.reader.read_exact(&mut data) {
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                return Err(self.format_error(format!("truncated record, expected {size} bytes")))
            }
            r => r?,
        }
        let block = Block::consensus_decode_from_finite_reader(&mut data.as_slice())
            .map_err(|e| self.format_error(e.to_string()))?;

        let record = BlockRecord {
            index_in_file: self.next_index,
            offset: self.offset + 8,
            block,
        };
        self.next_index += 1;
        self.offset += 8 + size as u64;
        Ok(Some(record))
    }
}

impl Iterator for ContainerReader {
    type Item = Result<BlockRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// A directory of numbered container files.
#[derive(Debug, Clone)]
pub struct ContainerDir {
    dir: PathBuf,
    magic: [u8; 4],
    xor_key: Option<[u8; 8]>,
}

impl ContainerDir {
    pub fn new(dir: impl Into<PathBuf>, magic: [u8; 4]) -> Self {
        Self {
            dir: dir.into(),
            magic,
            xor_key: None,
        }
    }

    pub fn with_xor_key(mut self, key: Option<[u8; 8]>) -> Self {
        self.xor_key = key;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, number: u16) -> PathBuf {
        self.dir.join(blk_filename(number))
    }

    pub fn exists(&self, number: u16) -> bool {
        self.path(number).is_file()
    }

    pub fn open(&self, number: u16) -> Result<ContainerReader> {
        ContainerReader::open_with_xor(self.path(number), self.magic, self.xor_key)
    }

    /// Decodes every block of a file into memory.
    pub fn load_blocks(&self, number: u16) -> Result<Vec<Block>> {
        self.open(number)?
            .map(|x| x.map(|r| r.block))
            .collect()
    }

    /// Random access by rescanning from the start of the file.
    pub fn load_block(&self, number: u16, index: u32) -> Result<Block> {
        let mut reader = self.open(number)?;
        for record in reader.by_ref() {
            let record = record?;
            if record.index_in_file == index {
                return Ok(record.block);
            }
        }
        Err(Error::ContainerFormat {
            path: reader.path().into(),
            record: index,
            reason: "no such record".into(),
        })
    }

    /// Existing file numbers, starting at 0 and stopping at the first gap.
    pub fn files(&self) -> impl Iterator<Item = u16> + '_ {
        (0..=u16::MAX).take_while(move |&n| self.exists(n))
    }
}
