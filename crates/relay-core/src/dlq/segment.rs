// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! On-disk segment format.
//!
//! A segment is a fixed 46-byte header followed by length-prefixed
//! zstd-compressed records:
//!
//! ```text
//! offset  size  field
//! 0       6     magic "NRDQv1"
//! 6       8     record count, u64 big-endian
//! 14      32    SHA-256 over the record stream (prefixes + payloads)
//! 46      ...   records: u32 BE length, then that many compressed bytes
//! ```
//!
//! The header of the active segment carries a zero count and an all-zero
//! hash; sealing writes the real values and fsyncs. Lexicographic file
//! name order equals append order.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub const MAGIC: &[u8; 6] = b"NRDQv1";
pub const HEADER_LEN: u64 = 46;
pub const SEGMENT_SUFFIX: &str = ".dlq";

#[derive(Debug, thiserror::Error)]
pub enum SegmentError {
    #[error("segment I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bad segment magic")]
    BadMagic,

    #[error("segment hash mismatch")]
    HashMismatch,

    #[error("truncated record at offset {0}")]
    TruncatedRecord(u64),

    #[error("record failed to decompress: {0}")]
    Decompress(#[source] std::io::Error),
}

/// File name for a segment created at `timestamp`, UTC second precision.
pub fn segment_file_name(timestamp: DateTime<Utc>) -> String {
    format!("segment_{}{SEGMENT_SUFFIX}", timestamp.format("%Y%m%dT%H%M%SZ"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    pub record_count: u64,
    pub hash: [u8; 32],
}

impl SegmentHeader {
    pub fn encode(&self) -> [u8; HEADER_LEN as usize] {
        let mut buf = [0u8; HEADER_LEN as usize];
        buf[..6].copy_from_slice(MAGIC);
        buf[6..14].copy_from_slice(&self.record_count.to_be_bytes());
        buf[14..46].copy_from_slice(&self.hash);
        buf
    }

    pub fn decode(buf: &[u8; HEADER_LEN as usize]) -> Result<Self, SegmentError> {
        if &buf[..6] != MAGIC {
            return Err(SegmentError::BadMagic);
        }
        let mut count = [0u8; 8];
        count.copy_from_slice(&buf[6..14]);
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&buf[14..46]);
        Ok(Self {
            record_count: u64::from_be_bytes(count),
            hash,
        })
    }

    /// An unsealed (crash-survivor or active) header: zero count, zero hash.
    pub fn is_sealed(&self) -> bool {
        self.record_count != 0 && self.hash != [0u8; 32]
    }
}

/// Append-side handle for the active segment. Keeps a running SHA-256 of
/// the record stream so sealing never re-reads the file.
pub struct SegmentWriter {
    file: File,
    path: PathBuf,
    bytes: u64,
    records: u64,
    hasher: Sha256,
}

impl SegmentWriter {
    pub fn create(path: PathBuf) -> std::io::Result<Self> {
        let mut file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)?;
        let placeholder = SegmentHeader {
            record_count: 0,
            hash: [0u8; 32],
        };
        file.write_all(&placeholder.encode())?;
        Ok(Self {
            file,
            path,
            bytes: HEADER_LEN,
            records: 0,
            hasher: Sha256::new(),
        })
    }

    /// Compress and append one record. Returns its on-disk size.
    pub fn append(&mut self, payload: &[u8]) -> std::io::Result<u64> {
        let compressed = zstd::encode_all(payload, 0)?;
        let len = u32::try_from(compressed.len())
            .map_err(|_| std::io::Error::new(ErrorKind::InvalidInput, "record too large"))?;
        let prefix = len.to_be_bytes();

        self.file.write_all(&prefix)?;
        self.file.write_all(&compressed)?;
        self.hasher.update(prefix);
        self.hasher.update(&compressed);

        let disk_len = 4 + compressed.len() as u64;
        self.bytes += disk_len;
        self.records += 1;
        Ok(disk_len)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Finalise the header and fsync. The segment becomes verifiable and
    /// replayable. Must not be called on an empty segment; use `discard`.
    pub fn seal(mut self) -> std::io::Result<PathBuf> {
        let header = SegmentHeader {
            record_count: self.records,
            hash: self.hasher.finalize().into(),
        };
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&header.encode())?;
        self.file.sync_all()?;
        Ok(self.path)
    }

    /// Remove an active segment that never received a record.
    pub fn discard(self) -> std::io::Result<()> {
        drop(self.file);
        std::fs::remove_file(&self.path)
    }
}

/// One decompressed record plus its on-disk footprint, which is what the
/// replay token bucket charges for.
pub struct RecordRead {
    pub payload: Vec<u8>,
    pub disk_len: u64,
}

/// Sequential reader over a sealed segment.
pub struct SegmentReader {
    reader: BufReader<File>,
    offset: u64,
}

impl SegmentReader {
    pub fn open(path: &Path) -> Result<(Self, SegmentHeader), SegmentError> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        let mut buf = [0u8; HEADER_LEN as usize];
        reader
            .read_exact(&mut buf)
            .map_err(|_| SegmentError::TruncatedRecord(0))?;
        let header = SegmentHeader::decode(&buf)?;
        Ok((
            Self {
                reader,
                offset: HEADER_LEN,
            },
            header,
        ))
    }

    /// Next record, or `None` at a clean end of file.
    pub fn next_record(&mut self) -> Result<Option<RecordRead>, SegmentError> {
        let mut prefix = [0u8; 4];
        match self.reader.read_exact(&mut prefix) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(SegmentError::Io(e)),
        }
        let len = u32::from_be_bytes(prefix) as usize;
        let mut compressed = vec![0u8; len];
        self.reader
            .read_exact(&mut compressed)
            .map_err(|_| SegmentError::TruncatedRecord(self.offset))?;

        let payload = zstd::decode_all(compressed.as_slice()).map_err(SegmentError::Decompress)?;
        self.offset += 4 + len as u64;
        Ok(Some(RecordRead {
            payload,
            disk_len: 4 + len as u64,
        }))
    }
}

/// Recompute the stream hash of a sealed segment and compare it with the
/// header. Reads sequentially; does not decompress.
pub fn verify(path: &Path) -> Result<(), SegmentError> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut buf = [0u8; HEADER_LEN as usize];
    reader
        .read_exact(&mut buf)
        .map_err(|_| SegmentError::TruncatedRecord(0))?;
    let header = SegmentHeader::decode(&buf)?;

    let mut hasher = Sha256::new();
    std::io::copy(&mut reader, &mut hasher)?;
    let computed: [u8; 32] = hasher.finalize().into();
    if computed != header.hash {
        return Err(SegmentError::HashMismatch);
    }
    Ok(())
}

/// Result of resealing an unsealed crash survivor.
pub enum RecoverOutcome {
    /// The segment was resealed in place with `records` parseable records.
    /// `truncated` is true when a partial tail record was discarded.
    Sealed { records: u64, truncated: bool },
    /// No parseable records survived; the file was removed.
    Removed,
}

/// Scan an unsealed segment, drop any partial tail record, and write the
/// true header. The record stream is walked by length prefix only; hash
/// covers exactly the retained bytes.
pub fn recover(path: &Path) -> Result<RecoverOutcome, SegmentError> {
    let mut file = OpenOptions::new().read(true).write(true).open(path)?;
    let file_len = file.metadata()?.len();

    let mut header_buf = [0u8; HEADER_LEN as usize];
    file.read_exact(&mut header_buf)
        .map_err(|_| SegmentError::TruncatedRecord(0))?;
    SegmentHeader::decode(&header_buf)?;

    let mut hasher = Sha256::new();
    let mut records: u64 = 0;
    let mut boundary: u64 = HEADER_LEN;

    loop {
        let mut prefix = [0u8; 4];
        match file.read_exact(&mut prefix) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(SegmentError::Io(e)),
        }
        let len = u64::from(u32::from_be_bytes(prefix));
        if boundary + 4 + len > file_len {
            break;
        }
        let mut payload = vec![0u8; len as usize];
        file.read_exact(&mut payload)?;
        hasher.update(prefix);
        hasher.update(&payload);
        records += 1;
        boundary += 4 + len;
    }

    if records == 0 {
        drop(file);
        std::fs::remove_file(path)?;
        return Ok(RecoverOutcome::Removed);
    }

    let truncated = boundary < file_len;
    file.set_len(boundary)?;
    let header = SegmentHeader {
        record_count: records,
        hash: hasher.finalize().into(),
    };
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&header.encode())?;
    file.sync_all()?;
    Ok(RecoverOutcome::Sealed { records, truncated })
}
