//! Binary artifact cache wire format.
//!
//! A store request body is
//! `[ruleKeyCount:i32][ruleKey:utf]* [metadataLen:i32][metadata][payload]`
//! and a fetch response body is `[metadataLen:i32][metadata][payload]`.
//!
//! The metadata block is
//! `[ruleKeyCount:i32][ruleKey:utf]* [entryCount:i32]([key:utf][valueLen:i32][value])* [crc32:4]`.
//! The trailing CRC-32 covers every metadata byte before it followed by every
//! payload byte. Integers are big-endian; `utf` is a u16 big-endian byte
//! length followed by UTF-8 bytes.
//!
//! Payloads are never buffered: they are streamed once to compute the
//! checksum and once more when transmitted. Decoding never verifies on its
//! own; it reports both the embedded and the recomputed checksum.

mod fetch;
mod store;

pub use fetch::{read_fetch_response, read_fetch_response_with_limit, FetchResponse};
pub use store::{read_store_request, read_store_request_with_limit, StoreReadResult, StoreRequest};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use crate::checksum::{Crc32, CHECKSUM_LEN};
use crate::error::ProtocolError;
use crate::hash::ContentHash;

/// Upper bound on the metadata block, checked before any buffer is allocated.
pub const MAX_METADATA_HEADER_SIZE: usize = 64 * 1024 * 1024;

const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Content-derived identifier of a build rule's inputs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleKey(String);

impl RuleKey {
    /// Wrap an opaque rule key string.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The key as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RuleKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

/// Rule keys and metadata describing one cached artifact.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactInfo {
    /// Rule keys the artifact is stored under.
    pub rule_keys: BTreeSet<RuleKey>,
    /// Arbitrary string metadata.
    pub metadata: BTreeMap<String, String>,
}

impl ArtifactInfo {
    /// Create an empty artifact description.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a rule key.
    pub fn with_rule_key(mut self, key: impl Into<RuleKey>) -> Self {
        self.rule_keys.insert(key.into());
        self
    }

    /// Add a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// A payload that can be read more than once.
pub trait ByteSource {
    /// Open a fresh reader positioned at the start of the payload.
    fn open(&self) -> io::Result<Box<dyn Read + '_>>;
}

impl ByteSource for [u8] {
    fn open(&self) -> io::Result<Box<dyn Read + '_>> {
        Ok(Box::new(self))
    }
}

impl ByteSource for Vec<u8> {
    fn open(&self) -> io::Result<Box<dyn Read + '_>> {
        Ok(Box::new(self.as_slice()))
    }
}

impl ByteSource for Path {
    fn open(&self) -> io::Result<Box<dyn Read + '_>> {
        Ok(Box::new(BufReader::new(File::open(self)?)))
    }
}

impl ByteSource for PathBuf {
    fn open(&self) -> io::Result<Box<dyn Read + '_>> {
        self.as_path().open()
    }
}

/// Encoded metadata block plus what was learned about the payload while
/// computing its checksum.
#[derive(Debug, Clone)]
pub struct MetadataHeader {
    /// Metadata bytes including the trailing checksum.
    pub bytes: Vec<u8>,
    /// CRC-32 over metadata and payload.
    pub checksum: u32,
    /// Payload length in bytes.
    pub payload_len: u64,
    /// SHA-256 of the payload alone.
    pub payload_sha256: ContentHash,
}

impl MetadataHeader {
    /// Build the metadata block for `info`, streaming `payload` once.
    pub fn create<S: ByteSource + ?Sized>(
        info: &ArtifactInfo,
        payload: &S,
        max_size: usize,
    ) -> Result<Self, ProtocolError> {
        let mut raw = Vec::new();
        write_len(&mut raw, info.rule_keys.len(), "rule key count")?;
        for key in &info.rule_keys {
            write_utf(&mut raw, key.as_str())?;
        }
        check_metadata_size(raw.len(), max_size)?;

        write_len(&mut raw, info.metadata.len(), "metadata entry count")?;
        for (key, value) in &info.metadata {
            write_utf(&mut raw, key)?;
            write_len(&mut raw, value.len(), "metadata value")?;
            raw.extend_from_slice(value.as_bytes());
            check_metadata_size(raw.len(), max_size)?;
        }

        let mut crc = Crc32::new();
        crc.update(&raw);
        let (payload_len, payload_sha256) =
            copy_hashed(&mut payload.open()?, &mut crc, &mut io::sink())?;

        let checksum = crc.value();
        raw.extend_from_slice(&checksum.to_be_bytes());
        check_metadata_size(raw.len(), max_size)?;

        Ok(Self {
            bytes: raw,
            checksum,
            payload_len,
            payload_sha256,
        })
    }
}

/// Outcome of transmitting a request or response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteResult {
    /// Checksum embedded in the metadata.
    pub checksum: u32,
    /// Payload bytes written.
    pub artifact_size_bytes: u64,
    /// SHA-256 of the payload bytes written.
    pub artifact_sha256: ContentHash,
}

/// Everything recovered from a metadata block and the payload after it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedArtifact {
    /// Rule keys stored in the metadata.
    pub rule_keys: BTreeSet<RuleKey>,
    /// Metadata entries.
    pub metadata: BTreeMap<String, String>,
    /// Checksum carried on the wire.
    pub expected_checksum: u32,
    /// Checksum recomputed over the bytes actually received.
    pub actual_checksum: u32,
    /// SHA-256 of the payload bytes alone.
    pub artifact_sha256: ContentHash,
    /// Number of payload bytes copied to the sink.
    pub artifact_size_bytes: u64,
}

impl DecodedArtifact {
    /// Whether the recomputed checksum matches the embedded one.
    pub fn is_intact(&self) -> bool {
        self.expected_checksum == self.actual_checksum
    }
}

/// Read `[metadataLen][metadata][payload]`, copying the payload to `sink`.
pub(crate) fn read_metadata_and_payload<R: Read, W: Write>(
    reader: &mut R,
    sink: &mut W,
    max_size: usize,
) -> Result<DecodedArtifact, ProtocolError> {
    let declared = read_i32(reader)?;
    if declared < CHECKSUM_LEN as i32 {
        return Err(ProtocolError::InvalidLength {
            field: "metadata",
            value: i64::from(declared),
        });
    }
    let metadata_len = declared as usize;
    check_metadata_size(metadata_len, max_size)?;

    let mut block = vec![0u8; metadata_len];
    reader.read_exact(&mut block)?;

    let (body, checksum_bytes) = block.split_at(metadata_len - CHECKSUM_LEN);
    let (rule_keys, metadata) = parse_metadata(body)?;
    let mut expected = [0u8; CHECKSUM_LEN];
    expected.copy_from_slice(checksum_bytes);

    let mut crc = Crc32::new();
    crc.update(body);
    let (artifact_size_bytes, artifact_sha256) = copy_hashed(reader, &mut crc, sink)?;

    Ok(DecodedArtifact {
        rule_keys,
        metadata,
        expected_checksum: u32::from_be_bytes(expected),
        actual_checksum: crc.value(),
        artifact_sha256,
        artifact_size_bytes,
    })
}

fn parse_metadata(
    body: &[u8],
) -> Result<(BTreeSet<RuleKey>, BTreeMap<String, String>), ProtocolError> {
    let mut reader = SliceReader { buf: body };

    let key_count = reader.read_count("rule key count")?;
    let mut rule_keys = BTreeSet::new();
    for _ in 0..key_count {
        rule_keys.insert(RuleKey::new(reader.read_utf("rule key")?));
    }

    let entry_count = reader.read_count("metadata entry count")?;
    let mut metadata = BTreeMap::new();
    for _ in 0..entry_count {
        let key = reader.read_utf("metadata key")?;
        let value_len = reader.read_count("metadata value")?;
        let value = reader.take(value_len)?;
        let value = String::from_utf8(value.to_vec())
            .map_err(|_| ProtocolError::InvalidUtf8 { field: "metadata value" })?;
        metadata.insert(key, value);
    }

    if !reader.buf.is_empty() {
        return Err(ProtocolError::MalformedMetadata(format!(
            "{} trailing bytes",
            reader.buf.len()
        )));
    }
    Ok((rule_keys, metadata))
}

/// Cursor over an in-memory metadata block. Running past the end is a
/// format error rather than an I/O error.
struct SliceReader<'a> {
    buf: &'a [u8],
}

impl<'a> SliceReader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        if n > self.buf.len() {
            return Err(ProtocolError::MalformedMetadata(format!(
                "needed {} bytes, {} left",
                n,
                self.buf.len()
            )));
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn read_count(&mut self, field: &'static str) -> Result<usize, ProtocolError> {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(self.take(4)?);
        let value = i32::from_be_bytes(bytes);
        if value < 0 {
            return Err(ProtocolError::InvalidLength {
                field,
                value: i64::from(value),
            });
        }
        Ok(value as usize)
    }

    fn read_utf(&mut self, field: &'static str) -> Result<String, ProtocolError> {
        let mut len = [0u8; 2];
        len.copy_from_slice(self.take(2)?);
        let bytes = self.take(usize::from(u16::from_be_bytes(len)))?;
        String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::InvalidUtf8 { field })
    }
}

fn check_metadata_size(size: usize, max_size: usize) -> Result<(), ProtocolError> {
    if size > max_size {
        return Err(ProtocolError::MetadataTooLarge {
            size: size as u64,
            max: max_size as u64,
        });
    }
    Ok(())
}

/// Copy `reader` to `sink`, feeding every byte to `crc` and to a payload-only SHA-256.
fn copy_hashed<R: Read + ?Sized, W: Write + ?Sized>(
    reader: &mut R,
    crc: &mut Crc32,
    sink: &mut W,
) -> io::Result<(u64, ContentHash)> {
    let mut sha = Sha256::new();
    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        crc.update(&buffer[..n]);
        sha.update(&buffer[..n]);
        sink.write_all(&buffer[..n])?;
        total += n as u64;
    }
    Ok((total, ContentHash::from_digest(sha)))
}

pub(crate) fn read_i32<R: Read + ?Sized>(reader: &mut R) -> io::Result<i32> {
    let mut bytes = [0u8; 4];
    reader.read_exact(&mut bytes)?;
    Ok(i32::from_be_bytes(bytes))
}

pub(crate) fn read_utf<R: Read + ?Sized>(
    reader: &mut R,
    field: &'static str,
) -> Result<String, ProtocolError> {
    let mut len = [0u8; 2];
    reader.read_exact(&mut len)?;
    let mut bytes = vec![0u8; usize::from(u16::from_be_bytes(len))];
    reader.read_exact(&mut bytes)?;
    String::from_utf8(bytes).map_err(|_| ProtocolError::InvalidUtf8 { field })
}

pub(crate) fn write_len(
    out: &mut Vec<u8>,
    len: usize,
    field: &'static str,
) -> Result<(), ProtocolError> {
    let value = i32::try_from(len).map_err(|_| ProtocolError::InvalidLength {
        field,
        value: len as i64,
    })?;
    out.extend_from_slice(&value.to_be_bytes());
    Ok(())
}

pub(crate) fn write_utf(out: &mut Vec<u8>, value: &str) -> Result<(), ProtocolError> {
    let len = u16::try_from(value.len())
        .map_err(|_| ProtocolError::StringTooLong { len: value.len() })?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(value.as_bytes());
    Ok(())
}
