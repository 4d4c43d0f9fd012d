//! Store request framing: rule key prefix, metadata block, payload.

use std::collections::BTreeSet;
use std::io::{Read, Write};

use super::{
    copy_hashed, read_i32, read_metadata_and_payload, read_utf, write_len, write_utf,
    ArtifactInfo, ByteSource, DecodedArtifact, MetadataHeader, RuleKey, WriteResult,
    MAX_METADATA_HEADER_SIZE,
};
use crate::checksum::Crc32;
use crate::error::ProtocolError;

/// An artifact ready to be uploaded to the cache.
///
/// Construction streams the payload once to compute the checksum; `write`
/// streams it again onto the wire.
pub struct StoreRequest<'a, S: ByteSource + ?Sized> {
    prefix: Vec<u8>,
    header: MetadataHeader,
    payload: &'a S,
}

impl<'a, S: ByteSource + ?Sized> StoreRequest<'a, S> {
    /// Prepare a store request with the default metadata bound.
    pub fn new(info: &ArtifactInfo, payload: &'a S) -> Result<Self, ProtocolError> {
        Self::with_limit(info, payload, MAX_METADATA_HEADER_SIZE)
    }

    /// Prepare a store request with an explicit metadata bound.
    pub fn with_limit(
        info: &ArtifactInfo,
        payload: &'a S,
        max_metadata_size: usize,
    ) -> Result<Self, ProtocolError> {
        let header = MetadataHeader::create(info, payload, max_metadata_size)?;

        let mut prefix = Vec::new();
        write_len(&mut prefix, info.rule_keys.len(), "rule key count")?;
        for key in &info.rule_keys {
            write_utf(&mut prefix, key.as_str())?;
        }
        write_len(&mut prefix, header.bytes.len(), "metadata")?;
        prefix.extend_from_slice(&header.bytes);

        Ok(Self {
            prefix,
            header,
            payload,
        })
    }

    /// Everything sent before the payload bytes.
    pub fn header_bytes(&self) -> &[u8] {
        &self.prefix
    }

    /// Total body length, for the transport's Content-Length.
    pub fn content_length(&self) -> u64 {
        self.prefix.len() as u64 + self.header.payload_len
    }

    /// Checksum embedded in the metadata.
    pub fn checksum(&self) -> u32 {
        self.header.checksum
    }

    /// Write the full body.
    pub fn write<W: Write>(&self, mut out: W) -> Result<WriteResult, ProtocolError> {
        out.write_all(&self.prefix)?;
        let result = write_payload(&self.header, self.payload, &mut out)?;
        out.flush()?;
        Ok(result)
    }
}

/// Stream the payload a second time and confirm it is what was hashed.
pub(super) fn write_payload<S: ByteSource + ?Sized, W: Write>(
    header: &MetadataHeader,
    payload: &S,
    out: &mut W,
) -> Result<WriteResult, ProtocolError> {
    let mut ignored = Crc32::new();
    let (written, sha) = copy_hashed(&mut payload.open()?, &mut ignored, out)?;
    if written != header.payload_len || sha != header.payload_sha256 {
        return Err(ProtocolError::PayloadChanged {
            expected_len: header.payload_len,
            actual_len: written,
        });
    }
    Ok(WriteResult {
        checksum: header.checksum,
        artifact_size_bytes: written,
        artifact_sha256: sha,
    })
}

/// A store request as received by the cache server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreReadResult {
    /// Rule keys from the request prefix.
    pub rule_keys: BTreeSet<RuleKey>,
    /// Metadata and payload details.
    pub artifact: DecodedArtifact,
}

/// Parse a store request body, copying the payload into `sink`.
pub fn read_store_request<R: Read, W: Write>(
    reader: R,
    sink: W,
) -> Result<StoreReadResult, ProtocolError> {
    read_store_request_with_limit(reader, sink, MAX_METADATA_HEADER_SIZE)
}

/// Parse a store request body, rejecting metadata longer than
/// `max_metadata_size`.
pub fn read_store_request_with_limit<R: Read, W: Write>(
    mut reader: R,
    mut sink: W,
    max_metadata_size: usize,
) -> Result<StoreReadResult, ProtocolError> {
    let count = read_i32(&mut reader)?;
    if count < 0 {
        return Err(ProtocolError::InvalidLength {
            field: "rule key count",
            value: i64::from(count),
        });
    }
    let mut rule_keys = BTreeSet::new();
    for _ in 0..count {
        rule_keys.insert(RuleKey::new(read_utf(&mut reader, "rule key")?));
    }

    let artifact = read_metadata_and_payload(&mut reader, &mut sink, max_metadata_size)?;
    Ok(StoreReadResult {
        rule_keys,
        artifact,
    })
}
