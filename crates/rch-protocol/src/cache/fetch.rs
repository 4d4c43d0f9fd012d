//! Fetch response framing: metadata block followed by payload.

use std::io::{Read, Write};

use super::store::write_payload;
use super::{
    read_metadata_and_payload, write_len, ArtifactInfo, ByteSource, DecodedArtifact,
    MetadataHeader, WriteResult, MAX_METADATA_HEADER_SIZE,
};
use crate::error::ProtocolError;

/// An artifact as served by the cache in answer to a fetch.
pub struct FetchResponse<'a, S: ByteSource + ?Sized> {
    prefix: Vec<u8>,
    header: MetadataHeader,
    payload: &'a S,
}

impl<'a, S: ByteSource + ?Sized> FetchResponse<'a, S> {
    /// Prepare a response with the default metadata bound.
    pub fn new(info: &ArtifactInfo, payload: &'a S) -> Result<Self, ProtocolError> {
        Self::with_limit(info, payload, MAX_METADATA_HEADER_SIZE)
    }

    /// Prepare a response with an explicit metadata bound.
    pub fn with_limit(
        info: &ArtifactInfo,
        payload: &'a S,
        max_metadata_size: usize,
    ) -> Result<Self, ProtocolError> {
        let header = MetadataHeader::create(info, payload, max_metadata_size)?;
        let mut prefix = Vec::with_capacity(4 + header.bytes.len());
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

    /// Total body length.
    pub fn content_length(&self) -> u64 {
        self.prefix.len() as u64 + self.header.payload_len
    }

    /// Write the full body.
    pub fn write<W: Write>(&self, mut out: W) -> Result<WriteResult, ProtocolError> {
        out.write_all(&self.prefix)?;
        let result = write_payload(&self.header, self.payload, &mut out)?;
        out.flush()?;
        Ok(result)
    }
}

/// Parse a fetch response body, copying the payload into `sink`.
///
/// A checksum mismatch is not an error here; compare
/// [`DecodedArtifact::expected_checksum`] with
/// [`DecodedArtifact::actual_checksum`] and decide.
pub fn read_fetch_response<R: Read, W: Write>(
    reader: R,
    sink: W,
) -> Result<DecodedArtifact, ProtocolError> {
    read_fetch_response_with_limit(reader, sink, MAX_METADATA_HEADER_SIZE)
}

/// Like [`read_fetch_response`] with a tighter metadata bound.
pub fn read_fetch_response_with_limit<R: Read, W: Write>(
    mut reader: R,
    mut sink: W,
    max_metadata_size: usize,
) -> Result<DecodedArtifact, ProtocolError> {
    let max = max_metadata_size.min(MAX_METADATA_HEADER_SIZE);
    read_metadata_and_payload(&mut reader, &mut sink, max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::hash::ContentHash;
    use std::io;

    fn sample() -> (ArtifactInfo, Vec<u8>) {
        let info = ArtifactInfo::new()
            .with_rule_key("abc")
            .with_metadata("TARGET", "//x:y");
        (info, b"0123456789".to_vec())
    }

    fn encode(info: &ArtifactInfo, payload: &Vec<u8>) -> Vec<u8> {
        let response = FetchResponse::new(info, payload).unwrap();
        let mut body = Vec::new();
        response.write(&mut body).unwrap();
        assert_eq!(body.len() as u64, response.content_length());
        body
    }

    #[test]
    fn test_fetch_round_trip() {
        let (info, payload) = sample();
        let body = encode(&info, &payload);

        let mut out = Vec::new();
        let decoded = read_fetch_response(&body[..], &mut out).unwrap();
        assert_eq!(decoded.rule_keys, info.rule_keys);
        assert_eq!(decoded.metadata, info.metadata);
        assert_eq!(out, payload);
        assert_eq!(decoded.expected_checksum, decoded.actual_checksum);
        assert!(decoded.is_intact());
        assert_eq!(decoded.artifact_size_bytes, 10);
        assert_eq!(decoded.artifact_sha256, ContentHash::of_bytes(&payload));
    }

    #[test]
    fn test_fetch_empty_payload() {
        let info = ArtifactInfo::new();
        let body = encode(&info, &Vec::new());

        let mut out = Vec::new();
        let decoded = read_fetch_response(&body[..], &mut out).unwrap();
        assert!(out.is_empty());
        assert!(decoded.is_intact());
        assert!(decoded.rule_keys.is_empty());
    }

    #[test]
    fn test_fetch_payload_flip_changes_checksum() {
        let (info, payload) = sample();
        let mut body = encode(&info, &payload);
        let last = body.len() - 1;
        body[last] ^= 0x01;

        let decoded = read_fetch_response(&body[..], io::sink()).unwrap();
        assert!(!decoded.is_intact());
    }

    #[test]
    fn test_fetch_metadata_value_flip_changes_checksum() {
        let (info, payload) = sample();
        let mut body = encode(&info, &payload);
        let pos = body
            .windows(5)
            .position(|w| w == b"//x:y")
            .unwrap();
        body[pos + 2] = b'z';

        let decoded = read_fetch_response(&body[..], io::sink()).unwrap();
        assert_eq!(decoded.metadata["TARGET"], "//z:y");
        assert_ne!(decoded.expected_checksum, decoded.actual_checksum);
    }

    #[test]
    fn test_fetch_rejects_oversized_header_before_reading() {
        // Length field only; no metadata bytes follow.
        let body = i32::MAX.to_be_bytes();
        let err = read_fetch_response(&body[..], io::sink()).unwrap_err();
        assert!(matches!(err, ProtocolError::MetadataTooLarge { .. }));
        assert_eq!(err.kind(), ErrorKind::Format);
    }

    #[test]
    fn test_fetch_respects_tighter_limit() {
        let (info, payload) = sample();
        let body = encode(&info, &payload);
        let err = read_fetch_response_with_limit(&body[..], io::sink(), 8).unwrap_err();
        assert!(matches!(err, ProtocolError::MetadataTooLarge { max: 8, .. }));
    }

    #[test]
    fn test_fetch_truncated_metadata_is_io_error() {
        let (info, payload) = sample();
        let body = encode(&info, &payload);
        let err = read_fetch_response(&body[..10], io::sink()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
    }

    #[test]
    fn test_fetch_negative_length() {
        let body = (-1i32).to_be_bytes();
        let err = read_fetch_response(&body[..], io::sink()).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidLength { field: "metadata", .. }));
    }
}
