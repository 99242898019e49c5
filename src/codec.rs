//! DataChannel codec: content-type dispatch, PTY gzip framing, and file
//! transfer chunking/reassembly.
//!
//! Wire shape, after Olm decryption of a binary DataChannel frame:
//! ```text
//! [content_type:1][content-specific body...]
//! ```
//! `content_type` is one of the `CONTENT_*` constants in
//! [`crate::crypto_bridge`]. This module only ever sees plaintext; Olm
//! framing is the caller's job via [`crate::CryptoBridge`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::channel::compression;
use crate::crypto_bridge::{CONTENT_FILE, CONTENT_FILE_CHUNK, CONTENT_MSG, CONTENT_PTY, CONTENT_STREAM};
use crate::error::TransportError;
use crate::stream_mux::StreamFrame;

/// PTY payload flag bit: the payload is gzip-compressed.
pub const PTY_FLAG_GZIP: u8 = 0x01;
/// PTY payload flag bit: browser-to-hub direction (set on outbound frames
/// this side originates).
pub const PTY_FLAG_OUTBOUND: u8 = 0x02;

/// File-chunk flag bit: this is the first fragment of a transfer and
/// carries the original file header prepended to its data slice.
pub const FILE_CHUNK_FLAG_FIRST: u8 = 0x01;
/// File-chunk flag bit: this is the last fragment of a transfer.
pub const FILE_CHUNK_FLAG_LAST: u8 = 0x02;

/// How long an incomplete file transfer is kept before being dropped.
/// Not a spec invariant — `transferId` reuse across distinct transfers is
/// the hazard this guards against on an otherwise unbounded receive side.
const FILE_TRANSFER_TTL: Duration = Duration::from_secs(60);

/// Decoded plaintext content, dispatched by content type.
#[derive(Debug, Clone)]
pub enum InboundContent {
    /// `CONTENT_MSG`: JSON control message bytes.
    Control(Vec<u8>),
    /// `CONTENT_PTY`: decompressed PTY I/O bytes for one subscription.
    Pty {
        /// The PTY subscription id this payload belongs to.
        sub_id: String,
        /// Decompressed payload bytes.
        bytes: Vec<u8>,
    },
    /// `CONTENT_STREAM`: a stream-multiplexer sub-frame.
    Stream(StreamFrame),
    /// `CONTENT_FILE`: a complete, atomically-sent file.
    File {
        /// Owning subscription id.
        sub_id: String,
        /// Original filename.
        name: String,
        /// File bytes.
        bytes: Vec<u8>,
    },
    /// A `CONTENT_FILE_CHUNK` stream is still being reassembled; nothing
    /// to deliver yet.
    Pending,
    /// A `CONTENT_FILE_CHUNK` stream completed reassembly into a whole file.
    FileReassembled {
        /// Owning subscription id.
        sub_id: String,
        /// Original filename.
        name: String,
        /// Reassembled file bytes.
        bytes: Vec<u8>,
    },
}

/// Receive-side reassembly state for a chunked file transfer.
struct PendingFileTransfer {
    sub_id: String,
    name: String,
    payload: Vec<u8>,
    started_at: Instant,
}

/// Build the `[sub_id_len:1][sub_id][filename_len:2 LE][filename]` header
/// shared by the atomic and first-chunk file frames.
fn build_file_header(sub_id: &str, filename: &str) -> Vec<u8> {
    let sub_id_bytes = sub_id.as_bytes();
    let filename_bytes = filename.as_bytes();
    let mut out = Vec::with_capacity(1 + sub_id_bytes.len() + 2 + filename_bytes.len());
    out.push(sub_id_bytes.len() as u8);
    out.extend_from_slice(sub_id_bytes);
    out.extend_from_slice(&(filename_bytes.len() as u16).to_le_bytes());
    out.extend_from_slice(filename_bytes);
    out
}

fn parse_file_header(body: &[u8]) -> Result<(String, String, &[u8]), TransportError> {
    let Some((&sub_id_len, rest)) = body.split_first() else {
        return Err(TransportError::UnknownContentType(CONTENT_FILE));
    };
    let sub_id_len = sub_id_len as usize;
    if rest.len() < sub_id_len + 2 {
        return Err(TransportError::UnknownContentType(CONTENT_FILE));
    }
    let sub_id = String::from_utf8_lossy(&rest[..sub_id_len]).to_string();
    let rest = &rest[sub_id_len..];
    let filename_len = u16::from_le_bytes([rest[0], rest[1]]) as usize;
    let rest = &rest[2..];
    if rest.len() < filename_len {
        return Err(TransportError::UnknownContentType(CONTENT_FILE));
    }
    let filename = String::from_utf8_lossy(&rest[..filename_len]).to_string();
    Ok((sub_id, filename, &rest[filename_len..]))
}

/// Encodes outbound plaintext frames and decodes/reassembles inbound
/// ones. One instance per hub; holds in-flight file reassembly state.
#[derive(Default)]
pub struct DataChannelCodec {
    pending_files: Mutex<HashMap<u8, PendingFileTransfer>>,
    pty_compression_threshold: usize,
}

impl std::fmt::Debug for DataChannelCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataChannelCodec").finish_non_exhaustive()
    }
}

impl DataChannelCodec {
    /// Create a codec that gzip-compresses outbound PTY payloads at or
    /// above `pty_compression_threshold` bytes.
    #[must_use]
    pub fn new(pty_compression_threshold: usize) -> Self {
        Self {
            pending_files: Mutex::new(HashMap::new()),
            pty_compression_threshold,
        }
    }

    /// Build the plaintext `[CONTENT_MSG][json]` frame.
    #[must_use]
    pub fn encode_control(json: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + json.len());
        out.push(CONTENT_MSG);
        out.extend_from_slice(json);
        out
    }

    /// Build the plaintext `[CONTENT_PTY][flags][sub_id_len][sub_id][payload]`
    /// frame, gzip-compressing when `payload` is at or above this codec's
    /// threshold. Always sets the outbound direction bit, since this side
    /// only ever originates PTY frames toward the hub.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::EncryptionFailed` if gzip encoding fails.
    pub fn encode_pty(&self, sub_id: &str, payload: &[u8]) -> Result<Vec<u8>, TransportError> {
        let (body, compressed) = compression::maybe_compress(payload, self.pty_compression_threshold)?;
        let mut flags = PTY_FLAG_OUTBOUND;
        if compressed {
            flags |= PTY_FLAG_GZIP;
        }
        let sub_id_bytes = sub_id.as_bytes();
        let mut out = Vec::with_capacity(3 + sub_id_bytes.len() + body.len());
        out.push(CONTENT_PTY);
        out.push(flags);
        out.push(sub_id_bytes.len() as u8);
        out.extend_from_slice(sub_id_bytes);
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Build the plaintext `[CONTENT_STREAM][frame...]` envelope around a
    /// stream-multiplexer sub-frame.
    #[must_use]
    pub fn encode_stream(frame: &StreamFrame) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + 3 + frame.payload.len());
        out.push(CONTENT_STREAM);
        out.extend_from_slice(&frame.to_bytes());
        out
    }

    /// Build the plaintext `[CONTENT_FILE][sub_id_len][sub_id][filename_len:2 LE]
    /// [filename][bytes]` frame, for files small enough to send atomically.
    #[must_use]
    pub fn encode_file(sub_id: &str, filename: &str, bytes: &[u8]) -> Vec<u8> {
        let header = build_file_header(sub_id, filename);
        let mut out = Vec::with_capacity(1 + header.len() + bytes.len());
        out.push(CONTENT_FILE);
        out.extend_from_slice(&header);
        out.extend_from_slice(bytes);
        out
    }

    /// Split a file into `[CONTENT_FILE_CHUNK][transfer_id][flags][payload]`
    /// fragments that each stay within `chunk_limit` plaintext bytes.
    ///
    /// The first fragment carries the file header (`sub_id`, `filename`)
    /// prepended to its data slice and sets `FILE_CHUNK_FLAG_FIRST`; the
    /// last fragment sets `FILE_CHUNK_FLAG_LAST` (a single-fragment
    /// transfer sets both). Fragments are produced in send order; this
    /// side relies on the DataChannel being ordered and performs no
    /// receive-side reordering.
    #[must_use]
    pub fn encode_file_chunks(
        transfer_id: u8,
        sub_id: &str,
        filename: &str,
        bytes: &[u8],
        chunk_limit: usize,
    ) -> Vec<Vec<u8>> {
        const FRAME_OVERHEAD: usize = 3; // content_type + transfer_id + flags
        let header = build_file_header(sub_id, filename);
        let first_capacity = chunk_limit.saturating_sub(FRAME_OVERHEAD + header.len()).max(1);
        let rest_capacity = chunk_limit.saturating_sub(FRAME_OVERHEAD).max(1);

        if bytes.is_empty() {
            return vec![Self::build_chunk_frame(
                transfer_id,
                FILE_CHUNK_FLAG_FIRST | FILE_CHUNK_FLAG_LAST,
                &header,
            )];
        }

        let mut fragments = Vec::new();
        let (first, rest) = bytes.split_at(bytes.len().min(first_capacity));
        let mut first_payload = header.clone();
        first_payload.extend_from_slice(first);
        fragments.push(first_payload);
        for chunk in rest.chunks(rest_capacity) {
            fragments.push(chunk.to_vec());
        }

        let last_index = fragments.len() - 1;
        fragments
            .into_iter()
            .enumerate()
            .map(|(index, payload)| {
                let mut flags = 0;
                if index == 0 {
                    flags |= FILE_CHUNK_FLAG_FIRST;
                }
                if index == last_index {
                    flags |= FILE_CHUNK_FLAG_LAST;
                }
                Self::build_chunk_frame(transfer_id, flags, &payload)
            })
            .collect()
    }

    fn build_chunk_frame(transfer_id: u8, flags: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(3 + payload.len());
        out.push(CONTENT_FILE_CHUNK);
        out.push(transfer_id);
        out.push(flags);
        out.extend_from_slice(payload);
        out
    }

    /// Dispatch a decrypted plaintext frame by its content-type byte.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::UnknownContentType` for an unrecognized
    /// content type byte or a malformed frame for a known one.
    pub async fn decode(&self, plaintext: &[u8]) -> Result<InboundContent, TransportError> {
        let Some((&content_type, body)) = plaintext.split_first() else {
            return Err(TransportError::UnknownContentType(0));
        };

        match content_type {
            CONTENT_MSG => Ok(InboundContent::Control(body.to_vec())),
            CONTENT_PTY => Self::decode_pty(body),
            CONTENT_STREAM => StreamFrame::from_bytes(body).map(InboundContent::Stream),
            CONTENT_FILE => Self::decode_file(body),
            CONTENT_FILE_CHUNK => self.decode_file_chunk(body).await,
            other => Err(TransportError::UnknownContentType(other)),
        }
    }

    fn decode_pty(body: &[u8]) -> Result<InboundContent, TransportError> {
        let Some((&flags, rest)) = body.split_first() else {
            return Err(TransportError::UnknownContentType(CONTENT_PTY));
        };
        let Some((&sub_id_len, rest)) = rest.split_first() else {
            return Err(TransportError::UnknownContentType(CONTENT_PTY));
        };
        let sub_id_len = sub_id_len as usize;
        if rest.len() < sub_id_len {
            return Err(TransportError::UnknownContentType(CONTENT_PTY));
        }
        let sub_id = String::from_utf8_lossy(&rest[..sub_id_len]).to_string();
        let payload = &rest[sub_id_len..];
        let compressed = flags & PTY_FLAG_GZIP != 0;
        let bytes = compression::maybe_decompress(payload, compressed)?;
        Ok(InboundContent::Pty { sub_id, bytes })
    }

    fn decode_file(body: &[u8]) -> Result<InboundContent, TransportError> {
        let (sub_id, name, bytes) = parse_file_header(body)?;
        Ok(InboundContent::File {
            sub_id,
            name,
            bytes: bytes.to_vec(),
        })
    }

    async fn decode_file_chunk(&self, body: &[u8]) -> Result<InboundContent, TransportError> {
        let [&transfer_id, &flags, payload @ ..] = body else {
            return Err(TransportError::UnknownContentType(CONTENT_FILE_CHUNK));
        };
        let first = flags & FILE_CHUNK_FLAG_FIRST != 0;
        let last = flags & FILE_CHUNK_FLAG_LAST != 0;

        let mut pending = self.pending_files.lock().await;
        pending.retain(|_, transfer| transfer.started_at.elapsed() < FILE_TRANSFER_TTL);

        if first {
            let (sub_id, name, data) = parse_file_header(payload)?;
            pending.insert(
                transfer_id,
                PendingFileTransfer {
                    sub_id,
                    name,
                    payload: data.to_vec(),
                    started_at: Instant::now(),
                },
            );
        } else if let Some(transfer) = pending.get_mut(&transfer_id) {
            transfer.payload.extend_from_slice(payload);
        } else {
            return Err(TransportError::UnknownContentType(CONTENT_FILE_CHUNK));
        }

        if last {
            let transfer = pending
                .remove(&transfer_id)
                .ok_or(TransportError::UnknownContentType(CONTENT_FILE_CHUNK))?;
            Ok(InboundContent::FileReassembled {
                sub_id: transfer.sub_id,
                name: transfer.name,
                bytes: transfer.payload,
            })
        } else {
            Ok(InboundContent::Pending)
        }
    }
}

/// Shared, clonable handle to a [`DataChannelCodec`].
pub type SharedCodec = Arc<DataChannelCodec>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn control_round_trips() {
        let codec = DataChannelCodec::new(4096);
        let frame = DataChannelCodec::encode_control(br#"{"type":"ping"}"#);
        match codec.decode(&frame).await.expect("decodes") {
            InboundContent::Control(bytes) => assert_eq!(bytes, br#"{"type":"ping"}"#),
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[tokio::test]
    async fn pty_small_payload_is_not_compressed() {
        let codec = DataChannelCodec::new(4096);
        let frame = codec.encode_pty("pty-0", b"hello").expect("encodes");
        assert_eq!(frame[1] & PTY_FLAG_GZIP, 0);
        assert_eq!(frame[1] & PTY_FLAG_OUTBOUND, PTY_FLAG_OUTBOUND);
        match codec.decode(&frame).await.expect("decodes") {
            InboundContent::Pty { sub_id, bytes } => {
                assert_eq!(sub_id, "pty-0");
                assert_eq!(bytes, b"hello");
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[tokio::test]
    async fn pty_large_payload_round_trips_through_gzip() {
        let codec = DataChannelCodec::new(16);
        let payload: Vec<u8> = (0..1000).map(|i| (i % 7) as u8).collect();
        let frame = codec.encode_pty("agent-0:pty-0", &payload).expect("encodes");
        assert_eq!(frame[1] & PTY_FLAG_GZIP, PTY_FLAG_GZIP);
        match codec.decode(&frame).await.expect("decodes") {
            InboundContent::Pty { sub_id, bytes } => {
                assert_eq!(sub_id, "agent-0:pty-0");
                assert_eq!(bytes, payload);
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[tokio::test]
    async fn atomic_file_round_trips() {
        let frame = DataChannelCodec::encode_file("files-root", "a.bin", b"hello file");
        let codec = DataChannelCodec::new(4096);
        match codec.decode(&frame).await.expect("decodes") {
            InboundContent::File { sub_id, name, bytes } => {
                assert_eq!(sub_id, "files-root");
                assert_eq!(name, "a.bin");
                assert_eq!(bytes, b"hello file");
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[tokio::test]
    async fn large_file_chunks_reassemble_in_order() {
        let codec = DataChannelCodec::new(4096);
        let payload: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let chunks = DataChannelCodec::encode_file_chunks(7, "terminal-0-0", "report.txt", &payload, 1024);
        assert!(chunks.len() > 1);
        assert_eq!(chunks[0][2] & FILE_CHUNK_FLAG_FIRST, FILE_CHUNK_FLAG_FIRST);
        assert_eq!(chunks.last().unwrap()[2] & FILE_CHUNK_FLAG_LAST, FILE_CHUNK_FLAG_LAST);

        let mut result = None;
        for chunk in &chunks[..chunks.len() - 1] {
            let decoded = codec.decode(chunk).await.expect("decodes");
            assert!(matches!(decoded, InboundContent::Pending));
        }
        if let InboundContent::FileReassembled { sub_id, name, bytes } =
            codec.decode(chunks.last().unwrap()).await.expect("decodes")
        {
            result = Some((sub_id, name, bytes));
        }
        let (sub_id, name, bytes) = result.expect("reassembled on last fragment");
        assert_eq!(sub_id, "terminal-0-0");
        assert_eq!(name, "report.txt");
        assert_eq!(bytes, payload);
    }

    #[tokio::test]
    async fn single_fragment_transfer_sets_both_flags_and_completes_immediately() {
        let codec = DataChannelCodec::new(4096);
        let chunks = DataChannelCodec::encode_file_chunks(3, "sub", "x.txt", b"tiny", 4096);
        assert_eq!(chunks.len(), 1);
        assert_eq!(
            chunks[0][2] & (FILE_CHUNK_FLAG_FIRST | FILE_CHUNK_FLAG_LAST),
            FILE_CHUNK_FLAG_FIRST | FILE_CHUNK_FLAG_LAST
        );
        match codec.decode(&chunks[0]).await.expect("decodes") {
            InboundContent::FileReassembled { bytes, .. } => assert_eq!(bytes, b"tiny"),
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_file_chunks_to_a_single_header_only_fragment() {
        let chunks = DataChannelCodec::encode_file_chunks(4, "sub", "empty.txt", b"", 4096);
        assert_eq!(chunks.len(), 1);
        let codec = DataChannelCodec::new(4096);
        match codec.decode(&chunks[0]).await.expect("decodes") {
            InboundContent::FileReassembled { name, bytes, .. } => {
                assert_eq!(name, "empty.txt");
                assert!(bytes.is_empty());
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_content_type_is_rejected() {
        let codec = DataChannelCodec::new(4096);
        let err = codec.decode(&[0xFF, 0x00]).await.unwrap_err();
        assert!(matches!(err, TransportError::UnknownContentType(0xFF)));
    }
}
