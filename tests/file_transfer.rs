//! End-to-end file transfer scenarios: atomic sends, large-file chunking,
//! and the size boundary between the two, driven entirely through the
//! public codec API (no network, no real peer connection).

use relay_transport::codec::{DataChannelCodec, InboundContent};
use relay_transport::constants::{DEFAULT_MAX_MESSAGE_SIZE, ENVELOPE_OVERHEAD_RESERVE};

fn chunk_limit() -> usize {
    DEFAULT_MAX_MESSAGE_SIZE.saturating_sub(ENVELOPE_OVERHEAD_RESERVE)
}

/// A file well over `maxMessageSize` must be split into more than one
/// frame, each carrying the first/last flags correctly, and must
/// reassemble byte-for-byte in transmit order.
#[tokio::test]
async fn large_file_chunking_reassembles_exactly() {
    let limit = chunk_limit();
    let payload: Vec<u8> = (0..300_000u32).map(|i| (i % 256) as u8).collect();
    let chunks = DataChannelCodec::encode_file_chunks(11, "files:root", "archive.bin", &payload, limit);

    assert!(chunks.len() >= 2, "a 300,000 byte file must not fit in one frame");
    for chunk in &chunks {
        assert!(chunk.len() <= limit + 3, "frame exceeds the negotiated chunk limit");
    }

    let codec = DataChannelCodec::new(usize::MAX);
    let mut reassembled = None;
    for (index, chunk) in chunks.iter().enumerate() {
        match codec.decode(chunk).await.expect("decodes") {
            InboundContent::Pending => assert!(index < chunks.len() - 1),
            InboundContent::FileReassembled { sub_id, name, bytes } => {
                assert_eq!(index, chunks.len() - 1, "reassembly must only complete on the last fragment");
                reassembled = Some((sub_id, name, bytes));
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    let (sub_id, name, bytes) = reassembled.expect("transfer completed");
    assert_eq!(sub_id, "files:root");
    assert_eq!(name, "archive.bin");
    assert_eq!(bytes, payload);
}

/// The number of fragments a transfer splits into must match
/// `ceil(payload_len / chunk_limit)` to within one frame (the header
/// eats into the first fragment's budget, so it carries slightly less
/// payload than the rest).
#[tokio::test]
async fn chunk_count_tracks_payload_size_and_limit() {
    let limit = 2048;
    let payload = vec![0x42u8; 50_000];
    let chunks = DataChannelCodec::encode_file_chunks(1, "sub", "f.bin", &payload, limit);

    let min_expected = payload.len().div_ceil(limit);
    assert!(chunks.len() >= min_expected);
    assert!(chunks.len() <= min_expected + 1);
}

/// A file at or under the chunk limit is sent as a single atomic frame,
/// not split into a chunk stream at all.
#[tokio::test]
async fn small_file_round_trips_as_one_atomic_frame() {
    let frame = DataChannelCodec::encode_file("files:root", "notes.txt", b"short file contents");
    let codec = DataChannelCodec::new(4096);
    match codec.decode(&frame).await.expect("decodes") {
        InboundContent::File { sub_id, name, bytes } => {
            assert_eq!(sub_id, "files:root");
            assert_eq!(name, "notes.txt");
            assert_eq!(bytes, b"short file contents");
        }
        other => panic!("unexpected variant: {other:?}"),
    }
}

/// Two interleaved transfers under distinct `transfer_id`s must not
/// corrupt each other's reassembly buffers.
#[tokio::test]
async fn concurrent_transfers_with_distinct_ids_do_not_interfere() {
    let limit = 512;
    let payload_a: Vec<u8> = (0..4000u32).map(|i| i as u8).collect();
    let payload_b: Vec<u8> = (0..4000u32).map(|i| (i * 3) as u8).collect();

    let chunks_a = DataChannelCodec::encode_file_chunks(1, "sub-a", "a.bin", &payload_a, limit);
    let chunks_b = DataChannelCodec::encode_file_chunks(2, "sub-b", "b.bin", &payload_b, limit);

    let codec = DataChannelCodec::new(usize::MAX);

    // Interleave delivery: one fragment from A, one from B, alternating.
    let mut result_a = None;
    let mut result_b = None;
    let max_len = chunks_a.len().max(chunks_b.len());
    for i in 0..max_len {
        if let Some(chunk) = chunks_a.get(i) {
            if let InboundContent::FileReassembled { bytes, .. } = codec.decode(chunk).await.expect("decodes") {
                result_a = Some(bytes);
            }
        }
        if let Some(chunk) = chunks_b.get(i) {
            if let InboundContent::FileReassembled { bytes, .. } = codec.decode(chunk).await.expect("decodes") {
                result_b = Some(bytes);
            }
        }
    }

    assert_eq!(result_a.expect("transfer a completed"), payload_a);
    assert_eq!(result_b.expect("transfer b completed"), payload_b);
}
