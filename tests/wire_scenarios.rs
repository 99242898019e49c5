//! Exact wire-byte scenarios: PTY hot path and stream-tunnel OPEN framing,
//! matching the byte layouts a hub on the other end of the DataChannel
//! would actually see (after Olm decryption).

use relay_transport::codec::{DataChannelCodec, InboundContent};
use relay_transport::stream_mux::{StreamFrame, FRAME_OPEN};

/// A PTY frame from the hub side carries flags `0x00` (no compression, no
/// outbound bit — this crate only ever sets the outbound bit on frames it
/// originates) followed by the subscription id and raw bytes.
#[tokio::test]
async fn pty_hot_path_decodes_the_exact_inbound_layout() {
    let sub_id = b"terminal-0-0";
    let mut plaintext = vec![0x01u8, 0x00, sub_id.len() as u8];
    plaintext.extend_from_slice(sub_id);
    plaintext.extend_from_slice(b"ls output\n");

    let codec = DataChannelCodec::new(4096);
    match codec.decode(&plaintext).await.expect("decodes") {
        InboundContent::Pty { sub_id, bytes } => {
            assert_eq!(sub_id, "terminal-0-0");
            assert_eq!(bytes, b"ls output\n");
        }
        other => panic!("unexpected variant: {other:?}"),
    }
}

/// Sending a keystroke produces exactly one outbound plaintext frame
/// (the fast lane never splits small PTY payloads).
#[tokio::test]
async fn pty_send_produces_one_frame_for_a_keystroke() {
    let codec = DataChannelCodec::new(4096);
    let frame = codec.encode_pty("terminal-0-0", b"ls\n").expect("encodes");
    // content_type, flags, sub_id_len, sub_id, payload — one contiguous frame.
    assert_eq!(frame[0], 0x01);
    assert_eq!(&frame[3..3 + "terminal-0-0".len()], b"terminal-0-0");
    assert!(frame.ends_with(b"ls\n"));
}

/// Opening stream id 1 to port 8080 produces the exact plaintext bytes
/// `[0x02][0x00][0x00][0x01][0x1f][0x90]`: content type, OPEN frame type,
/// stream id big-endian, port big-endian.
#[tokio::test]
async fn stream_open_matches_the_documented_wire_bytes() {
    let frame = StreamFrame {
        frame_type: FRAME_OPEN,
        stream_id: 1,
        payload: 8080u16.to_be_bytes().to_vec(),
    };
    let plaintext = DataChannelCodec::encode_stream(&frame);
    assert_eq!(plaintext, vec![0x02, 0x00, 0x00, 0x01, 0x1f, 0x90]);
}
