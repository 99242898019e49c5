//! Browser-side TCP-like stream multiplexer.
//!
//! The hub's side of this wire format dials a local TCP port on `OPEN`
//! and forwards bytes in both directions; this side is the one that
//! originates streams (for HTTP tunneling — see [`crate::http_parser`])
//! and waits for `OPENED`/`ERROR` before writing.
//!
//! # Frame format
//!
//! After Olm decryption, `CONTENT_STREAM` frames have sub-framing:
//! ```text
//! [0x02][frame_type:1][stream_id:2 BE][payload...]
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex};

use crate::error::TransportError;

/// Frame type: this side -> hub, open a new stream. Payload = `[port:2 BE]`.
pub const FRAME_OPEN: u8 = 0x00;
/// Frame type: bidirectional, raw data. Payload = bytes (<=16KB).
pub const FRAME_DATA: u8 = 0x01;
/// Frame type: bidirectional, close a stream. Empty payload.
pub const FRAME_CLOSE: u8 = 0x02;
/// Frame type: hub -> this side, stream connected. Empty payload.
pub const FRAME_OPENED: u8 = 0x03;
/// Frame type: hub -> this side, error message. Payload = UTF-8 string.
pub const FRAME_ERROR: u8 = 0x04;

/// Maximum chunk size per `DATA` frame.
pub const MAX_CHUNK_SIZE: usize = 16384;

/// A decoded stream-multiplexer frame.
#[derive(Debug, Clone)]
pub struct StreamFrame {
    /// Frame type (OPEN, DATA, CLOSE, OPENED, ERROR).
    pub frame_type: u8,
    /// Stream identifier.
    pub stream_id: u16,
    /// Frame payload.
    pub payload: Vec<u8>,
}

impl StreamFrame {
    /// Serialize to the `[frame_type][stream_id:2 BE][payload]` wire form
    /// that goes inside a `CONTENT_STREAM` envelope.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(3 + self.payload.len());
        out.push(self.frame_type);
        out.extend_from_slice(&self.stream_id.to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Parse a `CONTENT_STREAM` sub-frame.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::UnknownContentType` if `bytes` is too
    /// short to contain a frame header.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TransportError> {
        if bytes.len() < 3 {
            return Err(TransportError::UnknownContentType(
                bytes.first().copied().unwrap_or(0),
            ));
        }
        Ok(Self {
            frame_type: bytes[0],
            stream_id: u16::from_be_bytes([bytes[1], bytes[2]]),
            payload: bytes[3..].to_vec(),
        })
    }
}

enum StreamEvent {
    Data(Vec<u8>),
    Closed,
}

struct StreamState {
    incoming_tx: mpsc::UnboundedSender<StreamEvent>,
    opened_tx: Option<oneshot::Sender<Result<(), String>>>,
}

/// A single multiplexed stream, handed back from `open`.
pub struct MuxStream {
    stream_id: u16,
    output_tx: mpsc::UnboundedSender<StreamFrame>,
    incoming_rx: mpsc::UnboundedReceiver<StreamEvent>,
}

impl MuxStream {
    /// This stream's id, as carried on the wire.
    #[must_use]
    pub fn stream_id(&self) -> u16 {
        self.stream_id
    }

    /// Write a chunk, splitting into `MAX_CHUNK_SIZE` frames as needed.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::DataChannelNotOpen` if the multiplexer's
    /// output side has been dropped.
    pub fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        for chunk in data.chunks(MAX_CHUNK_SIZE) {
            self.output_tx
                .send(StreamFrame {
                    frame_type: FRAME_DATA,
                    stream_id: self.stream_id,
                    payload: chunk.to_vec(),
                })
                .map_err(|_| TransportError::DataChannelNotOpen(crate::HubId::from("stream-mux")))?;
        }
        Ok(())
    }

    /// Read the next chunk of data, or `None` once the stream closes.
    pub async fn read(&mut self) -> Option<Vec<u8>> {
        match self.incoming_rx.recv().await {
            Some(StreamEvent::Data(bytes)) => Some(bytes),
            Some(StreamEvent::Closed) | None => None,
        }
    }

    /// Ask the hub to close this stream.
    pub fn close(&self) {
        let _ = self.output_tx.send(StreamFrame {
            frame_type: FRAME_CLOSE,
            stream_id: self.stream_id,
            payload: Vec::new(),
        });
    }
}

/// Allocates stream ids and dispatches inbound frames to the right
/// [`MuxStream`]. One instance per hub.
#[derive(Clone)]
pub struct StreamMultiplexer {
    next_id: Arc<AtomicU16>,
    streams: Arc<Mutex<HashMap<u16, StreamState>>>,
    output_tx: mpsc::UnboundedSender<StreamFrame>,
}

impl std::fmt::Debug for StreamMultiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamMultiplexer").finish_non_exhaustive()
    }
}

impl StreamMultiplexer {
    /// Create a multiplexer. `output_tx` carries outbound frames to the
    /// DataChannel codec.
    #[must_use]
    pub fn new(output_tx: mpsc::UnboundedSender<StreamFrame>) -> Self {
        Self {
            next_id: Arc::new(AtomicU16::new(1)),
            streams: Arc::new(Mutex::new(HashMap::new())),
            output_tx,
        }
    }

    /// Allocate a new stream id, send `OPEN` for `port`, and wait for
    /// `OPENED`/`ERROR` from the hub.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::DataChannelNotOpen` if the hub replies
    /// with `ERROR`, or if the multiplexer is shutting down.
    pub async fn open(&self, port: u16) -> Result<MuxStream, TransportError> {
        let mut stream_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        while stream_id == 0 {
            // wrapped past u16::MAX back to 0, which is reserved
            stream_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        }

        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let (opened_tx, opened_rx) = oneshot::channel();

        self.streams.lock().await.insert(
            stream_id,
            StreamState {
                incoming_tx,
                opened_tx: Some(opened_tx),
            },
        );

        self.output_tx
            .send(StreamFrame {
                frame_type: FRAME_OPEN,
                stream_id,
                payload: port.to_be_bytes().to_vec(),
            })
            .map_err(|_| TransportError::DataChannelNotOpen(crate::HubId::from("stream-mux")))?;

        match opened_rx.await {
            Ok(Ok(())) => Ok(MuxStream {
                stream_id,
                output_tx: self.output_tx.clone(),
                incoming_rx,
            }),
            Ok(Err(reason)) => Err(TransportError::DataChannelNotOpen(crate::HubId::from(reason))),
            Err(_) => Err(TransportError::DataChannelNotOpen(crate::HubId::from(
                "stream closed before opening",
            ))),
        }
    }

    /// Dispatch an inbound frame from the DataChannel codec.
    pub async fn handle_frame(&self, frame: StreamFrame) {
        let mut streams = self.streams.lock().await;
        match frame.frame_type {
            FRAME_OPENED => {
                if let Some(state) = streams.get_mut(&frame.stream_id) {
                    if let Some(tx) = state.opened_tx.take() {
                        let _ = tx.send(Ok(()));
                    }
                }
            }
            FRAME_ERROR => {
                if let Some(mut state) = streams.remove(&frame.stream_id) {
                    if let Some(tx) = state.opened_tx.take() {
                        let _ = tx.send(Err(String::from_utf8_lossy(&frame.payload).to_string()));
                    }
                    let _ = state.incoming_tx.send(StreamEvent::Closed);
                }
            }
            FRAME_DATA => {
                if let Some(state) = streams.get(&frame.stream_id) {
                    let _ = state.incoming_tx.send(StreamEvent::Data(frame.payload));
                }
            }
            FRAME_CLOSE => {
                if let Some(state) = streams.remove(&frame.stream_id) {
                    let _ = state.incoming_tx.send(StreamEvent::Closed);
                }
            }
            other => {
                log::warn!("unknown stream-mux frame type 0x{other:02x} for stream {}", frame.stream_id);
            }
        }
    }

    /// Close every open stream (used on hub disconnect).
    pub async fn close_all(&self) {
        let mut streams = self.streams.lock().await;
        for (_, mut state) in streams.drain() {
            let _ = state.incoming_tx.send(StreamEvent::Closed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trips_through_bytes() {
        let frame = StreamFrame {
            frame_type: FRAME_DATA,
            stream_id: 7,
            payload: vec![1, 2, 3],
        };
        let bytes = frame.to_bytes();
        let parsed = StreamFrame::from_bytes(&bytes).expect("parses");
        assert_eq!(parsed.frame_type, FRAME_DATA);
        assert_eq!(parsed.stream_id, 7);
        assert_eq!(parsed.payload, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn open_completes_on_opened_frame() {
        let (output_tx, mut output_rx) = mpsc::unbounded_channel();
        let mux = StreamMultiplexer::new(output_tx);

        let mux2 = mux.clone();
        let opener = tokio::spawn(async move { mux2.open(8080).await });

        let open_frame = output_rx.recv().await.expect("OPEN frame sent");
        assert_eq!(open_frame.frame_type, FRAME_OPEN);
        let stream_id = open_frame.stream_id;

        mux.handle_frame(StreamFrame {
            frame_type: FRAME_OPENED,
            stream_id,
            payload: Vec::new(),
        })
        .await;

        let stream = opener.await.expect("task joins").expect("opens");
        assert_eq!(stream.stream_id(), stream_id);
    }

    #[tokio::test]
    async fn open_fails_on_error_frame() {
        let (output_tx, mut output_rx) = mpsc::unbounded_channel();
        let mux = StreamMultiplexer::new(output_tx);

        let mux2 = mux.clone();
        let opener = tokio::spawn(async move { mux2.open(8080).await });
        let open_frame = output_rx.recv().await.expect("OPEN frame sent");

        mux.handle_frame(StreamFrame {
            frame_type: FRAME_ERROR,
            stream_id: open_frame.stream_id,
            payload: b"connection refused".to_vec(),
        })
        .await;

        let result = opener.await.expect("task joins");
        assert!(result.is_err());
    }
}
