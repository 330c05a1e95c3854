//! Framed JSON codec
//!
//! Each frame is a 4-byte big-endian length prefix followed by a JSON body.
//! Works over any AsyncRead/AsyncWrite (TCP, unix sockets, pipes).

use std::io;
use std::marker::PhantomData;

use bytes::{Bytes, BytesMut};
use serde::{de::DeserializeOwned, Serialize};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Frames above this size get an info-level log line
const LARGE_FRAME_BYTES: usize = 1024 * 1024;

/// Length-prefixed JSON codec
///
/// Bodies that fail to deserialize are skipped rather than failing the
/// stream: the length prefix has already been consumed, so the next frame
/// starts at a known position.
pub struct JsonCodec<T> {
    inner: LengthDelimitedCodec,
    _phantom: PhantomData<T>,
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonCodec<T> {
    /// Create a codec with the default maximum frame length (8 MiB)
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .new_codec(),
            _phantom: PhantomData,
        }
    }

    /// Create a codec with a custom maximum frame length
    pub fn with_max_frame_length(max: usize) -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .max_frame_length(max)
                .new_codec(),
            _phantom: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> Decoder for JsonCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        while let Some(frame) = self.inner.decode(src)? {
            match serde_json::from_slice(&frame) {
                Ok(item) => return Ok(Some(item)),
                Err(e) => {
                    tracing::debug!(
                        error = %e,
                        frame_len = frame.len(),
                        "Skipping malformed frame"
                    );
                }
            }
        }
        Ok(None)
    }
}

impl<T: Serialize> Encoder<T> for JsonCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let len = json.len();

        tracing::trace!(frame_len = len, "Encoding frame");
        if len > LARGE_FRAME_BYTES {
            tracing::info!(frame_len = len, "Large frame being encoded");
        }

        self.inner.encode(Bytes::from(json), dst)
    }
}
