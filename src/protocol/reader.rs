//! Window and event-frame decoding.
//!
//! [`BatchReader`] pulls one window at a time off a buffered transport and
//! turns it into a [`Batch`]. Between windows it waits without a deadline;
//! once a non-empty window header arrives the configured timeout covers the
//! rest of the window body. Compressed frames are slurped whole (exactly
//! the announced byte count, keeping the stream framed even if the zlib
//! data ends early), inflated in memory, and parsed by a synchronous
//! re-entry into the same event-frame grammar.

use std::io::Read;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;

use bytes::BytesMut;
use flate2::read::ZlibDecoder;
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};
use tracing::trace;

use super::{codes, Version, MAX_PAYLOAD_SIZE, MAX_WINDOW_PREALLOC, WINDOW_HEADER_LEN};
use crate::batch::{Batch, Event};
use crate::config::JsonDecoder;
use crate::error::{Result, TimberwireError};
use crate::tls::TlsState;

/// Reads batches of events off one connection.
pub(crate) struct BatchReader<R> {
    input: BufReader<R>,
    version: Version,
    timeout: Duration,
    decoder: JsonDecoder,
    /// Reusable payload buffer, grown to the largest JSON payload seen on
    /// this connection.
    scratch: BytesMut,
    remote_addr: Option<String>,
    tls_state: Option<TlsState>,
}

impl<R: AsyncRead + Unpin> BatchReader<R> {
    pub fn new(
        input: R,
        version: Version,
        timeout: Duration,
        decoder: JsonDecoder,
        remote_addr: Option<String>,
        tls_state: Option<TlsState>,
    ) -> Self {
        Self {
            input: BufReader::new(input),
            version,
            timeout,
            decoder,
            scratch: BytesMut::new(),
            remote_addr,
            tls_state,
        }
    }

    /// Read the next window.
    ///
    /// Returns `Ok(None)` for an empty window (the connection stays open
    /// and the next call waits for the following window header).
    ///
    /// # Errors
    ///
    /// Any protocol violation, transport failure, decode failure or
    /// mid-window timeout is fatal for the connection.
    pub async fn read_batch(&mut self) -> Result<Option<Batch>> {
        let mut header = [0u8; WINDOW_HEADER_LEN];
        // No deadline while waiting for the next window.
        self.input.read_exact(&mut header).await?;

        if header[0] != self.version.byte() || header[1] != codes::WINDOW_SIZE {
            return Err(TimberwireError::Protocol(format!(
                "expected {} window header, got bytes {:#04x} {:#04x}",
                self.version, header[0], header[1]
            )));
        }

        let count = u32::from_be_bytes([header[2], header[3], header[4], header[5]]) as usize;
        trace!(count, "window header");
        if count == 0 {
            return Ok(None);
        }

        // The deadline covers the whole window body and is dropped again
        // once the window completes.
        let events = match tokio::time::timeout(self.timeout, self.read_window(count)).await {
            Ok(events) => events?,
            Err(_) => return Err(TimberwireError::Timeout),
        };

        Ok(Some(Batch::with_source(
            events,
            self.remote_addr.clone(),
            self.tls_state.clone(),
        )))
    }

    async fn read_window(&mut self, count: usize) -> Result<Vec<Event>> {
        let mut events = Vec::with_capacity(count.min(MAX_WINDOW_PREALLOC));
        while events.len() < count {
            let mut header = [0u8; 2];
            self.input.read_exact(&mut header).await?;

            if header[0] != self.version.byte() {
                return Err(TimberwireError::Protocol(format!(
                    "unexpected version byte {:#04x} in event frame",
                    header[0]
                )));
            }

            match (self.version, header[1]) {
                (Version::V2, codes::JSON_DATA_FRAME) => {
                    let event = self.read_json_event().await?;
                    events.push(event);
                }
                (Version::V1, codes::DATA_FRAME) => {
                    let event = self.read_kv_event().await?;
                    events.push(event);
                }
                (_, codes::COMPRESSED) => {
                    self.read_compressed(&mut events, count).await?;
                }
                (_, other) => {
                    return Err(TimberwireError::Protocol(format!(
                        "unknown frame type {:#04x}",
                        other
                    )));
                }
            }
        }
        Ok(events)
    }

    /// v2 `'J'` frame: sequence number, payload length, JSON payload.
    async fn read_json_event(&mut self) -> Result<Event> {
        let mut header = [0u8; 8];
        self.input.read_exact(&mut header).await?;
        let seq = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        let len = checked_len(
            u32::from_be_bytes([header[4], header[5], header[6], header[7]]),
            "json payload",
        )?;
        trace!(seq, len, "json data frame");

        if self.scratch.len() < len {
            self.scratch.resize(len, 0);
        }
        self.input.read_exact(&mut self.scratch[..len]).await?;
        decode_event(&self.decoder, &self.scratch[..len])
    }

    /// v1 `'D'` frame: sequence number, then a count of length-prefixed
    /// key/value pairs, assembled into one JSON object.
    async fn read_kv_event(&mut self) -> Result<Event> {
        let mut header = [0u8; 8];
        self.input.read_exact(&mut header).await?;
        let seq = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        let pairs = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
        trace!(seq, pairs, "key/value data frame");

        let mut object = serde_json::Map::with_capacity(pairs.min(MAX_WINDOW_PREALLOC));
        for _ in 0..pairs {
            let key = self.read_len_prefixed().await?;
            let value = self.read_len_prefixed().await?;
            object.insert(
                String::from_utf8_lossy(&key).into_owned(),
                Event::String(String::from_utf8_lossy(&value).into_owned()),
            );
        }
        Ok(Event::Object(object))
    }

    async fn read_len_prefixed(&mut self) -> Result<Vec<u8>> {
        let mut len_buf = [0u8; 4];
        self.input.read_exact(&mut len_buf).await?;
        let len = checked_len(u32::from_be_bytes(len_buf), "key/value string")?;
        let mut buf = vec![0u8; len];
        self.input.read_exact(&mut buf).await?;
        Ok(buf)
    }

    /// `'C'` frame: exactly `len` compressed transport bytes, inflated and
    /// re-parsed as event frames until the window count is reached.
    async fn read_compressed(&mut self, events: &mut Vec<Event>, count: usize) -> Result<()> {
        let mut len_buf = [0u8; 4];
        self.input.read_exact(&mut len_buf).await?;
        let len = checked_len(u32::from_be_bytes(len_buf), "compressed payload")?;
        trace!(len, "compressed frame");

        let mut compressed = vec![0u8; len];
        self.input.read_exact(&mut compressed).await?;

        let inflated = inflate(&compressed)?;
        let mut cursor: &[u8] = &inflated;
        parse_inflated_events(self.version, &self.decoder, &mut cursor, events, count)
        // Inflated bytes beyond the window count are discarded.
    }
}

/// Parse event frames out of an inflated compressed payload.
///
/// Same grammar as the transport-level loop, minus window headers. Stops
/// once `count` events have been collected; running out of bytes first is
/// a protocol error.
fn parse_inflated_events(
    version: Version,
    decoder: &JsonDecoder,
    input: &mut &[u8],
    events: &mut Vec<Event>,
    count: usize,
) -> Result<()> {
    while events.len() < count {
        let header = take(input, 2)?;
        if header[0] != version.byte() {
            return Err(TimberwireError::Protocol(format!(
                "unexpected version byte {:#04x} in compressed event frame",
                header[0]
            )));
        }

        match (version, header[1]) {
            (Version::V2, codes::JSON_DATA_FRAME) => {
                let frame = take(input, 8)?;
                let len = checked_len(
                    u32::from_be_bytes([frame[4], frame[5], frame[6], frame[7]]),
                    "json payload",
                )?;
                let payload = take(input, len)?;
                events.push(decode_event(decoder, payload)?);
            }
            (Version::V1, codes::DATA_FRAME) => {
                let frame = take(input, 8)?;
                let pairs =
                    u32::from_be_bytes([frame[4], frame[5], frame[6], frame[7]]) as usize;
                let mut object = serde_json::Map::with_capacity(pairs.min(MAX_WINDOW_PREALLOC));
                for _ in 0..pairs {
                    let key = take_len_prefixed(input)?;
                    let value = take_len_prefixed(input)?;
                    object.insert(
                        String::from_utf8_lossy(key).into_owned(),
                        Event::String(String::from_utf8_lossy(value).into_owned()),
                    );
                }
                events.push(Event::Object(object));
            }
            (_, codes::COMPRESSED) => {
                // Nested compressed frames are legal, if rare.
                let len_bytes = take(input, 4)?;
                let len = checked_len(
                    u32::from_be_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]),
                    "compressed payload",
                )?;
                let nested = take(input, len)?;
                let inflated = inflate(nested)?;
                let mut cursor: &[u8] = &inflated;
                parse_inflated_events(version, decoder, &mut cursor, events, count)?;
            }
            (_, other) => {
                return Err(TimberwireError::Protocol(format!(
                    "unknown frame type {:#04x} in compressed payload",
                    other
                )));
            }
        }
    }
    Ok(())
}

fn take<'a>(input: &mut &'a [u8], n: usize) -> Result<&'a [u8]> {
    if input.len() < n {
        return Err(TimberwireError::Protocol(
            "truncated compressed payload".to_string(),
        ));
    }
    let (head, tail) = input.split_at(n);
    *input = tail;
    Ok(head)
}

fn take_len_prefixed<'a>(input: &mut &'a [u8]) -> Result<&'a [u8]> {
    let len_bytes = take(input, 4)?;
    let len = checked_len(
        u32::from_be_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]),
        "key/value string",
    )?;
    take(input, len)
}

fn checked_len(len: u32, what: &str) -> Result<usize> {
    if len > MAX_PAYLOAD_SIZE {
        return Err(TimberwireError::Protocol(format!(
            "{what} length {len} exceeds maximum {MAX_PAYLOAD_SIZE}"
        )));
    }
    Ok(len as usize)
}

fn inflate(compressed: &[u8]) -> Result<Vec<u8>> {
    let mut inflated = Vec::new();
    ZlibDecoder::new(compressed)
        .read_to_end(&mut inflated)
        .map_err(|e| TimberwireError::Protocol(format!("zlib inflate failed: {e}")))?;
    Ok(inflated)
}

/// Run the injected decoder over one payload. A panicking decoder is
/// reported as a decode error instead of unwinding through the handler.
fn decode_event(decoder: &JsonDecoder, payload: &[u8]) -> Result<Event> {
    match catch_unwind(AssertUnwindSafe(|| (decoder.as_ref())(payload))) {
        Ok(Ok(event)) => Ok(event),
        Ok(Err(e)) => Err(TimberwireError::Decode(e)),
        Err(_) => Err(TimberwireError::Decode("event decoder panicked".into())),
    }
}
