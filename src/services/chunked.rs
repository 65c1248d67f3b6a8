//! Decoder for `aws-chunked` request bodies.
//!
//! Wire format, one frame per chunk:
//!
//! ```text
//! <hex-size>[;chunk-signature=<sig>]\r\n
//! <size bytes>\r\n
//! ...
//! 0[;chunk-signature=<sig>]\r\n
//! [<trailer-name>:<value>\r\n]*
//! \r\n
//! ```
//!
//! The decoder is a pull-based stream transform. It only holds the bytes of
//! the current frame header plus whatever the last network read delivered,
//! and forwards payload bytes as soon as they arrive.

use crate::services::backend::ByteStream;
use bytes::{Buf, Bytes, BytesMut};
use futures::{StreamExt, stream};
use std::io;
use thiserror::Error;

/// Upper bound on a single frame header or trailer line.
const MAX_LINE_LEN: usize = 4096;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChunkedDecodeError {
    #[error("malformed chunk size token `{0}`")]
    MalformedSize(String),
    #[error("chunk header or trailer exceeds {MAX_LINE_LEN} bytes")]
    LineTooLong,
    #[error("chunk data not followed by CRLF")]
    MissingChunkTerminator,
    #[error("body ended before the terminating zero-size chunk")]
    Truncated,
    #[error("decoded length {actual} does not match declared length {declared}")]
    LengthMismatch { declared: u64, actual: u64 },
    #[error("unexpected bytes after the final chunk")]
    TrailingData,
}

impl From<ChunkedDecodeError> for io::Error {
    fn from(err: ChunkedDecodeError) -> Self {
        io::Error::new(io::ErrorKind::InvalidData, err)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Header,
    Data { remaining: u64 },
    DataEnd,
    Trailers,
    Done,
}

/// One decoding step.
#[derive(Debug, PartialEq, Eq)]
pub enum Step {
    /// Payload bytes ready to forward.
    Data(Bytes),
    /// The buffer holds no complete frame element; read more input.
    NeedMore,
    /// Final chunk and trailers consumed.
    Done,
}

/// Incremental frame parser. Feed it a buffer, it consumes what it can.
#[derive(Debug)]
pub struct ChunkedDecoder {
    state: State,
    declared_len: u64,
    decoded: u64,
}

impl ChunkedDecoder {
    pub fn new(declared_len: u64) -> Self {
        Self {
            state: State::Header,
            declared_len,
            decoded: 0,
        }
    }

    /// Consume from `buf` until payload is available, more input is needed,
    /// or the body is complete.
    pub fn step(&mut self, buf: &mut BytesMut) -> Result<Step, ChunkedDecodeError> {
        loop {
            match self.state {
                State::Header => {
                    let Some(line) = take_line(buf)? else {
                        return Ok(Step::NeedMore);
                    };
                    let size = parse_chunk_size(&line)?;
                    self.state = if size == 0 {
                        State::Trailers
                    } else {
                        State::Data { remaining: size }
                    };
                }
                State::Data { remaining } => {
                    if buf.is_empty() {
                        return Ok(Step::NeedMore);
                    }
                    let take = usize::try_from(remaining)
                        .unwrap_or(usize::MAX)
                        .min(buf.len());
                    let data = buf.split_to(take).freeze();
                    self.decoded += take as u64;
                    if self.decoded > self.declared_len {
                        return Err(ChunkedDecodeError::LengthMismatch {
                            declared: self.declared_len,
                            actual: self.decoded,
                        });
                    }
                    let remaining = remaining - take as u64;
                    self.state = if remaining == 0 {
                        State::DataEnd
                    } else {
                        State::Data { remaining }
                    };
                    return Ok(Step::Data(data));
                }
                State::DataEnd => {
                    if buf.len() < 2 {
                        return Ok(Step::NeedMore);
                    }
                    if &buf[..2] != b"\r\n" {
                        return Err(ChunkedDecodeError::MissingChunkTerminator);
                    }
                    buf.advance(2);
                    self.state = State::Header;
                }
                State::Trailers => {
                    let Some(line) = take_line(buf)? else {
                        return Ok(Step::NeedMore);
                    };
                    // trailer headers (checksums, trailer signature) are not interpreted
                    if line.is_empty() {
                        self.state = State::Done;
                    }
                }
                State::Done => {
                    if !buf.is_empty() {
                        return Err(ChunkedDecodeError::TrailingData);
                    }
                    return Ok(Step::Done);
                }
            }
        }
    }

    /// Called once the input is exhausted.
    pub fn finish(&mut self, buf: &BytesMut) -> Result<(), ChunkedDecodeError> {
        match self.state {
            State::Done => {}
            // tolerate clients that omit the blank line after the last trailer
            State::Trailers if buf.is_empty() => self.state = State::Done,
            _ => return Err(ChunkedDecodeError::Truncated),
        }
        if !buf.is_empty() {
            return Err(ChunkedDecodeError::TrailingData);
        }
        if self.decoded != self.declared_len {
            return Err(ChunkedDecodeError::LengthMismatch {
                declared: self.declared_len,
                actual: self.decoded,
            });
        }
        Ok(())
    }
}

/// Split one CRLF-terminated line off the front of `buf`, without the CRLF.
fn take_line(buf: &mut BytesMut) -> Result<Option<Bytes>, ChunkedDecodeError> {
    match buf.windows(2).position(|w| w == b"\r\n") {
        Some(pos) => {
            if pos > MAX_LINE_LEN {
                return Err(ChunkedDecodeError::LineTooLong);
            }
            let line = buf.split_to(pos).freeze();
            buf.advance(2);
            Ok(Some(line))
        }
        None if buf.len() > MAX_LINE_LEN => Err(ChunkedDecodeError::LineTooLong),
        None => Ok(None),
    }
}

/// `1a2b;chunk-signature=...` -> 0x1a2b
fn parse_chunk_size(line: &[u8]) -> Result<u64, ChunkedDecodeError> {
    let text = String::from_utf8_lossy(line);
    let token = text.split(';').next().unwrap_or("").trim();
    if token.is_empty() || token.len() > 16 || !token.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(ChunkedDecodeError::MalformedSize(token.to_string()));
    }
    u64::from_str_radix(token, 16).map_err(|_| ChunkedDecodeError::MalformedSize(token.to_string()))
}

struct DecodeState {
    input: ByteStream,
    buf: BytesMut,
    decoder: ChunkedDecoder,
    exhausted: bool,
    finished: bool,
}

/// Wrap an `aws-chunked` body so it yields exactly `declared_len` payload
/// bytes. Framing errors and length mismatches surface as
/// `io::ErrorKind::InvalidData` carrying a [`ChunkedDecodeError`].
pub fn decode_aws_chunked(input: ByteStream, declared_len: u64) -> ByteStream {
    let state = DecodeState {
        input,
        buf: BytesMut::new(),
        decoder: ChunkedDecoder::new(declared_len),
        exhausted: false,
        finished: false,
    };

    stream::try_unfold(state, next_payload).boxed()
}

async fn next_payload(mut st: DecodeState) -> io::Result<Option<(Bytes, DecodeState)>> {
    if st.finished {
        return Ok(None);
    }
    loop {
        match st.decoder.step(&mut st.buf)? {
            Step::Data(data) => return Ok(Some((data, st))),
            Step::Done => {
                st.decoder.finish(&st.buf)?;
                ensure_input_ends(&mut st.input).await?;
                st.finished = true;
                return Ok(None);
            }
            Step::NeedMore if st.exhausted => {
                st.decoder.finish(&st.buf)?;
                st.finished = true;
                return Ok(None);
            }
            Step::NeedMore => match st.input.next().await {
                Some(chunk) => st.buf.extend_from_slice(&chunk?),
                None => st.exhausted = true,
            },
        }
    }
}

/// Bytes arriving after the final chunk and its trailers are a framing error.
async fn ensure_input_ends(input: &mut ByteStream) -> io::Result<()> {
    while let Some(chunk) = input.next().await {
        if !chunk?.is_empty() {
            return Err(ChunkedDecodeError::TrailingData.into());
        }
    }
    Ok(())
}

/// Pull the [`ChunkedDecodeError`] back out of an I/O error, if that is what it carries.
pub fn as_decode_error(err: &io::Error) -> Option<&ChunkedDecodeError> {
    err.get_ref()
        .and_then(|inner| inner.downcast_ref::<ChunkedDecodeError>())
}
