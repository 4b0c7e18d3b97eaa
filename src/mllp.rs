use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{EngineError, Result};

pub const SB: u8 = 0x0B;
pub const EB: u8 = 0x1C;
pub const CR: u8 = 0x0D;

pub const DEFAULT_MAX_BYTES: usize = 16 * 1024 * 1024;

/// Outcome of a single `read_one` call.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    Frame(Vec<u8>),
    EndOfStream,
    Timeout,
}

enum State {
    WaitingStart,
    Accumulating,
    AwaitingTrailingByte,
}

/// Reads exactly one MLLP frame from `stream`, bounded by `max_bytes` and
/// `deadline`. Bytes before the first `SB` are discarded silently (keep-
/// alive noise). A stream closing between `SB` and `EB` is a framing
/// error; closing before any `SB` is `EndOfStream`.
pub async fn read_one<S>(stream: &mut S, max_bytes: usize, deadline: Duration) -> Result<ReadOutcome>
where
    S: AsyncRead + Unpin,
{
    match tokio::time::timeout(deadline, read_one_inner(stream, max_bytes)).await {
        Ok(result) => result,
        Err(_) => Ok(ReadOutcome::Timeout),
    }
}

async fn read_one_inner<S>(stream: &mut S, max_bytes: usize) -> Result<ReadOutcome>
where
    S: AsyncRead + Unpin,
{
    let mut carry: Vec<u8> = Vec::new();
    let mut pos = 0;
    read_frame(stream, max_bytes, &mut carry, &mut pos).await
}

/// Reads a single frame from `stream`, consulting `carry`/`pos` for bytes
/// already pulled off the wire by a previous call before reading more.
/// Any bytes left over in `carry` past the completed frame stay there for
/// the next call, so a client pipelining two frames in one TCP segment
/// doesn't lose the second.
async fn read_frame<S>(
    stream: &mut S,
    max_bytes: usize,
    carry: &mut Vec<u8>,
    pos: &mut usize,
) -> Result<ReadOutcome>
where
    S: AsyncRead + Unpin,
{
    let mut state = State::WaitingStart;
    let mut payload = Vec::new();
    let mut read_buf = [0u8; 4096];

    loop {
        if *pos >= carry.len() {
            let n = stream.read(&mut read_buf).await?;
            if n == 0 {
                return match state {
                    State::WaitingStart => Ok(ReadOutcome::EndOfStream),
                    _ => Err(EngineError::Framing(
                        "stream closed between SB and EB".to_string(),
                    )),
                };
            }
            carry.clear();
            carry.extend_from_slice(&read_buf[..n]);
            *pos = 0;
        }

        while *pos < carry.len() {
            let b = carry[*pos];
            *pos += 1;
            match state {
                State::WaitingStart => {
                    if b == SB {
                        state = State::Accumulating;
                        payload.clear();
                    }
                }
                State::Accumulating => {
                    if b == EB {
                        state = State::AwaitingTrailingByte;
                    } else {
                        payload.push(b);
                        if payload.len() > max_bytes {
                            return Err(EngineError::Framing(format!(
                                "frame exceeds max_bytes ({max_bytes})"
                            )));
                        }
                    }
                }
                State::AwaitingTrailingByte => {
                    if b != CR {
                        tracing::warn!("MLLP frame missing trailing CR after EB; tolerating");
                    }
                    return Ok(ReadOutcome::Frame(std::mem::take(&mut payload)));
                }
            }
        }
    }
}

/// A connection-scoped MLLP reader that retains bytes read past a
/// completed frame so a second pipelined frame on the same connection can
/// still be read out by a later `read_one` call.
pub struct MllpReader<S> {
    stream: S,
    carry: Vec<u8>,
    pos: usize,
}

impl<S> MllpReader<S>
where
    S: AsyncRead + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self { stream, carry: Vec::new(), pos: 0 }
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub async fn read_one(&mut self, max_bytes: usize, deadline: Duration) -> Result<ReadOutcome> {
        let MllpReader { stream, carry, pos } = self;
        match tokio::time::timeout(deadline, read_frame(stream, max_bytes, carry, pos)).await {
            Ok(result) => result,
            Err(_) => Ok(ReadOutcome::Timeout),
        }
    }
}

/// Writes `payload` framed as `SB payload [CR] EB CR`, flushing after.
/// `payload` is written exactly once and never mutated.
pub async fn write<S>(stream: &mut S, payload: &[u8]) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_u8(SB).await?;
    stream.write_all(payload).await?;
    if payload.last() != Some(&CR) {
        stream.write_u8(CR).await?;
    }
    stream.write_u8(EB).await?;
    stream.write_u8(CR).await?;
    stream.flush().await?;
    Ok(())
}
