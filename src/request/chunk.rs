//! Decoder for chunked request bodies
use std::cmp::min;

use httparse::{self, Status};

use crate::error::Error;


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    /// Waiting for the chunk size line
    Start,
    /// Bytes left in the current chunk
    Data(u64),
    /// CRLF after chunk data
    DataEnd,
    /// After the terminating zero-size chunk
    Trailer,
    Done,
}

#[derive(Debug, Clone)]
pub struct ChunkDecoder {
    state: ChunkState,
    max_head: usize,
}

impl ChunkDecoder {
    pub fn new(max_head: usize) -> ChunkDecoder {
        ChunkDecoder {
            state: ChunkState::Start,
            max_head,
        }
    }
    pub fn state(&self) -> ChunkState {
        self.state
    }
    pub fn is_done(&self) -> bool {
        self.state == ChunkState::Done
    }
    /// Bytes left in the chunk being read, if known
    pub fn remaining(&self) -> Option<u64> {
        match self.state {
            ChunkState::Data(left) => Some(left),
            ChunkState::Trailer | ChunkState::Done => Some(0),
            _ => None,
        }
    }
    /// Decodes as much of `input` as possible
    ///
    /// At most `limit` payload bytes are appended to `out`. Returns number
    /// of bytes of `input` consumed, the rest must be passed again with
    /// more data appended.
    pub fn decode(&mut self, input: &[u8], out: &mut Vec<u8>, limit: usize)
        -> Result<usize, Error>
    {
        use self::ChunkState::*;
        let mut pos = 0;
        let mut produced = 0;
        loop {
            let buf = &input[pos..];
            match self.state {
                Start => match httparse::parse_chunk_size(buf)? {
                    Status::Complete((n, 0)) => {
                        pos += n;
                        self.state = Trailer;
                    }
                    Status::Complete((n, size)) => {
                        pos += n;
                        self.state = Data(size);
                    }
                    Status::Partial => {
                        if buf.len() > self.max_head {
                            return Err(Error::BadChunk);
                        }
                        break;
                    }
                },
                Data(left) => {
                    if buf.is_empty() || produced >= limit {
                        break;
                    }
                    let n = min(left, min(buf.len(), limit - produced) as u64)
                        as usize;
                    out.extend_from_slice(&buf[..n]);
                    pos += n;
                    produced += n;
                    self.state = if left == n as u64 {
                        DataEnd
                    } else {
                        Data(left - n as u64)
                    };
                }
                DataEnd => {
                    if buf.len() < 2 {
                        break;
                    }
                    if &buf[..2] != b"\r\n" {
                        return Err(Error::BadChunk);
                    }
                    pos += 2;
                    self.state = Start;
                }
                Trailer => {
                    if buf.starts_with(b"\r\n") {
                        pos += 2;
                        self.state = Done;
                        break;
                    }
                    match buf.windows(2).position(|w| w == b"\r\n") {
                        // trailer headers are ignored
                        Some(idx) => pos += idx + 2,
                        None if buf.len() > self.max_head => {
                            return Err(Error::BadChunk);
                        }
                        None => break,
                    }
                }
                Done => break,
            }
        }
        Ok(pos)
    }
}
