#![allow(dead_code)]

use std::cmp::min;
use std::io;
use std::sync::{Arc, Mutex};

use embed_http::{Conn, ServerContext, Transport};


#[derive(Default)]
struct Wire {
    input: Vec<u8>,
    closed: bool,
    output: Vec<u8>,
    /// Bytes accepted before writes start to block
    budget: Option<usize>,
    /// Largest write accepted at once
    max_write: Option<usize>,
}

/// In-memory socket end given to the connection
struct Pipe(Arc<Mutex<Wire>>);

/// The client end of the same socket
#[derive(Clone)]
pub struct Client(Arc<Mutex<Wire>>);

impl Transport for Pipe {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut wire = self.0.lock().unwrap();
        if wire.input.is_empty() {
            if wire.closed {
                return Ok(0);
            }
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = min(buf.len(), wire.input.len());
        buf[..n].copy_from_slice(&wire.input[..n]);
        wire.input.drain(..n);
        Ok(n)
    }
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut wire = self.0.lock().unwrap();
        let mut n = buf.len();
        if let Some(max) = wire.max_write {
            n = min(n, max);
        }
        if let Some(budget) = wire.budget {
            if budget == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            n = min(n, budget);
            wire.budget = Some(budget - n);
        }
        wire.output.extend_from_slice(&buf[..n]);
        Ok(n)
    }
}

impl Client {
    pub fn send(&self, data: &[u8]) {
        self.0.lock().unwrap().input.extend_from_slice(data);
    }
    pub fn close(&self) {
        self.0.lock().unwrap().closed = true;
    }
    pub fn output(&self) -> Vec<u8> {
        self.0.lock().unwrap().output.clone()
    }
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.output()).into_owned()
    }
    pub fn clear(&self) {
        self.0.lock().unwrap().output.clear();
    }
    pub fn set_budget(&self, budget: Option<usize>) {
        self.0.lock().unwrap().budget = budget;
    }
    pub fn set_max_write(&self, max: Option<usize>) {
        self.0.lock().unwrap().max_write = max;
    }
}

pub fn connect(ctx: &Arc<ServerContext>) -> (Conn, Client) {
    let wire = Arc::new(Mutex::new(Wire::default()));
    let conn = Conn::new(ctx.clone(), Box::new(Pipe(wire.clone())));
    (conn, Client(wire))
}

/// Single response taken apart
pub struct Response {
    pub status: u16,
    pub head: String,
    pub body: Vec<u8>,
}

impl Response {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.head.split("\r\n").skip(1).find_map(|line| {
            let mut pair = line.splitn(2, ':');
            let key = pair.next()?;
            if key.eq_ignore_ascii_case(name) {
                pair.next().map(|v| v.trim())
            } else {
                None
            }
        })
    }
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Splits the output into responses, bodies delimited by `Content-Length`
/// or by chunked encoding
pub fn responses(mut data: &[u8]) -> Vec<Response> {
    let mut result = Vec::new();
    while let Some(end) = find(data, b"\r\n\r\n") {
        let head = String::from_utf8_lossy(&data[..end]).into_owned();
        data = &data[end+4..];
        let status = head.split(' ').nth(1)
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        let mut resp = Response { status, head, body: Vec::new() };
        if status == 100 {
            result.push(resp);
            continue;
        }
        if resp.header("Transfer-Encoding") == Some("chunked") {
            let end = find(data, b"\r\n0\r\n\r\n")
                .map(|pos| pos + 7)
                .unwrap_or(data.len());
            // "0\r\n\r\n" when there is no data at all
            let end = if data.starts_with(b"0\r\n\r\n") { 5 } else { end };
            resp.body = data[..end].to_vec();
            data = &data[end..];
        } else if let Some(len) = resp.header("Content-Length")
            .and_then(|v| v.parse::<usize>().ok())
        {
            let len = min(len, data.len());
            resp.body = data[..len].to_vec();
            data = &data[len..];
        }
        result.push(resp);
    }
    result
}
