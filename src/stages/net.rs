use std::io::{self, Read};

use crate::conn::{ConnCore, ConnState};
use crate::packet::Packet;
use crate::queue::Ctx;
use crate::request::Method;
use crate::stage::{Stage, StageKind};


/// Largest piece of a file read at once for entity packets
const FILE_CHUNK: usize = 65536;

/// Writes the response to the client socket
pub struct NetConnector;

impl Stage for NetConnector {
    fn name(&self) -> &str {
        "netConnector"
    }
    fn kind(&self) -> StageKind {
        StageKind::Connector
    }
    fn outgoing_service(&self, cx: &mut Ctx) {
        write_queue(cx);
    }
}

/// Writes as much of `buf` as the transport accepts without blocking
fn write_buf(conn: &mut ConnCore, buf: &[u8]) -> io::Result<usize> {
    let mut written = 0;
    while written < buf.len() {
        match conn.write(&buf[written..]) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => written += n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock
                || e.kind() == io::ErrorKind::TimedOut => break,
            Err(e) => return Err(e),
        }
    }
    Ok(written)
}

/// Writes a packet, returns `false` if it was written only partially
///
/// The unwritten rest stays in the packet: as its prefix or content, or
/// as the remaining entity length for lazy packets.
fn write_packet(cx: &mut Ctx, packet: &mut Packet) -> io::Result<bool> {
    if let Some(prefix) = packet.take_prefix() {
        let n = write_buf(cx.conn, &prefix)?;
        cx.resp.bytes_written += n as u64;
        if n < prefix.len() {
            packet.set_prefix(&prefix[n..]);
            return Ok(false);
        }
    }
    if packet.has_content() {
        let n = write_buf(cx.conn, packet.content())?;
        cx.resp.bytes_written += n as u64;
        packet.content_mut().drain(..n);
        return Ok(packet.content().is_empty());
    }
    while packet.entity_length() > 0 {
        let size = packet.entity_length().min(FILE_CHUNK as u64) as usize;
        let mut buf = vec![0u8; size];
        match cx.resp.file {
            Some(ref mut file) => file.read_exact(&mut buf)?,
            None => return Err(io::ErrorKind::NotFound.into()),
        }
        let left = packet.entity_length() - size as u64;
        packet.set_entity_length(left);
        let n = write_buf(cx.conn, &buf)?;
        cx.resp.bytes_written += n as u64;
        if n < size {
            packet.set_prefix(&buf[n..]);
            return Ok(false);
        }
    }
    Ok(true)
}

/// Prepares the header block in place of the header packet
fn fill_header(cx: &mut Ctx, packet: &mut Packet) {
    if cx.req.method == Method::Head || !cx.resp.body_allowed() {
        cx.resp.no_body = true;
    }
    let host = cx.conn.host.clone();
    let keep_alive = cx.conn.keep_alive_count;
    if let Some(head) = cx.resp.fill_headers(cx.req, &host, keep_alive) {
        if host.trace.enabled {
            debug!(target: "embed_http::trace", "response head:\n{}",
                   String::from_utf8_lossy(&head));
        }
        let content = packet.content_mut();
        content.extend_from_slice(&head);
        if !cx.resp.no_body {
            if let Some(ref body) = cx.resp.alt_body {
                content.extend_from_slice(body);
            }
        }
    }
}

/// Service routine shared by the connectors
///
/// On a short write the packet goes back to the queue and the connection
/// waits for the socket to become writable. The end packet completes the
/// request.
pub(crate) fn write_queue(cx: &mut Ctx) {
    cx.conn.write_blocked = false;
    while !cx.conn.disconnected {
        let mut packet = match cx.get() {
            Some(packet) => packet,
            None => return,
        };
        if packet.is_header() && !cx.resp.headers_created() {
            fill_header(cx, &mut packet);
        } else if packet.is_data()
            && (cx.resp.no_body || cx.resp.alt_body.is_some())
        {
            continue;
        }
        match write_packet(cx, &mut packet) {
            Ok(true) => {}
            Ok(false) => {
                cx.put_back(packet);
                cx.conn.write_blocked = true;
                return;
            }
            Err(e) => {
                debug!("error writing to {:?}: {}", cx.conn.peer, e);
                cx.disconnect();
                return;
            }
        }
        if packet.is_end() {
            debug!("response to {} {} is complete, {} bytes",
                   cx.req.method, cx.req.url, cx.resp.bytes_written);
            cx.conn.state = ConnState::Complete;
            return;
        }
    }
}
