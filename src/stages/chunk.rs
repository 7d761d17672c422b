use crate::queue::Ctx;
use crate::request::Method;
use crate::stage::{Stage, StageKind};
use crate::version::Version;


/// Applies chunked transfer encoding to responses of unknown length
///
/// The decision is made when the header packet passes, so handlers may set
/// the length any time before they produce the first data. Every chunk
/// prefix starts with the line break ending the previous chunk (or the
/// header block, which is emitted without its final blank line).
pub struct ChunkFilter;

fn should_chunk(cx: &Ctx) -> bool {
    cx.resp.length.is_none()
        && cx.resp.alt_body.is_none()
        && !cx.resp.no_body
        && cx.resp.body_allowed()
        && cx.req.method != Method::Head
        && cx.req.version == Version::Http11
}

impl Stage for ChunkFilter {
    fn name(&self) -> &str {
        "chunkFilter"
    }
    fn kind(&self) -> StageKind {
        StageKind::Filter
    }
    fn outgoing_service(&self, cx: &mut Ctx) {
        while let Some(mut packet) = cx.get() {
            if packet.is_header() && !cx.resp.headers_created() {
                let chunked = should_chunk(cx);
                cx.resp.chunked = chunked;
            } else if cx.resp.chunked && packet.is_data() {
                if packet.is_empty() {
                    continue;
                }
                let size = cx.resp.chunk_size;
                cx.resize_packet(&mut packet, size);
            }
            if !cx.will_next_accept(&mut packet) {
                cx.put_back(packet);
                return;
            }
            if cx.resp.chunked {
                if packet.is_data() {
                    packet.set_prefix(format!("\r\n{:x}\r\n", packet.len()));
                } else if packet.is_end() {
                    packet.set_prefix(&b"\r\n0\r\n\r\n"[..]);
                }
            }
            cx.put_next(packet);
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use crate::packet::Packet;
    use crate::queue::{Direction, QueueSet};
    use crate::stage::{Stage, StageKind};
    use crate::test_util::{cx_for, Fixture};
    use super::ChunkFilter;

    struct Sink;

    impl Stage for Sink {
        fn name(&self) -> &str { "sink" }
        fn kind(&self) -> StageKind { StageKind::Connector }
        fn outgoing_service(&self, _cx: &mut crate::queue::Ctx) {}
    }

    #[test]
    fn prefixes() {
        let mut fx = Fixture::new();
        fx.req = fx.request("GET /x HTTP/1.1\r\n\r\n");
        fx.resp.chunk_size = 2;
        let mut set = QueueSet::new();
        let filter = set.add(Arc::new(ChunkFilter), Direction::Send, 100, 100);
        let sink = set.add(Arc::new(Sink), Direction::Send, 100, 100);
        let mut cx = cx_for(&mut fx, &mut set, filter);
        cx.put_for_service(Packet::header(), false);
        cx.put_for_service(Packet::data(&b"AAA"[..]), false);
        cx.put_for_service(Packet::end(), false);
        ChunkFilter.outgoing_service(&mut cx);
        assert!(cx.resp.chunked);
        let out: Vec<Vec<u8>> = cx.queues()[sink].packets()
            .map(|p| {
                let mut bytes = p.prefix().unwrap_or(b"").to_vec();
                bytes.extend(p.content());
                bytes
            })
            .collect();
        assert_eq!(out, vec![
            b"".to_vec(),
            b"\r\n2\r\nAA".to_vec(),
            b"\r\n1\r\nA".to_vec(),
            b"\r\n0\r\n\r\n".to_vec(),
        ]);
    }

    #[test]
    fn known_length_is_not_chunked() {
        let mut fx = Fixture::new();
        fx.req = fx.request("GET /x HTTP/1.1\r\n\r\n");
        fx.resp.length = Some(3);
        let mut set = QueueSet::new();
        let filter = set.add(Arc::new(ChunkFilter), Direction::Send, 100, 100);
        set.add(Arc::new(Sink), Direction::Send, 100, 100);
        let mut cx = cx_for(&mut fx, &mut set, filter);
        cx.put_for_service(Packet::header(), false);
        cx.put_for_service(Packet::data(&b"AAA"[..]), false);
        ChunkFilter.outgoing_service(&mut cx);
        assert!(!cx.resp.chunked);
    }
}
