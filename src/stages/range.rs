use std::process;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::Error;
use crate::packet::Packet;
use crate::queue::Ctx;
use crate::request::range::{Range, fix_lengths};
use crate::stage::{Stage, StageKind};


/// Cuts the requested byte ranges out of the entity
///
/// A single range is sent as is with `Content-Range`, several ranges make
/// a `multipart/byteranges` body.
pub struct RangeFilter;

struct Ranges {
    ranges: Vec<Range>,
    /// Index of the range being sent
    current: usize,
    /// Entity offset of the next packet
    pos: i64,
    boundary: Option<String>,
    mime: String,
    total: u64,
}

impl Ranges {
    fn part_header(&self, range: &Range) -> String {
        format!("\r\n--{}\r\nContent-Type: {}\r\nContent-Range: {}\r\n\r\n",
            self.boundary.as_deref().unwrap_or(""), self.mime,
            range.content_range(self.total))
    }
    fn final_boundary(&self) -> String {
        format!("\r\n--{}--\r\n", self.boundary.as_deref().unwrap_or(""))
    }
    fn body_length(&self) -> u64 {
        let parts: u64 = self.ranges.iter()
            .map(|r| self.part_header(r).len() as u64 + r.len as u64)
            .sum();
        parts + self.final_boundary().len() as u64
    }
}

fn make_boundary() -> String {
    let nanos = SystemTime::now().duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    format!("{:08X}{:08X}", process::id(), nanos)
}

/// Sets up the response for partial content
///
/// Returns `None` when the whole entity should be sent instead.
fn start(cx: &mut Ctx) -> Option<Ranges> {
    if cx.req.ranges.is_empty() || cx.req.failed || cx.resp.code != 200
        || cx.resp.alt_body.is_some()
    {
        return None;
    }
    let total = cx.resp.entity_length.or(cx.resp.length)?;
    let mut ranges = cx.req.ranges.clone();
    if let Err(e) = fix_lengths(&mut ranges, total) {
        debug!("{} for {} of {} bytes", e, cx.req.url, total);
        cx.resp.headers.set("Content-Range", format!("bytes */{}", total));
        cx.fail_request(416, &Error::RangeNotSatisfiable.to_string());
        return None;
    }
    let mut state = Ranges {
        current: 0,
        pos: 0,
        boundary: None,
        mime: cx.resp.mime_type.clone()
            .unwrap_or_else(|| "application/octet-stream".into()),
        total,
        ranges,
    };
    cx.resp.code = 206;
    cx.resp.accept_ranges = false;
    if state.ranges.len() == 1 {
        let range = state.ranges[0];
        cx.resp.content_range = Some(range.content_range(total));
        cx.resp.length = Some(range.len as u64);
    } else {
        let boundary = make_boundary();
        cx.resp.range_boundary = Some(boundary.clone());
        state.boundary = Some(boundary);
        cx.resp.length = Some(state.body_length());
    }
    Some(state)
}

/// Passes the data packet on or drops it, returns `false` on backpressure
fn filter_data(cx: &mut Ctx, state: &mut Ranges, mut packet: Packet) -> bool {
    loop {
        let range = match state.ranges.get(state.current) {
            Some(range) => *range,
            None => return true,
        };
        let len = packet.len() as i64;
        if len == 0 {
            return true;
        }
        if state.pos + len <= range.start {
            state.pos += len;
            return true;
        }
        if state.pos < range.start {
            let tail = packet.split((range.start - state.pos) as usize);
            state.pos = range.start;
            packet = tail;
            continue;
        }
        if state.pos >= range.end {
            state.current += 1;
            continue;
        }
        if state.pos + len > range.end {
            let tail = packet.split((range.end - state.pos) as usize);
            cx.put_back(tail);
        }
        if !cx.will_next_accept(&mut packet) {
            cx.put_back(packet);
            return false;
        }
        if state.boundary.is_some() && state.pos == range.start {
            let mut header = Packet::data(state.part_header(&range));
            header.range = true;
            cx.put_next(header);
        }
        state.pos += packet.len() as i64;
        if state.pos >= range.end {
            state.current += 1;
        }
        cx.put_next(packet);
        return true;
    }
}

impl Stage for RangeFilter {
    fn name(&self) -> &str {
        "rangeFilter"
    }
    fn kind(&self) -> StageKind {
        StageKind::Filter
    }
    fn outgoing_service(&self, cx: &mut Ctx) {
        let mut state = cx.take_data::<Ranges>();
        while let Some(mut packet) = cx.get() {
            if packet.is_header() && !cx.resp.headers_created() {
                state = start(cx);
            } else if packet.is_data() && !cx.resp.no_body {
                if let Some(ref mut ranges) = state {
                    if !filter_data(cx, ranges, packet) {
                        break;
                    }
                    continue;
                }
            } else if packet.is_end() {
                if let Some(ref ranges) = state {
                    if ranges.boundary.is_some() {
                        let mut last = Packet::data(ranges.final_boundary());
                        last.range = true;
                        cx.put_next(last);
                    }
                }
            }
            if !cx.will_next_accept(&mut packet) {
                cx.put_back(packet);
                break;
            }
            cx.put_next(packet);
        }
        if let Some(state) = state {
            cx.set_data(state);
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use crate::packet::Packet;
    use crate::queue::{Ctx, Direction, QueueSet};
    use crate::stage::{Stage, StageKind};
    use crate::test_util::{cx_for, Fixture};
    use super::RangeFilter;

    struct Sink;

    impl Stage for Sink {
        fn name(&self) -> &str { "sink" }
        fn kind(&self) -> StageKind { StageKind::Connector }
        fn outgoing_service(&self, _cx: &mut Ctx) {}
    }

    fn run(head: &str, body: &[u8]) -> (Fixture, Vec<u8>) {
        let mut fx = Fixture::new();
        fx.req = fx.request(head);
        fx.resp.length = Some(body.len() as u64);
        fx.resp.entity_length = Some(body.len() as u64);
        fx.resp.mime_type = Some("text/plain".into());
        let mut set = QueueSet::new();
        let filter = set.add(Arc::new(RangeFilter), Direction::Send,
                             1000, 1000);
        let sink = set.add(Arc::new(Sink), Direction::Send, 1000, 1000);
        let mut output = Vec::new();
        {
            let mut cx = cx_for(&mut fx, &mut set, filter);
            cx.put_for_service(Packet::header(), false);
            for piece in body.chunks(3) {
                cx.put_for_service(Packet::data(piece), false);
            }
            cx.put_for_service(Packet::end(), false);
            RangeFilter.outgoing_service(&mut cx);
            for p in cx.queues()[sink].packets() {
                output.extend(p.content());
            }
        }
        (fx, output)
    }

    #[test]
    fn single_range() {
        let (fx, out) = run("GET /x HTTP/1.1\r\nRange: bytes=2-6\r\n\r\n",
                            b"hello world");
        assert_eq!(out, b"llo w");
        assert_eq!(fx.resp.code, 206);
        assert_eq!(fx.resp.length, Some(5));
        assert_eq!(fx.resp.content_range.as_deref(), Some("bytes 2-6/11"));
    }

    #[test]
    fn suffix_range() {
        let (_, out) = run("GET /x HTTP/1.1\r\nRange: bytes=-3\r\n\r\n",
                           b"hello world");
        assert_eq!(out, b"rld");
    }

    #[test]
    fn multiple_ranges_have_exact_length() {
        let (fx, out) = run("GET /x HTTP/1.1\r\nRange: bytes=0-1,6-7\r\n\r\n",
                            b"hello world");
        let boundary = fx.resp.range_boundary.clone().unwrap();
        let text = String::from_utf8(out.clone()).unwrap();
        assert!(text.contains("Content-Range: bytes 0-1/11\r\n\r\nhe"));
        assert!(text.contains("Content-Range: bytes 6-7/11\r\n\r\nwo"));
        assert!(text.ends_with(&format!("\r\n--{}--\r\n", boundary)));
        assert_eq!(fx.resp.length, Some(out.len() as u64));
    }

    #[test]
    fn not_satisfiable() {
        let (fx, out) = run("GET /x HTTP/1.1\r\nRange: bytes=20-30\r\n\r\n",
                            b"hello world");
        assert!(out.is_empty());
        assert_eq!(fx.resp.code, 416);
        assert_eq!(fx.resp.headers.get("Content-Range"), Some("bytes */11"));
    }
}
