use std::fs::File;
use std::io::Read;

use crate::error::Error;
use crate::packet::Packet;
use crate::queue::Ctx;
use crate::request::{Method, unix_secs};
use crate::response::Response;
use crate::stage::{Stage, StageKind, discard_incoming_data};


/// Serves static files from the document root
///
/// The body is queued as a single entity packet. Unless the connector
/// reads the file itself (`Response::send_direct`) the entity is read in
/// pieces as the next queue makes room.
pub struct FileHandler;

fn read_entity(resp: &mut Response, packet: &mut Packet) -> Result<(), Error> {
    let file = match resp.file {
        Some(ref mut file) => file,
        None => return Err(Error::PrematureEndOfStream),
    };
    let mut buf = vec![0u8; packet.len()];
    file.read_exact(&mut buf)?;
    packet.set_entity_length(0);
    *packet.content_mut() = buf;
    Ok(())
}

impl Stage for FileHandler {
    fn name(&self) -> &str {
        "fileHandler"
    }
    fn kind(&self) -> StageKind {
        StageKind::Handler
    }
    fn incoming_data(&self, cx: &mut Ctx, packet: Packet) {
        discard_incoming_data(cx, packet);
    }
    fn open(&self, cx: &mut Ctx) {
        let info = match cx.req.info.clone() {
            Some(info) if !info.is_dir => info,
            _ => {
                let msg = format!("Cannot find {}", cx.req.url);
                cx.fail_request(404, &msg);
                return;
            }
        };
        let mtime = info.modified.map(unix_secs).unwrap_or(0);
        let etag = format!("\"{:x}-{:x}-{:x}\"", info.inode, info.size, mtime);
        cx.resp.etag = Some(etag.clone());
        cx.resp.last_modified = info.modified;
        if cx.req.content_not_modified(info.modified, Some(&etag)) {
            cx.resp.code = 304;
            cx.resp.no_body = true;
            return;
        }
        if !cx.req.ranges.is_empty()
            && !cx.req.if_range_matches(info.modified, Some(&etag))
        {
            debug!("If-Range does not match, sending whole {}", cx.req.url);
            cx.req.ranges.clear();
        }
        let mime = cx.host().mime_types.lookup(&info.path).to_string();
        cx.resp.mime_type = Some(mime);
        cx.resp.length = Some(info.size);
        cx.resp.entity_length = Some(info.size);
        cx.resp.accept_ranges = true;
        if cx.req.method == Method::Head {
            cx.resp.no_body = true;
            return;
        }
        match File::open(&info.path) {
            Ok(file) => cx.resp.file = Some(file),
            Err(e) => {
                error!("can't open {:?}: {}", info.path, e);
                let msg = format!("Cannot open {}", cx.req.url);
                cx.fail_request(404, &msg);
            }
        }
    }
    fn run(&self, cx: &mut Ctx) {
        if !cx.resp.no_body {
            if let Some(size) = cx.resp.entity_length.filter(|&s| s > 0) {
                cx.put_for_service(Packet::entity(size), true);
            }
        }
        cx.put_end();
    }
    fn outgoing_service(&self, cx: &mut Ctx) {
        while let Some(mut packet) = cx.get() {
            let lazy = packet.is_data() && !packet.has_content();
            if lazy && !cx.resp.send_direct {
                cx.resize_packet(&mut packet, 0);
            }
            if !cx.will_next_accept(&mut packet) {
                cx.put_back(packet);
                return;
            }
            if lazy && !cx.resp.send_direct {
                if let Err(e) = read_entity(cx.resp, &mut packet) {
                    error!("error reading {:?}: {}", cx.req.filename, e);
                    cx.fail_connection(500, "Can't read file");
                    cx.disconnect();
                    return;
                }
            }
            cx.put_next(packet);
        }
    }
}
