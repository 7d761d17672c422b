use crate::packet::Packet;
use crate::queue::Ctx;
use crate::request::Method;
use crate::stage::{Methods, Stage, StageKind, discard_incoming_data};


/// Answers requests that need no content handler
///
/// Failed and redirected requests end up here (their body is already
/// prepared by the response), as well as `OPTIONS` and `TRACE`.
pub struct PassHandler;

impl Stage for PassHandler {
    fn name(&self) -> &str {
        "passHandler"
    }
    fn kind(&self) -> StageKind {
        StageKind::Handler
    }
    fn methods(&self) -> Methods {
        Methods::ALL
    }
    fn is_virtual(&self) -> bool {
        true
    }
    fn incoming_data(&self, cx: &mut Ctx, packet: Packet) {
        discard_incoming_data(cx, packet);
    }
    fn run(&self, cx: &mut Ctx) {
        let answered = cx.req.failed || cx.resp.alt_body.is_some();
        match cx.req.method {
            Method::Options if !answered => {
                cx.resp.length = Some(0);
            }
            Method::Trace if !answered => {
                if cx.host().trace_method {
                    let head = cx.req.raw_head.clone();
                    cx.resp.mime_type = Some("message/http".into());
                    cx.resp.length = Some(head.len() as u64);
                    if let Err(e) = cx.write(&head, true) {
                        debug!("can't echo request head: {}", e);
                    }
                } else {
                    cx.resp.headers.set("Allow",
                        Methods::ALL.allow_header().replace(",TRACE", ""));
                    cx.fail_request(405, "TRACE method is disabled");
                }
            }
            _ => {}
        }
        cx.put_end();
    }
}
