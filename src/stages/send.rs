use crate::queue::Ctx;
use crate::stage::{Stage, StageKind};
use super::net::write_queue;


/// Connector for whole static files
///
/// Selected instead of the net connector when the file handler has no
/// filters after it. Entity packets are not materialized by the handler,
/// the file is copied to the socket in large pieces right here.
pub struct SendConnector;

impl Stage for SendConnector {
    fn name(&self) -> &str {
        "sendConnector"
    }
    fn kind(&self) -> StageKind {
        StageKind::Connector
    }
    fn outgoing_service(&self, cx: &mut Ctx) {
        write_queue(cx);
    }
}
