//! Built-in handlers, filters and connectors
use crate::config::ServerContext;

mod auth;
mod chunk;
mod file;
mod net;
mod pass;
mod range;
mod send;
mod upload;

pub use self::auth::AuthFilter;
pub use self::chunk::ChunkFilter;
pub use self::file::FileHandler;
pub use self::net::NetConnector;
pub use self::pass::PassHandler;
pub use self::range::RangeFilter;
pub use self::send::SendConnector;
pub use self::upload::UploadFilter;


/// Registers the stages every server has
///
/// Handlers go first, so custom handlers added later are matched after the
/// built-in ones.
pub fn register_builtin(ctx: &mut ServerContext) {
    ctx.add_stage(PassHandler);
    ctx.add_stage(FileHandler);
    ctx.add_stage(AuthFilter);
    ctx.add_stage(RangeFilter);
    ctx.add_stage(ChunkFilter);
    ctx.add_stage(UploadFilter);
    ctx.add_stage(NetConnector);
    ctx.add_stage(SendConnector);
}
