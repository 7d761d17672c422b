use crate::auth::decode_basic;
use crate::config::AuthKind;
use crate::queue::Ctx;
use crate::stage::{Stage, StageKind};


/// Checks `Basic` credentials against the server's auth backend
///
/// Runs in `open`, before the handler is opened, so a rejected request
/// never touches the handler.
pub struct AuthFilter;

fn authenticate(cx: &mut Ctx) -> Result<String, &'static str> {
    let location = match cx.req.location.clone() {
        Some(location) => location,
        None => return Err("No location"),
    };
    let config = &location.auth;
    if cx.req.auth_type.as_deref() != Some("basic") {
        return Err("Access denied, missing credentials");
    }
    let (user, password) = cx.req.auth_details.as_deref()
        .and_then(decode_basic)
        .ok_or("Access denied, bad credentials")?;
    let backend = cx.conn.ctx.auth().clone();
    let required = backend.get_password(&config.realm, &user)
        .ok_or("Access denied, unknown user")?;
    if !backend.validate_credentials(&config.realm, &user, &password,
                                     &required)
    {
        return Err("Access denied, wrong password");
    }
    if !backend.authorize(&config.realm, &user, config) {
        return Err("Access denied, user is not authorized");
    }
    Ok(user)
}

impl Stage for AuthFilter {
    fn name(&self) -> &str {
        "authFilter"
    }
    fn kind(&self) -> StageKind {
        StageKind::Filter
    }
    fn open(&self, cx: &mut Ctx) {
        let (kind, realm) = match cx.req.location {
            Some(ref loc) => (loc.auth.kind, loc.auth.realm.clone()),
            None => return,
        };
        if kind == AuthKind::None || cx.req.failed {
            return;
        }
        match authenticate(cx) {
            Ok(user) => {
                debug!("user {:?} authenticated for {}", user, cx.req.url);
                cx.req.user = Some(user);
            }
            Err(msg) => {
                cx.resp.headers.set("WWW-Authenticate",
                    format!("Basic realm=\"{}\"", realm));
                cx.fail_request(401, msg);
            }
        }
    }
}
