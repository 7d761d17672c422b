extern crate argparse;
extern crate embed_http;
extern crate env_logger;

use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;

use argparse::{ArgumentParser, Store, StoreOption, StoreTrue};
use embed_http::auth::Users;
use embed_http::config::{AuthConfig, AuthKind};
use embed_http::{Host, Location, Server, ServerContext};


fn main() {
    env_logger::init();

    let mut listen = "127.0.0.1:8080".to_string();
    let mut root = PathBuf::from(".");
    let mut threads = 2usize;
    let mut upload_dir = None::<PathBuf>;
    let mut password = None::<String>;
    let mut trace = false;
    {
        let mut ap = ArgumentParser::new();
        ap.set_description("Serves static files from a directory");
        ap.refer(&mut listen)
            .add_option(&["-l", "--listen"], Store,
                        "Address to listen on (default 127.0.0.1:8080)");
        ap.refer(&mut root)
            .add_argument("root", Store, "Document root (default .)");
        ap.refer(&mut threads)
            .add_option(&["-t", "--threads"], Store,
                        "Number of event loop threads");
        ap.refer(&mut upload_dir)
            .add_option(&["--upload-dir"], StoreOption,
                        "Directory for files posted to /upload");
        ap.refer(&mut password)
            .add_option(&["--admin-password"], StoreOption,
                        "Protect /private with basic auth for user `admin`");
        ap.refer(&mut trace)
            .add_option(&["--trace"], StoreTrue,
                        "Log request and response heads");
        ap.parse_args_or_exit();
    }

    let mut host = Host::new("localhost", &root);
    host.trace.enabled = trace;
    if let Some(dir) = upload_dir {
        host.add_location(Location::new("/upload").upload_dir(dir));
    }
    let mut users = Users::new();
    if let Some(ref password) = password {
        users.add_user("private", "admin", password);
        host.add_location(Location::new("/private").auth(AuthConfig {
            kind: AuthKind::Basic,
            realm: "private".into(),
            .. AuthConfig::default()
        }));
    }
    let mut ctx = ServerContext::new(host);
    ctx.set_auth_backend(users);

    let server = match Server::bind(&listen[..], Arc::new(ctx)) {
        Ok(server) => server,
        Err(e) => {
            eprintln!("Can't listen on {}: {}", listen, e);
            exit(1);
        }
    };
    println!("Serving {:?} on {}", root, listen);
    if let Err(e) = server.run_threads(threads) {
        eprintln!("Server failed: {}", e);
        exit(2);
    }
}
