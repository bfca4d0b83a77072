//! Serves `index.html` from a directory; `404.html` there decides the
//! status for other targets.
//!
//! ```text
//! cargo run --example serve -- [ADDR] [ROOT]
//! ```
//!
//! `ADDR` defaults to `0.0.0.0:8000`, `ROOT` to the current directory.
//! Ctrl-C stops the server after in-flight responses finish.

use mhttpd::{limits::Documents, Server};
use std::{env, net::TcpListener};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_names(true)
        .init();

    let mut args = env::args().skip(1);
    let addr = args.next().unwrap_or_else(|| "0.0.0.0:8000".into());
    let root = args.next().unwrap_or_else(|| ".".into());

    let handle = Server::builder()
        .listener(TcpListener::bind(&addr)?)
        .documents(Documents::in_dir(root))
        .build()?
        .launch()?;

    let trigger = handle.shutdown_trigger();
    ctrlc::set_handler(move || {
        tracing::info!("shutdown requested");
        trigger.trigger();
    })?;

    handle.join()?;
    Ok(())
}
