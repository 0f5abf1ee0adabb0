//! # copperplated
//!
//! Standalone entry point binding a process to a Copperplate session:
//! parses the runtime flags, binds the shared arena, locks
//! memory, and mounts the registry, then idles so the session stays
//! live for other threads/processes to attach to.
//!
//! Prints a startup banner, sets up structured logging via
//! `tracing_subscriber`, and idles once the session is bound; there is
//! no network server here since this runtime has no wire protocol of
//! its own to serve.

use copperplate::runtime;
use copperplate::VERSION;
use tracing::{error, info};

fn print_banner() {
    println!("╭─────────────────────────────────────────────────────────╮");
    println!("│  copperplate {:<44}│", VERSION);
    println!("│  user-space real-time application runtime                │");
    println!("╰─────────────────────────────────────────────────────────╯");
}

fn main() -> copperplate::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    print_banner();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let rt = match runtime::init(args) {
        Ok(Some(rt)) => rt,
        Ok(None) => return Ok(()), // --help: usage already printed
        Err(e) => {
            error!(error = %e, "runtime init failed");
            std::process::exit(1);
        }
    };

    info!(session = rt.session.name(), mountpt = %rt.registry_mountpt, "session ready");
    println!();
    println!("Session '{}' is ready.", rt.session.name());
    println!("Registry mounted at: {}", rt.registry_mountpt);
    println!("Press Ctrl+C to end the session.");
    println!();

    // The session (arena, catalog, registry) outlives any single
    // thread that attached to it; this loop just keeps the process
    // alive so other threads have something to join, the same way
    // the source's daemon keeps running until killed.
    loop {
        std::thread::sleep(std::time::Duration::from_secs(1));
    }
}
