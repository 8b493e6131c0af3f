// src/main.rs

//! Main entry point for mbtool.
//!
//! # Daemon Overview
//!
//! The daemon runs as root in the `init` domain. Apps reach it through an
//! abstract Unix socket; every connection is handled in its own process.
//!
//! ```ascii
//!
//! +---------------------------+                       +---------------------------+
//! |       mbtool daemon       |                       |     App (untrusted_app)   |
//! +---------------------------+                       +---------------------------+
//! | 1. Patches sepolicy so    |                       |                           |
//! |    apps may connect       |                       |                           |
//! | 2. Listens on             |                       |                           |
//! |    @mbtool.daemon         | <-[ 3.  connect() ]-- |                           |
//! | 4. fork()s a connection   |                       |                           |
//! |    process                |                       |                           |
//! +-----------|---------------+                       |                           |
//!             v                                       |                           |
//! +---------------------------+                       |                           |
//! |    Connection Process     |                       |                           |
//! +---------------------------+                       |                           |
//! | 5. Checks the peer UID's  |                       |                           |
//! |    package signatures     | --[ 6. ALLOW/DENY ]-> |                           |
//! |                           | <-[ 7.  version   ]-- |                           |
//! |                           | --[ 8. OK/UNSUPP. ]-> |                           |
//! | 9. Serves the negotiated  | <=[ 10. requests  ]=> |                           |
//! |    interface version      |                       |                           |
//! +---------------------------+                       +---------------------------+
//! ```
//!
//! This binary has multiple modes of operation based on its command-line arguments:
//! - `daemon [-d] [-r]`: Starts the daemon.
//! - `version`: Prints the mbtool version.

mod cli;
mod constants;
mod credentials;
mod daemon;
mod logging;
mod packages;
mod sepolicy;
mod server;
mod session;
mod utils;
mod v3;

use crate::constants::MBTOOL_VERSION;

const USAGE: &str = "Usage: mbtool <command> [<args>]

Available commands:
  daemon   Run the privileged daemon
  version  Print the mbtool version
";

/// Parses command-line arguments and dispatches to the correct logic.
fn start() -> i32 {
    let args: Vec<String> = std::env::args().collect();
    match args.get(1).map(String::as_str) {
        Some("daemon") => daemon::daemon_main(&args[1..]),
        Some("version") => {
            println!("mbtool {}", MBTOOL_VERSION);
            libc::EXIT_SUCCESS
        }
        _ => {
            eprint!("{USAGE}");
            libc::EXIT_FAILURE
        }
    }
}

fn main() {
    // Use the binary name as the log tag.
    let arg0 = std::env::args().next().unwrap_or_default();
    let process_name = arg0.split('/').next_back().unwrap_or("mbtool");
    logging::init(process_name);

    let code = start();
    log::logger().flush();
    std::process::exit(code);
}
