// src/server.rs

//! The daemon's listening socket and accept loop.
//!
//! Every accepted connection is handled in its own forked process, so a
//! client that crashes or wedges its handler cannot affect the daemon or any
//! other client. The parent closes its copy of the connection right away and
//! goes back to accepting.

use anyhow::{Context, Result};
use log::{debug, error};
use std::io::{Error, ErrorKind};
use std::os::fd::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::panic::{self, AssertUnwindSafe};
use std::thread;

use crate::constants::{self, ProtocolVersion};
use crate::credentials::{CredentialVerifier, SignatureRegistry};
use crate::session;
use crate::utils;
use crate::v3::VersionHandler;

/// Binds the daemon socket.
///
/// With `retry`, an occupied name is retried for a short while; this covers
/// an old daemon that has not finished exiting after `--replace`. Without
/// it, an occupied name fails immediately so that two daemons never run side
/// by side.
pub fn bind_daemon_socket(name: &str, retry: bool) -> Result<UnixListener> {
    let attempts = if retry {
        constants::REPLACE_BIND_ATTEMPTS
    } else {
        1
    };

    let mut attempt = 1;
    loop {
        match utils::unix_listener_from_abstract(name) {
            Ok(listener) => return Ok(listener),
            Err(e) if e.kind() == ErrorKind::AddrInUse && attempt < attempts => {
                debug!("Socket {name} still in use (attempt {attempt}/{attempts})");
                attempt += 1;
                thread::sleep(constants::REPLACE_BIND_INTERVAL);
            }
            Err(e) if e.kind() == ErrorKind::AddrInUse => {
                error!("Is another instance running?");
                return Err(e).with_context(|| format!("Failed to bind socket {name}"));
            }
            Err(e) => return Err(e).with_context(|| format!("Failed to bind socket {name}")),
        }
    }
}

/// Lets the kernel reap finished connection processes.
///
/// `SIG_IGN` for `SIGCHLD` is not just a dummy handler: children of a
/// process ignoring it never become zombies.
pub fn reap_children_automatically() -> Result<()> {
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = libc::SIG_IGN;
        libc::sigemptyset(&mut sa.sa_mask);
        sa.sa_flags = 0;
        if libc::sigaction(libc::SIGCHLD, &sa, std::ptr::null_mut()) < 0 {
            return Err(Error::last_os_error()).context("Failed to set SIGCHLD handler");
        }
    }
    Ok(())
}

/// Picks the handler for a negotiated interface version.
pub type HandlerFactory = fn(ProtocolVersion) -> Box<dyn VersionHandler>;

/// Accepts connections until `accept()` fails.
pub fn run<R: SignatureRegistry>(
    listener: &UnixListener,
    verifier: &CredentialVerifier<R>,
    handler_for: HandlerFactory,
) -> Result<()> {
    debug!("Socket ready, waiting for connections");

    loop {
        let (stream, _) = listener
            .accept()
            .context("Failed to accept connection on socket")?;

        match unsafe { libc::fork() } {
            0 => {
                // --- Child Process ---
                // The listening socket must not outlive the daemon in a
                // lingering connection process.
                unsafe { libc::close(listener.as_raw_fd()) };
                let code = serve_connection(stream, verifier, handler_for);
                log::logger().flush();
                unsafe { libc::_exit(code) };
            }
            pid if pid > 0 => {
                // --- Parent Process ---
                debug!("Connection handed to PID {pid}");
                drop(stream);
            }
            _ => {
                error!("Failed to fork: {}", Error::last_os_error());
                drop(stream);
            }
        }
    }
}

/// Runs the handshake for one connection and returns the exit status for the
/// connection process.
fn serve_connection<R: SignatureRegistry>(
    stream: UnixStream,
    verifier: &CredentialVerifier<R>,
    handler_for: HandlerFactory,
) -> i32 {
    debug!("Accepted connection from fd {}", stream.as_raw_fd());

    // Release builds abort on panic, which also ends with a failure status.
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        session::handle_client(stream, verifier, handler_for)
    }));

    match result {
        Ok(Ok(outcome)) if outcome.is_success() => libc::EXIT_SUCCESS,
        Ok(Ok(outcome)) => {
            debug!("Session ended: {outcome:?}");
            error!("Killing connection");
            libc::EXIT_FAILURE
        }
        Ok(Err(e)) => {
            error!("{e:?}");
            error!("Killing connection");
            libc::EXIT_FAILURE
        }
        Err(_) => {
            error!("Connection handler panicked");
            libc::EXIT_FAILURE
        }
    }
}
