// src/constants.rs

//! Defines global constants and protocol enums used throughout the daemon.

use log::LevelFilter;
use num_enum::TryFromPrimitive;
use std::time::Duration;

// --- Versioning Constants ---

/// The version of mbtool itself. Can be overridden at build time.
pub const MBTOOL_VERSION: &str = match option_env!("MBTOOL_VERSION") {
    Some(v) => v,
    None => env!("CARGO_PKG_VERSION"),
};

/// Comma-separated, hex encoded signing certificates of trusted clients.
/// Set at build time; an empty list authorizes nobody.
pub const VALID_CERTS: &str = match option_env!("MBTOOL_VALID_CERTS") {
    Some(v) => v,
    None => "",
};

// --- Configuration Constants ---

/// The maximum log level for the daemon. Set to `Trace` for debug builds and `Info` for release builds.
#[cfg(debug_assertions)]
pub const MAX_LOG_LEVEL: LevelFilter = LevelFilter::Trace;
#[cfg(not(debug_assertions))]
pub const MAX_LOG_LEVEL: LevelFilter = LevelFilter::Info;

/// Abstract socket name shared with the app.
pub const DAEMON_SOCKET_NAME: &str = "mbtool.daemon";

/// Installed package registry maintained by the package manager.
pub const PACKAGES_XML: &str = "/data/system/packages.xml";

/// The currently loaded SELinux policy.
pub const SELINUX_POLICY_FILE: &str = "/sys/fs/selinux/policy";
/// Writing a policy here makes the kernel load it.
pub const SELINUX_LOAD_FILE: &str = "/sys/fs/selinux/load";

pub const DAEMON_LOG_FILE: &str = "/data/media/0/MultiBoot/logs/daemon.log";

/// Reported when we were started by init.
pub const VERSION_PROPERTY: &str = "ro.multiboot.version";

/// How long `--replace` waits for old daemons to exit before binding.
pub const REPLACE_GRACE_PERIOD: Duration = Duration::from_millis(500);
/// Bind retries after `--replace`, in case an old daemon is slow to let go.
pub const REPLACE_BIND_ATTEMPTS: u32 = 10;
pub const REPLACE_BIND_INTERVAL: Duration = Duration::from_millis(100);

/// Process name used to find old daemons.
pub const PROCESS_NAME: &str = "mbtool";

// Environment overrides for the fixed paths above, used when running the
// daemon outside of a device.
pub const ENV_SOCKET_NAME: &str = "MBTOOL_DAEMON_SOCKET";
pub const ENV_LOG_FILE: &str = "MBTOOL_DAEMON_LOG";
pub const ENV_POLICY_FILE: &str = "MBTOOL_SELINUX_POLICY";
pub const ENV_LOAD_FILE: &str = "MBTOOL_SELINUX_LOAD";

// --- IPC Constants ---

/// Sent when the peer's signatures are whitelisted.
pub const RESPONSE_ALLOW: &str = "ALLOW";
/// Sent right before the connection is dropped for failing verification.
pub const RESPONSE_DENY: &str = "DENY";
/// Generic accepted response.
pub const RESPONSE_OK: &str = "OK";
/// Generic unsupported response.
pub const RESPONSE_UNSUPPORTED: &str = "UNSUPPORTED";

/// Upper bound for a single v3 message.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Interface versions a client may ask for.
#[derive(Debug, Eq, PartialEq, TryFromPrimitive, Copy, Clone)]
#[repr(i32)]
pub enum ProtocolVersion {
    /// Retired. Clients asking for it are turned away.
    V2 = 2,
    V3 = 3,
}

// --- SELinux rule added at startup ---

pub const APP_DOMAIN: &str = "untrusted_app";
pub const DAEMON_DOMAIN: &str = "init";
pub const SOCKET_CLASS: &str = "unix_stream_socket";
pub const CONNECT_PERM: &str = "connectto";
