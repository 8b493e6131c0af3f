// src/daemon.rs

//! The `daemon` sub-command.
//!
//! Startup runs in a fixed order: patch the SELinux policy, publish the
//! version property, get rid of old daemons, open the log file, optionally
//! detach, then bind the socket and serve connections until `accept()`
//! fails.

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use rustix::process::{self, Pid, Signal};
use std::env;
use std::fs::OpenOptions;
use std::io::Error;
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use crate::cli::{self, DaemonCli, DaemonCommand};
use crate::constants::{self, ProtocolVersion};
use crate::credentials::{self, CredentialVerifier};
use crate::logging;
use crate::packages::PackagesXml;
use crate::sepolicy;
use crate::server;
use crate::utils;
use crate::v3::{MessageLoop, NoCommands, VersionHandler};

/// Where the daemon finds and puts things.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonConfig {
    pub socket_name: String,
    pub log_file: PathBuf,
    pub policy_file: PathBuf,
    pub load_file: PathBuf,
    pub packages_xml: PathBuf,
    pub grace_period: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_name: constants::DAEMON_SOCKET_NAME.to_string(),
            log_file: constants::DAEMON_LOG_FILE.into(),
            policy_file: constants::SELINUX_POLICY_FILE.into(),
            load_file: constants::SELINUX_LOAD_FILE.into(),
            packages_xml: constants::PACKAGES_XML.into(),
            grace_period: constants::REPLACE_GRACE_PERIOD,
        }
    }
}

impl DaemonConfig {
    /// The defaults, with any non-empty path overrides from the environment.
    /// The package registry is never overridden.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());
        let mut config = Self::default();
        if let Some(name) = get(constants::ENV_SOCKET_NAME) {
            config.socket_name = name;
        }
        if let Some(path) = get(constants::ENV_LOG_FILE) {
            config.log_file = path.into();
        }
        if let Some(path) = get(constants::ENV_POLICY_FILE) {
            config.policy_file = path.into();
        }
        if let Some(path) = get(constants::ENV_LOAD_FILE) {
            config.load_file = path.into();
        }
        config
    }
}

/// Entry point of `mbtool daemon`. `args[0]` is the sub-command name.
/// Returns the process exit status.
pub fn daemon_main(args: &[String]) -> i32 {
    let cli = match cli::parse_daemon_args(args) {
        DaemonCommand::Run(cli) => cli,
        DaemonCommand::Help => {
            print!("{}", cli::DAEMON_USAGE);
            return libc::EXIT_SUCCESS;
        }
        DaemonCommand::Usage => {
            eprint!("{}", cli::DAEMON_USAGE);
            return libc::EXIT_FAILURE;
        }
    };

    match run_daemon(&cli, &DaemonConfig::from_env()) {
        Ok(()) => libc::EXIT_SUCCESS,
        Err(e) => {
            error!("Daemon failed: {e:?}");
            // The platform logger may not be stderr.
            #[cfg(target_os = "android")]
            eprintln!("Daemon failed: {e:?}");
            libc::EXIT_FAILURE
        }
    }
}

fn run_daemon(cli: &DaemonCli, config: &DaemonConfig) -> Result<()> {
    // Neither the policy patch nor the property is fatal.
    if let Err(e) = sepolicy::patch_daemon_policy(&config.policy_file, &config.load_file) {
        error!("Failed to patch sepolicy: {e:?}");
    }

    if process::getppid() == Some(Pid::INIT) {
        if let Err(e) = utils::set_property(constants::VERSION_PROPERTY, constants::MBTOOL_VERSION)
        {
            error!("Failed to set {}: {e:?}", constants::VERSION_PROPERTY);
        }
    }

    if cli.replace {
        replace_existing(config.grace_period);
    }

    logging::open_log_file(&config.log_file)?;

    info!("mbtool daemon {} starting", constants::MBTOOL_VERSION);
    log_environment();

    if cli.daemonize {
        daemonize()?;
    }

    server::reap_children_automatically()?;
    let listener = server::bind_daemon_socket(&config.socket_name, cli.replace)?;
    info!("Listening on @{}", config.socket_name);

    let verifier = CredentialVerifier::new(
        PackagesXml::new(&config.packages_xml),
        &credentials::VALID_CERTS,
    );
    server::run(&listener, &verifier, handler_for)
}

fn handler_for(_version: ProtocolVersion) -> Box<dyn VersionHandler> {
    Box::new(MessageLoop::new(NoCommands))
}

fn log_environment() {
    match utils::get_property("ro.build.version.sdk") {
        Ok(sdk) if !sdk.is_empty() => debug!("Android SDK version: {sdk}"),
        Ok(_) => debug!("Android SDK version: unknown"),
        Err(e) => warn!("Failed to read SDK version: {e:?}"),
    }

    let whitelist = &*credentials::VALID_CERTS;
    if whitelist.is_empty() {
        warn!("No whitelisted signatures; every client will be denied");
    } else {
        debug!("{} whitelisted signatures", whitelist.len());
    }
}

/// Whether a process with this name and command line is a running daemon.
fn is_daemon_process(comm: &str, cmdline: &[String]) -> bool {
    comm == constants::PROCESS_NAME && cmdline.get(1).is_some_and(|arg| arg.contains("daemon"))
}

/// Sends `SIGTERM` to every other running daemon, then gives them time to
/// exit. Failures are logged and otherwise ignored.
fn replace_existing(grace_period: Duration) {
    let own_pid = process::getpid().as_raw_nonzero().get();

    let processes = match procfs::process::all_processes() {
        Ok(processes) => processes,
        Err(e) => {
            error!("Failed to list processes: {e}");
            return;
        }
    };

    for proc in processes.flatten() {
        if proc.pid == own_pid {
            continue;
        }
        // Processes can exit while we look at them.
        let Ok(stat) = proc.stat() else { continue };
        let Ok(cmdline) = proc.cmdline() else { continue };
        if !is_daemon_process(&stat.comm, &cmdline) {
            continue;
        }

        debug!("Killing old daemon PID {}", proc.pid);
        let result = Pid::from_raw(proc.pid)
            .context("Invalid PID")
            .and_then(|pid| Ok(process::kill_process(pid, Signal::TERM)?));
        if let Err(e) = result {
            error!("Failed to kill PID {}: {e:?}", proc.pid);
        }
    }

    thread::sleep(grace_period);
}

/// Detaches from the terminal and the starting process.
///
/// Only the final grandchild returns. The starting process and the
/// intermediate child exit with status 0; a failure after the first fork
/// makes the child exit with status 1.
fn daemonize() -> Result<()> {
    log::logger().flush();
    match unsafe { libc::fork() } {
        0 => {}
        pid if pid > 0 => unsafe { libc::_exit(libc::EXIT_SUCCESS) },
        _ => return Err(Error::last_os_error()).context("Failed to fork"),
    }

    // --- Child Process ---
    if let Err(e) = detach() {
        error!("Failed to daemonize: {e:?}");
        log::logger().flush();
        unsafe { libc::_exit(libc::EXIT_FAILURE) };
    }
    Ok(())
}

fn detach() -> Result<()> {
    process::setsid().context("Failed to become session leader")?;

    unsafe {
        if libc::signal(libc::SIGHUP, libc::SIG_IGN) == libc::SIG_ERR {
            return Err(Error::last_os_error()).context("Failed to ignore SIGHUP");
        }
    }

    // A second fork makes sure we can never reacquire a controlling terminal.
    match unsafe { libc::fork() } {
        0 => {}
        pid if pid > 0 => unsafe { libc::_exit(libc::EXIT_SUCCESS) },
        _ => return Err(Error::last_os_error()).context("Failed to fork"),
    }

    // --- Grandchild Process ---
    env::set_current_dir("/").context("Failed to change directory to /")?;
    process::umask(rustix::fs::Mode::empty());

    let null = OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")
        .context("Failed to open /dev/null")?;
    for fd in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        if unsafe { libc::dup2(null.as_raw_fd(), fd) } < 0 {
            return Err(Error::last_os_error())
                .with_context(|| format!("Failed to redirect fd {fd} to /dev/null"));
        }
    }
    Ok(())
}
