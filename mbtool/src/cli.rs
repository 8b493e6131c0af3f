// src/cli.rs

//! Command line of the `daemon` sub-command.

use clap::Parser;

pub const DAEMON_USAGE: &str = "Usage: daemon [OPTION]...

Options:
  -d, --daemonize  Fork to background
  -r, --replace    Kill existing daemon (if any) before starting
  -h, --help       Display this help message
";

/// Run the privileged daemon.
#[derive(Debug, Default, PartialEq, Eq, Parser)]
#[command(
    name = "daemon",
    disable_help_flag = true,
    disable_version_flag = true,
    args_override_self = true
)]
pub struct DaemonCli {
    /// Fork to background.
    #[arg(short, long)]
    pub daemonize: bool,

    /// Kill existing daemon (if any) before starting.
    #[arg(short, long)]
    pub replace: bool,

    /// Display this help message.
    #[arg(short, long)]
    pub help: bool,
}

/// What `mbtool daemon` should do given its arguments.
#[derive(Debug, PartialEq, Eq)]
pub enum DaemonCommand {
    Run(DaemonCli),
    /// Print usage to stdout and exit successfully.
    Help,
    /// Print usage to stderr and fail.
    Usage,
}

/// Parses the arguments that follow `daemon`. `args[0]` is the command name.
pub fn parse_daemon_args<I, T>(args: I) -> DaemonCommand
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    match DaemonCli::try_parse_from(args) {
        Ok(cli) if cli.help => DaemonCommand::Help,
        Ok(cli) => DaemonCommand::Run(cli),
        Err(_) => DaemonCommand::Usage,
    }
}
