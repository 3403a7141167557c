pub mod config;
pub mod control;
pub mod keys;
pub mod layout;
pub mod logging;
pub mod muxbox;
pub mod process_manager;
pub mod runtime;
pub mod scroll_buffer;
pub mod stream;
pub mod style;
pub mod terminal_text;
pub mod variables;

use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Run(RunArgs),
    Send(SendArgs),
    Help,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunArgs {
    pub config: PathBuf,
    pub socket: Option<PathBuf>,
    pub interactive: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendArgs {
    pub json: String,
    pub socket: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CliParseError {
    MissingConfigPath,
    MissingJson,
    MissingSocketValue,
    UnknownCommand(String),
    UnknownArgument(String),
}

impl std::fmt::Display for CliParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CliParseError::MissingConfigPath => write!(f, "run requires a config file path"),
            CliParseError::MissingJson => write!(f, "send requires a JSON command"),
            CliParseError::MissingSocketValue => write!(f, "--socket requires a value"),
            CliParseError::UnknownCommand(cmd) => write!(f, "unknown command: {cmd}"),
            CliParseError::UnknownArgument(arg) => write!(f, "unknown argument: {arg}"),
        }
    }
}

impl std::error::Error for CliParseError {}

pub fn parse_command<I>(args: I) -> Result<Command, CliParseError>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter();
    let Some(cmd) = args.next() else {
        return Ok(Command::Help);
    };

    match cmd.as_str() {
        "--help" | "-h" | "help" => Ok(Command::Help),
        "run" => parse_run(args),
        "send" => parse_send(args),
        _ => Err(CliParseError::UnknownCommand(cmd)),
    }
}

fn parse_run<I>(args: I) -> Result<Command, CliParseError>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter();
    let mut config: Option<PathBuf> = None;
    let mut socket: Option<PathBuf> = None;
    let mut interactive = false;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--socket" => {
                let Some(path) = args.next() else {
                    return Err(CliParseError::MissingSocketValue);
                };
                socket = Some(PathBuf::from(path));
            }
            "--interactive" | "-i" => {
                interactive = true;
            }
            "--help" | "-h" => return Ok(Command::Help),
            other if other.starts_with('-') || config.is_some() => {
                return Err(CliParseError::UnknownArgument(other.to_owned()));
            }
            other => config = Some(PathBuf::from(other)),
        }
    }

    let Some(config) = config else {
        return Err(CliParseError::MissingConfigPath);
    };
    Ok(Command::Run(RunArgs {
        config,
        socket,
        interactive,
    }))
}

fn parse_send<I>(args: I) -> Result<Command, CliParseError>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter();
    let mut json: Option<String> = None;
    let mut socket: Option<PathBuf> = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--socket" => {
                let Some(path) = args.next() else {
                    return Err(CliParseError::MissingSocketValue);
                };
                socket = Some(PathBuf::from(path));
            }
            "--help" | "-h" => return Ok(Command::Help),
            other if other.starts_with('-') || json.is_some() => {
                return Err(CliParseError::UnknownArgument(other.to_owned()));
            }
            other => json = Some(other.to_owned()),
        }
    }

    let Some(json) = json else {
        return Err(CliParseError::MissingJson);
    };
    Ok(Command::Send(SendArgs { json, socket }))
}

pub fn print_usage() {
    eprintln!(
        "boxmux\n\nUSAGE:\n  boxmux run <CONFIG> [--socket <PATH>] [--interactive]\n  boxmux send <JSON> [--socket <PATH>]\n\nCOMMANDS:\n  run               Load a layout config, serve the control socket and run boxes until shutdown\n  send              Send one JSON control command and print the response line\n\nOPTIONS (run):\n  --socket <PATH>   Override the control socket path from the config\n  -i, --interactive Feed terminal keys to the runtime (hot keys, focus, PTY input)\n\nOPTIONS (send):\n  --socket <PATH>   Socket to connect to (default: $BOXMUX_SOCKET or /tmp/boxmux.sock)\n\nENVIRONMENT:\n  BOXMUX_SOCKET     Control socket path override\n  BOXMUX_LOG        Write logs to this file\n  BOXMUX_LOG_LEVEL  error|warn|info|debug|trace (default: info)\n\nGENERAL:\n  -h, --help        Print help\n"
    );
}

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
