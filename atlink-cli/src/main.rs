//! atlink CLI - Command-line tool for scripted AT-command modem sessions.
//!
//! ## Features
//!
//! - Run session scripts (TOML) or built-in profiles against a modem
//! - HTTP download and firmware update flows for SIMCom modules
//! - Offline script validation
//! - Shell completion generation
//! - Environment variable support

use anyhow::{Context, Result};
use atlink::{CancelToken, Script};
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use console::style;
use env_logger::Env;
use log::debug;
use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Check if animations should be used (TTY and colors enabled).
fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

mod commands;
mod config;
mod observer;
mod script;

use commands::{check, completions, run};
use config::Config;

/// Default baud rate when neither the command line nor a config file sets one.
const DEFAULT_BAUD: u32 = 115_200;

/// atlink - Drive AT-command modems through scripted sessions.
///
/// Environment variables:
///   ATLINK_PORT   - Default serial port
///   ATLINK_BAUD   - Default baud rate (default: 115200)
#[derive(Parser)]
#[command(name = "atlink")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[command(after_help = "Examples:\n  \
    atlink -p /dev/ttyUSB2 fota --url http://host/update.bin --file update.bin\n  \
    atlink -p COM5 run session.toml --set url=http://host/data.bin\n  \
    atlink check --profile simcom-http --set url=x --set file=y")]
pub(crate) struct Cli {
    /// Serial port of the modem's AT interface.
    #[arg(short, long, global = true, env = "ATLINK_PORT")]
    port: Option<String>,

    /// Baud rate.
    #[arg(short, long, global = true, env = "ATLINK_BAUD")]
    baud: Option<u32>,

    /// Verbose output level (-v, -vv, -vvv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Where the script comes from and what it is given.
#[derive(clap::Args, Clone, Debug)]
pub(crate) struct ScriptArgs {
    /// Session script (TOML).
    #[arg(value_name = "SCRIPT", conflicts_with = "profile")]
    script: Option<PathBuf>,

    /// Built-in profile to use instead of a script file.
    #[arg(long)]
    profile: Option<String>,

    /// Set a script variable (name=value, can be repeated).
    #[arg(long = "set", value_name = "NAME=VALUE", value_parser = script::parse_var)]
    vars: Vec<(String, String)>,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Run a session script or built-in profile.
    Run {
        #[command(flatten)]
        script: ScriptArgs,

        /// Directory that download sinks and upload sources are relative to.
        #[arg(long, value_name = "DIR", default_value = ".")]
        dir: PathBuf,
    },

    /// Download a file over the modem's HTTP client.
    Download {
        /// URL to fetch.
        #[arg(long)]
        url: String,

        /// Local file to write.
        #[arg(short, long, value_name = "FILE")]
        output: PathBuf,
    },

    /// Download a firmware image, apply it and wait for the module.
    Fota {
        /// URL of the firmware image.
        #[arg(long)]
        url: String,

        /// Local copy of the image.
        #[arg(short, long, value_name = "FILE")]
        file: PathBuf,
    },

    /// Validate a script without touching the port.
    Check {
        #[command(flatten)]
        script: ScriptArgs,

        /// Output the step list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// List built-in profiles.
    Profiles {
        /// Output the list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type (detected from $SHELL if not specified).
        #[arg(value_enum)]
        shell: Option<Shell>,
    },
}

/// Errors the CLI classifies for its exit code.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Bad or missing arguments.
    #[error("{0}")]
    Usage(String),
    /// Unreadable configuration or script.
    #[error("{0}")]
    Config(String),
    /// Interrupted by the user.
    #[error("{0}")]
    Cancelled(String),
}

/// Map an error to the process exit code.
///
/// 2 usage, 3 configuration or script, 4 port unavailable, 130 cancelled,
/// 1 anything else.
fn exit_code_for(err: &anyhow::Error) -> u8 {
    if let Some(cli_err) = err.downcast_ref::<CliError>() {
        return match cli_err {
            CliError::Usage(_) => 2,
            CliError::Config(_) => 3,
            CliError::Cancelled(_) => 130,
        };
    }
    match err.downcast_ref::<atlink::Error>() {
        Some(atlink::Error::PortUnavailable { .. } | atlink::Error::ConfigurationRejected(_)) => 4,
        Some(atlink::Error::Cancelled) => 130,
        Some(atlink::Error::Script(_)) => 3,
        _ => 1,
    }
}

impl Cli {
    /// Serial port from the command line, environment or config.
    pub(crate) fn port_name(&self, config: &Config) -> Result<String> {
        self.port
            .clone()
            .or_else(|| {
                config
                    .port
                    .connection
                    .serial
                    .clone()
            })
            .ok_or_else(|| {
                CliError::Usage("no serial port given; use --port or ATLINK_PORT".to_string()).into()
            })
    }

    /// Baud rate: command line > environment > config > default.
    pub(crate) fn baud_rate(&self, config: &Config) -> u32 {
        self.baud
            .or(config
                .port
                .connection
                .baud)
            .unwrap_or(DEFAULT_BAUD)
    }
}

fn main() -> ExitCode {
    // --- NO_COLOR and TTY detection ---
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);

    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();

    // Setup logging based on verbosity
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    debug!(
        "atlink v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    match dispatch(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {err:#}", style("Error:").red().bold());
            ExitCode::from(exit_code_for(&err))
        },
    }
}

fn dispatch(cli: &Cli) -> Result<()> {
    let config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    match &cli.command {
        Commands::Run { script: args, dir } => {
            let (loaded, vars) = script::resolve(args, &config)?;
            run::cmd_run(cli, &config, &loaded, vars, dir)
        },
        Commands::Download { url, output } => {
            let loaded = script::builtin("simcom-http")?;
            let vars = preset_vars(&config, url, output)?;
            run::cmd_run(cli, &config, &loaded, vars, &PathBuf::from("."))
        },
        Commands::Fota { url, file } => {
            let loaded = script::builtin("simcom-lfota")?;
            let vars = preset_vars(&config, url, file)?;
            run::cmd_run(cli, &config, &loaded, vars, &PathBuf::from("."))
        },
        Commands::Check { script: args, json } => {
            let (loaded, vars) = script::resolve(args, &config)?;
            check::cmd_check(&loaded, &vars, *json)
        },
        Commands::Profiles { json } => script::cmd_profiles(*json),
        Commands::Completions { shell } => {
            let shell = shell
                .or_else(completions::detect_shell_type)
                .ok_or_else(|| {
                    CliError::Usage("specify a shell type, e.g.: atlink completions bash".to_string())
                })?;
            completions::cmd_completions(shell);
            Ok(())
        },
    }
}

/// Variables for the download and fota shortcuts.
fn preset_vars(
    config: &Config,
    url: &str,
    file: &std::path::Path,
) -> Result<BTreeMap<String, String>> {
    let file = file
        .to_str()
        .with_context(|| format!("file name {} is not valid UTF-8", file.display()))?;
    let mut vars = config
        .vars
        .clone();
    vars.insert("url".to_string(), url.to_string());
    vars.insert("file".to_string(), file.to_string());
    Ok(vars)
}

/// Install a Ctrl-C handler that cancels the session.
pub(crate) fn install_interrupt_handler() -> CancelToken {
    let token = CancelToken::new();
    let handler_token = token.clone();
    if let Err(e) = ctrlc::set_handler(move || handler_token.cancel()) {
        debug!("Could not install Ctrl-C handler: {e}");
    }
    token
}

/// Name shown for a script in messages.
pub(crate) fn script_label(script: &Script) -> &str {
    if script
        .name
        .is_empty()
    {
        "script"
    } else {
        &script.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_exit_code_mapping() {
        let usage: anyhow::Error = CliError::Usage("x".to_string()).into();
        assert_eq!(exit_code_for(&usage), 2);

        let config: anyhow::Error = CliError::Config("x".to_string()).into();
        assert_eq!(exit_code_for(&config), 3);

        let cancelled: anyhow::Error = CliError::Cancelled("x".to_string()).into();
        assert_eq!(exit_code_for(&cancelled), 130);

        let port: anyhow::Error = atlink::Error::PortUnavailable {
            port: "/dev/null0".to_string(),
            reason: "missing".to_string(),
        }
        .into();
        assert_eq!(exit_code_for(&port), 4);

        let interrupted: anyhow::Error = atlink::Error::Cancelled.into();
        assert_eq!(exit_code_for(&interrupted), 130);

        let generic = anyhow::anyhow!("boom");
        assert_eq!(exit_code_for(&generic), 1);
    }

    #[test]
    fn test_exit_code_survives_context() {
        let err = anyhow::Error::from(atlink::Error::Script("bad".to_string()))
            .context("checking script");
        assert_eq!(exit_code_for(&err), 3);
    }

    #[test]
    fn test_baud_resolution() {
        let cli = Cli::parse_from(["atlink", "profiles"]);
        let mut config = Config::default();
        assert_eq!(cli.baud_rate(&config), DEFAULT_BAUD);

        config.port.connection.baud = Some(460_800);
        assert_eq!(cli.baud_rate(&config), 460_800);

        let cli = Cli::parse_from(["atlink", "-b", "9600", "profiles"]);
        assert_eq!(cli.baud_rate(&config), 9600);
    }

    #[test]
    fn test_missing_port_is_usage_error() {
        let cli = Cli::parse_from(["atlink", "profiles"]);
        let err = cli
            .port_name(&Config::default())
            .unwrap_err();
        assert_eq!(exit_code_for(&err), 2);
    }
}
