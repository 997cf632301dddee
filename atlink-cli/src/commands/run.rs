//! Run command implementation.

use anyhow::{Context, Result};
use atlink::{FileStorage, Script, SerialConfig, SerialTransport, Session};
use console::style;
use log::debug;
use std::collections::BTreeMap;
use std::path::Path;

use crate::config::Config;
use crate::observer::ConsoleObserver;
use crate::{Cli, CliError, install_interrupt_handler, script_label};

/// Run `script` on the configured port.
pub(crate) fn cmd_run(
    cli: &Cli,
    config: &Config,
    script: &Script,
    vars: BTreeMap<String, String>,
    dir: &Path,
) -> Result<()> {
    let label = script_label(script);
    script
        .validate(
            vars.keys()
                .map(String::as_str),
        )
        .with_context(|| format!("Cannot run {label}"))?;

    let port = cli.port_name(config)?;
    let baud = cli.baud_rate(config);
    if !cli.quiet {
        eprintln!(
            "{} Using {} at {baud} baud",
            style("🔌").cyan(),
            style(&port).bold()
        );
    }

    let cancel = install_interrupt_handler();
    let serial = SerialConfig::new(&port, baud);
    let transport = SerialTransport::open(&serial, config.transport_config(), cancel.clone())
        .with_context(|| format!("Failed to open {port}"))?;

    let mut storage = FileStorage::new(dir);
    let mut observer = ConsoleObserver::new(
        script
            .steps
            .len(),
        cli.quiet,
    );
    let mut session = Session::new(transport, config.session_config(), &mut storage, &mut observer);
    for (name, value) in vars {
        session.set_var(name, value);
    }

    let report = match session.run(script) {
        Ok(report) => report,
        Err(_) if cancel.is_cancelled() => {
            return Err(CliError::Cancelled("Interrupted".to_string()).into());
        },
        Err(e) => return Err(anyhow::Error::from(e).context(format!("{label} failed"))),
    };

    for (name, value) in &report.vars {
        debug!("{name} = {value}");
    }

    if !cli.quiet {
        let mut details = Vec::new();
        if report.downloaded > 0 {
            details.push(format!("{} bytes downloaded", report.downloaded));
        }
        if report.uploaded > 0 {
            details.push(format!("{} bytes uploaded", report.uploaded));
        }
        if let Some(progress) = report.update_progress {
            details.push(format!("update at {progress}%"));
        }
        let details = if details.is_empty() {
            String::new()
        } else {
            format!(" ({})", details.join(", "))
        };
        eprintln!(
            "\n{} {label} completed: {} steps in {:.1?}{details}",
            style("🎉").green().bold(),
            report.steps,
            report.elapsed
        );
    }

    Ok(())
}
