//! Check command implementation.

use anyhow::{Context, Result};
use atlink::Script;
use console::style;
use std::collections::BTreeMap;

use crate::script_label;

/// Validate `script` against `vars` and print its steps.
pub(crate) fn cmd_check(script: &Script, vars: &BTreeMap<String, String>, json: bool) -> Result<()> {
    let label = script_label(script);
    script
        .validate(
            vars.keys()
                .map(String::as_str),
        )
        .with_context(|| format!("{label} is not runnable"))?;

    if json {
        let steps: Vec<_> = script
            .steps
            .iter()
            .enumerate()
            .map(|(index, step)| {
                serde_json::json!({
                    "index": index + 1,
                    "name": step.name,
                    "action": step.action.kind(),
                })
            })
            .collect();
        let output = serde_json::json!({
            "name": script.name,
            "description": script.description,
            "vars": vars.keys().collect::<Vec<_>>(),
            "steps": steps,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!(
        "{} {} is valid ({} steps)",
        style("✓").green(),
        style(label).bold(),
        script
            .steps
            .len()
    );
    for (index, step) in script
        .steps
        .iter()
        .enumerate()
    {
        println!(
            "  {:>2}. {:<8} {}",
            index + 1,
            style(step.action.kind()).cyan(),
            step.name
        );
    }
    Ok(())
}
