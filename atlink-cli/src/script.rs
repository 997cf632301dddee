//! Session script loading and built-in profiles.

use anyhow::{Context, Result};
use atlink::Script;
use console::style;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::config::Config;
use crate::{CliError, ScriptArgs};

/// Profile used when neither a script nor `--profile` is given.
pub(crate) const DEFAULT_PROFILE: &str = "simcom-lfota";

/// Scripts shipped with the binary.
const PROFILES: &[(&str, &str)] = &[
    ("simcom-http", include_str!("../profiles/simcom-http.toml")),
    ("simcom-lfota", include_str!("../profiles/simcom-lfota.toml")),
];

/// Parse a `--set` argument in the form `name=value`.
pub(crate) fn parse_var(s: &str) -> Result<(String, String), String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("Invalid format: '{s}'. Expected 'name=value' (e.g., 'url=http://host/fw.bin')"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("Invalid format: '{s}'. Variable name is empty"));
    }
    Ok((name.to_string(), value.to_string()))
}

/// Parse script text; `origin` names it in errors.
pub(crate) fn parse(text: &str, origin: &str) -> Result<Script> {
    toml::from_str(text).map_err(|e| CliError::Config(format!("Invalid script {origin}: {e}")).into())
}

/// Look up a built-in profile.
pub(crate) fn builtin(name: &str) -> Result<Script> {
    let (_, text) = PROFILES
        .iter()
        .find(|(profile, _)| *profile == name)
        .ok_or_else(|| {
            let known: Vec<&str> = PROFILES
                .iter()
                .map(|(profile, _)| *profile)
                .collect();
            CliError::Usage(format!(
                "Unknown profile '{name}'. Available: {}",
                known.join(", ")
            ))
        })?;
    parse(text, name)
}

/// Load a script file.
pub(crate) fn load_file(path: &Path) -> Result<Script> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read script {}", path.display()))?;
    parse(&text, &path.display().to_string())
}

/// Resolve the script and variables for a command.
///
/// Variables are the config file's `[vars]` overlaid with `--set` values.
pub(crate) fn resolve(args: &ScriptArgs, config: &Config) -> Result<(Script, BTreeMap<String, String>)> {
    let script = match (&args.script, &args.profile) {
        (Some(path), _) => load_file(path)?,
        (None, Some(profile)) => builtin(profile)?,
        (None, None) => builtin(DEFAULT_PROFILE)?,
    };

    let mut vars = config
        .vars
        .clone();
    vars.extend(
        args.vars
            .iter()
            .cloned(),
    );
    Ok((script, vars))
}

/// Profiles command implementation.
pub(crate) fn cmd_profiles(json: bool) -> Result<()> {
    let mut entries = Vec::with_capacity(PROFILES.len());
    for (name, _) in PROFILES {
        entries.push((*name, builtin(name)?));
    }

    if json {
        let list: Vec<_> = entries
            .iter()
            .map(|(name, script)| {
                serde_json::json!({
                    "name": name,
                    "description": script.description,
                    "steps": script.steps.len(),
                    "default": *name == DEFAULT_PROFILE,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&list)?);
        return Ok(());
    }

    for (name, script) in &entries {
        let marker = if *name == DEFAULT_PROFILE {
            style(" (default)").dim().to_string()
        } else {
            String::new()
        };
        println!("{}{marker}", style(name).green().bold());
        if !script.description.is_empty() {
            println!("    {}", script.description);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use atlink::Action;

    #[test]
    fn test_parse_var() {
        assert_eq!(
            parse_var("url=http://host/a?b=c").unwrap(),
            ("url".to_string(), "http://host/a?b=c".to_string())
        );
        assert_eq!(parse_var("empty=").unwrap(), ("empty".to_string(), String::new()));
        assert!(parse_var("novalue").is_err());
        assert!(parse_var("=x").is_err());
    }

    #[test]
    fn test_builtin_profiles_parse_and_validate() {
        for (name, _) in PROFILES {
            let script = builtin(name).unwrap();
            assert_eq!(script.name, *name);
            script
                .validate(["url", "file"])
                .unwrap();
        }
    }

    #[test]
    fn test_profiles_require_url_and_file() {
        let script = builtin("simcom-http").unwrap();
        assert!(script.validate(["url"]).is_err());
        assert!(script.validate(["file"]).is_err());
    }

    #[test]
    fn test_lfota_profile_shape() {
        let script = builtin("simcom-lfota").unwrap();
        let kinds: Vec<&str> = script
            .steps
            .iter()
            .map(|step| step.action.kind())
            .collect();
        assert!(kinds.contains(&"download"));
        assert!(kinds.contains(&"upload"));
        assert!(kinds.contains(&"monitor"));

        let reset = script
            .steps
            .iter()
            .find_map(|step| match &step.action {
                Action::Command(cmd) if cmd.send.as_deref() == Some("AT+CRESET") => Some(cmd),
                _ => None,
            })
            .unwrap();
        assert!(reset.expect.is_empty());
    }

    #[test]
    fn test_unknown_profile_is_usage_error() {
        let err = builtin("nope").unwrap_err();
        assert!(matches!(err.downcast_ref::<CliError>(), Some(CliError::Usage(_))));
    }

    #[test]
    fn test_invalid_script_is_config_error() {
        let err = parse("step = 3", "inline").unwrap_err();
        assert!(matches!(err.downcast_ref::<CliError>(), Some(CliError::Config(_))));
    }

    #[test]
    fn test_resolve_merges_vars() {
        let mut config = Config::default();
        config.vars.insert("url".to_string(), "http://config".to_string());
        config.vars.insert("file".to_string(), "fw.bin".to_string());
        let args = ScriptArgs {
            script: None,
            profile: Some("simcom-http".to_string()),
            vars: vec![("url".to_string(), "http://cli".to_string())],
        };

        let (script, vars) = resolve(&args, &config).unwrap();
        assert_eq!(script.name, "simcom-http");
        assert_eq!(vars["url"], "http://cli");
        assert_eq!(vars["file"], "fw.bin");
    }
}
