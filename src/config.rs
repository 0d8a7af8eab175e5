//! Run configuration loading: YAML file, then command-line overrides.
//!
//! Both layers are merged as YAML values before deserializing, so a flag and
//! the matching file key accept the same syntax and go through the same
//! validation.

use crate::RunOpts;
use anyhow::{bail, Context};
use loadtest_engine::RunConfig;
use serde_yaml::{Mapping, Value};
use std::path::Path;

/// Run duration used when neither the file nor the flags set one.
pub const DEFAULT_DURATION: &str = "60s";

/// Build and validate the run configuration.
pub fn load_config(opts: &RunOpts) -> anyhow::Result<RunConfig> {
    let mut doc = match &opts.config {
        Some(path) => read_config_file(path)?,
        None => Mapping::new(),
    };
    normalize_durations(&mut doc);
    overlay(&mut doc, opts)?;
    apply_defaults(&mut doc);

    let config: RunConfig =
        serde_yaml::from_value(Value::Mapping(doc)).context("Invalid run configuration")?;
    config.validate().context("Invalid run configuration")?;
    Ok(config)
}

/// Read a YAML configuration file into a mapping.
pub fn read_config_file(path: &Path) -> anyhow::Result<Mapping> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {path:?}"))?;
    match serde_yaml::from_str::<Value>(&content)
        .with_context(|| format!("Failed to parse config file {path:?}"))?
    {
        Value::Mapping(mapping) => Ok(mapping),
        Value::Null => Ok(Mapping::new()),
        _ => bail!("Config file {path:?} must contain a YAML mapping"),
    }
}

fn overlay(doc: &mut Mapping, opts: &RunOpts) -> anyhow::Result<()> {
    if let Some(workload) = &opts.workload {
        doc.insert("workload".into(), workload.as_str().into());
    }
    if let Some(workers) = opts.workers {
        doc.insert("workers".into(), number(workers as u64));
    }
    if let Some(connections) = opts.connections {
        doc.insert("connections".into(), number(connections as u64));
    }
    if let Some(scale) = opts.scale {
        doc.insert("scale".into(), number(scale));
    }
    for (key, value) in [
        ("duration", &opts.duration),
        ("shutdown_grace", &opts.shutdown_grace),
        ("operation_timeout", &opts.operation_timeout),
    ] {
        if let Some(value) = value {
            doc.insert(key.into(), normalize_duration(value).into());
        }
    }

    if let Some(url) = &opts.database_url {
        let database = doc
            .entry("database".into())
            .or_insert_with(|| Value::Mapping(Mapping::new()));
        match database {
            Value::Mapping(database) => {
                database.insert("url".into(), url.as_str().into());
            }
            _ => bail!("'database' must be a mapping"),
        }
    }

    append_paths(doc, "plugin_dirs", &opts.plugins.plugin_dirs)?;
    append_paths(doc, "plugins", &opts.plugins.plugins)?;

    if !opts.options.is_empty() {
        let options = doc
            .entry("workload_options".into())
            .or_insert_with(|| Value::Mapping(Mapping::new()));
        let Value::Mapping(options) = options else {
            bail!("'workload_options' must be a mapping");
        };
        for raw in &opts.options {
            let (key, value) = parse_option(raw)?;
            options.insert(key.into(), value);
        }
    }
    Ok(())
}

const DURATION_KEYS: [&str; 3] = ["duration", "shutdown_grace", "operation_timeout"];

// `duration: 30` in a file means thirty seconds, same as on the command line.
fn normalize_durations(doc: &mut Mapping) {
    for key in DURATION_KEYS {
        let secs = match doc.get(key) {
            Some(Value::Number(n)) => n.as_u64(),
            _ => None,
        };
        if let Some(secs) = secs {
            doc.insert(key.into(), format!("{secs}s").into());
        }
    }
}

fn apply_defaults(doc: &mut Mapping) {
    if !doc.contains_key("workers") {
        doc.insert("workers".into(), number(1));
    }
    if !doc.contains_key("connections") {
        if let Some(workers) = doc.get("workers").cloned() {
            doc.insert("connections".into(), workers);
        }
    }
    if !doc.contains_key("duration") {
        doc.insert("duration".into(), DEFAULT_DURATION.into());
    }
}

fn append_paths(doc: &mut Mapping, key: &str, paths: &[std::path::PathBuf]) -> anyhow::Result<()> {
    if paths.is_empty() {
        return Ok(());
    }
    let entry = doc
        .entry(key.into())
        .or_insert_with(|| Value::Sequence(Vec::new()));
    let Value::Sequence(seq) = entry else {
        bail!("'{key}' must be a list");
    };
    seq.extend(
        paths
            .iter()
            .map(|p| Value::String(p.to_string_lossy().into_owned())),
    );
    Ok(())
}

/// Split `KEY=VALUE`, reading VALUE as a YAML scalar so numbers stay numbers.
pub fn parse_option(raw: &str) -> anyhow::Result<(String, Value)> {
    let Some((key, value)) = raw.split_once('=') else {
        bail!("Invalid workload option '{raw}', expected KEY=VALUE");
    };
    let key = key.trim();
    if key.is_empty() {
        bail!("Invalid workload option '{raw}', empty key");
    }
    let value = serde_yaml::from_str(value.trim())
        .unwrap_or_else(|_| Value::String(value.trim().to_string()));
    Ok((key.to_string(), value))
}

/// Plain numbers are seconds ("300" means "300s").
pub fn normalize_duration(raw: &str) -> String {
    let raw = raw.trim();
    if !raw.is_empty() && raw.chars().all(|c| c.is_ascii_digit()) {
        format!("{raw}s")
    } else {
        raw.to_string()
    }
}

fn number(n: u64) -> Value {
    Value::Number(n.into())
}
