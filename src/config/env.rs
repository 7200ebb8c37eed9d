//! Dotenv-format file loading and the `env`/`build.env` merge rule.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;

static VALID_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_]*$").expect("static regex is valid"));

/// A parsed dotenv file, or an in-memory stand-in for one (used by tests and
/// by callers that already have resolved values).
#[derive(Clone, Debug, Default)]
pub struct EnvSource {
    vars: HashMap<String, String>,
}

impl EnvSource {
    pub fn from_map(vars: HashMap<String, String>) -> Self {
        Self { vars }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    /// The raw parsed vars, for use as the winning side of a [`Self::merge`]
    /// call.
    pub fn as_map(&self) -> &HashMap<String, String> {
        &self.vars
    }

    /// Parse a dotenv-format file. Missing files parse as empty, since both
    /// `.env` and `.env.build` are optional.
    #[tracing::instrument(level = "trace", skip_all, fields(path = %path.display()))]
    pub fn load(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("error reading env file {}", path.display()))?;
        Ok(Self::from_map(parse_dotenv(&raw)))
    }

    /// Merge `local` (lower precedence) with `overrides` (wins on conflict),
    /// dropping any key that fails the `^[A-Za-z][A-Za-z0-9_]*$` name check.
    pub fn merge(local: &Self, overrides: &HashMap<String, String>) -> HashMap<String, String> {
        let mut merged = local.vars.clone();
        for (key, value) in overrides {
            if !VALID_NAME.is_match(key) {
                tracing::warn!("dropping env var with invalid name: {key:?}");
                continue;
            }
            merged.insert(key.clone(), value.clone());
        }
        merged.retain(|key, _| VALID_NAME.is_match(key));
        merged
    }
}

fn parse_dotenv(raw: &str) -> HashMap<String, String> {
    let mut vars = HashMap::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let mut value = value.trim();
        if (value.starts_with('"') && value.ends_with('"') && value.len() >= 2)
            || (value.starts_with('\'') && value.ends_with('\'') && value.len() >= 2)
        {
            value = &value[1..value.len() - 1];
        }
        vars.insert(key.to_string(), value.to_string());
    }
    vars
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_basic_lines() {
        let parsed = parse_dotenv("FOO=bar\n# a comment\n\nBAZ=\"quoted value\"\n");
        assert_eq!(parsed.get("FOO").unwrap(), "bar");
        assert_eq!(parsed.get("BAZ").unwrap(), "quoted value");
        assert_eq!(parsed.len(), 2);
    }

    #[test]
    fn merge_is_right_biased_and_filters_invalid_names() {
        let mut local = HashMap::new();
        local.insert("FOO".to_string(), "local".to_string());
        let local = EnvSource::from_map(local);

        let mut overrides = HashMap::new();
        overrides.insert("FOO".to_string(), "override".to_string());
        overrides.insert("123BAD".to_string(), "dropped".to_string());

        let merged = EnvSource::merge(&local, &overrides);
        assert_eq!(merged.get("FOO").unwrap(), "override");
        assert!(!merged.contains_key("123BAD"));
    }

    #[test]
    fn merge_twice_is_idempotent() {
        let local = EnvSource::default();
        let mut overrides = HashMap::new();
        overrides.insert("A".to_string(), "1".to_string());
        let once = EnvSource::merge(&local, &overrides);
        let twice = EnvSource::merge(&EnvSource::from_map(once.clone()), &overrides);
        assert_eq!(once, twice);
    }
}
