//! The on-disk deployment manifest and its validation.
//!
//! This is what the user provides. It gets loaded, migrated to its runtime
//! shape (`config::rt::RtcServe`), and never mutated again for the life of
//! the process.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{bail, ensure, Context, Result};
use serde::Deserialize;

use super::env::EnvSource;

/// The only manifest version this server accepts.
pub const SUPPORTED_VERSION: u32 = 2;

/// The persisted deployment manifest.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Configuration {
    pub version: u32,
    #[serde(default)]
    pub builds: Vec<BuildEntry>,
    #[serde(default)]
    pub routes: Vec<RouteEntry>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub build: BuildEnvSection,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct BuildEnvSection {
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// One `builds` entry: an entrypoint glob/path bound to a builder.
#[derive(Clone, Debug, Deserialize)]
pub struct BuildEntry {
    pub src: String,
    #[serde(rename = "use")]
    pub use_id: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

/// One `routes` entry, as written in the manifest (string fields, not yet
/// compiled into regexes).
#[derive(Clone, Debug, Deserialize)]
pub struct RouteEntry {
    pub src: String,
    #[serde(default)]
    pub dest: Option<String>,
    #[serde(default)]
    pub methods: Option<Vec<String>>,
    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,
    #[serde(default)]
    pub status: Option<u16>,
    #[serde(default)]
    pub r#continue: bool,
    #[serde(default)]
    pub check: bool,
}

/// Load and validate a manifest from `path` (defaulting to
/// `devdeploy.json` in `project_root`).
#[tracing::instrument(level = "trace", skip(project_root))]
pub fn load(project_root: &Path) -> Result<Configuration> {
    let manifest_path = project_root.join("devdeploy.json");
    let cfg = if manifest_path.is_file() {
        let raw = std::fs::read_to_string(&manifest_path)
            .with_context(|| format!("error reading {}", manifest_path.display()))?;
        serde_json::from_str::<Configuration>(&raw)
            .with_context(|| format!("error parsing {}", manifest_path.display()))?
    } else {
        // Zero-config: no manifest at all means version 2 with autodetection.
        Configuration {
            version: SUPPORTED_VERSION,
            ..Default::default()
        }
    };
    validate(&cfg)?;
    Ok(cfg)
}

fn validate(cfg: &Configuration) -> Result<()> {
    ensure!(
        cfg.version == SUPPORTED_VERSION,
        "unsupported configuration version {} (only version {} is accepted)",
        cfg.version,
        SUPPORTED_VERSION
    );
    for entry in &cfg.builds {
        if entry.src.is_empty() {
            bail!("a `builds` entry has an empty `src`");
        }
    }
    for route in &cfg.routes {
        if route.src.is_empty() {
            bail!("a `routes` entry has an empty `src`");
        }
    }
    Ok(())
}

/// Resolve `@secret-ref` values in `env`/`build.env` against the local env
/// files, erroring on anything left unresolved.
pub fn resolve_secrets(
    vars: &HashMap<String, String>,
    local: &EnvSource,
) -> Result<HashMap<String, String>> {
    let mut resolved = HashMap::with_capacity(vars.len());
    for (key, value) in vars {
        if let Some(secret_name) = value.strip_prefix('@') {
            let Some(secret_value) = local.get(secret_name) else {
                bail!("env var '{key}' references secret '@{secret_name}' which is not present in any local env file");
            };
            resolved.insert(key.clone(), secret_value.to_owned());
        } else {
            resolved.insert(key.clone(), value.clone());
        }
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unsupported_version() {
        let cfg = Configuration {
            version: 1,
            ..Default::default()
        };
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn accepts_version_two_with_empty_builds() {
        let cfg = Configuration {
            version: 2,
            ..Default::default()
        };
        assert!(validate(&cfg).is_ok());
    }

    #[test]
    fn resolves_secret_refs_from_local_env() {
        let mut local = HashMap::new();
        local.insert("API_KEY".to_string(), "s3cr3t".to_string());
        let local = EnvSource::from_map(local);

        let mut vars = HashMap::new();
        vars.insert("MY_KEY".to_string(), "@API_KEY".to_string());

        let resolved = resolve_secrets(&vars, &local).unwrap();
        assert_eq!(resolved.get("MY_KEY").unwrap(), "s3cr3t");
    }

    #[test]
    fn missing_secret_ref_is_an_error() {
        let local = EnvSource::from_map(HashMap::new());
        let mut vars = HashMap::new();
        vars.insert("MY_KEY".to_string(), "@NOPE".to_string());
        assert!(resolve_secrets(&vars, &local).is_err());
    }
}
