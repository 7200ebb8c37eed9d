//! Runtime configuration: the shape the rest of the server actually consumes,
//! built once at startup from the on-disk `Configuration` plus CLI overrides.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};

use super::env::EnvSource;
use super::manifest::{self, Configuration};

/// Runtime config for the serve system.
#[derive(Clone, Debug)]
pub struct RtcServe {
    /// Canonical path to the project root being served.
    pub project_root: PathBuf,
    /// The port to bind. May be incremented by the lifecycle controller on
    /// collision (see [`crate::lifecycle`]).
    pub port: u16,
    /// The validated deployment manifest.
    pub manifest: Arc<Configuration>,
    /// `env` merged over the local `.env` file, secrets resolved.
    pub env: HashMap<String, String>,
    /// `build.env` merged over the local `.env.build` file, secrets resolved.
    pub build_env: HashMap<String, String>,
    /// Open a browser tab once the initial build is complete.
    pub open: bool,
}

impl RtcServe {
    /// Construct a new instance from a loaded manifest and CLI overrides.
    #[tracing::instrument(level = "trace", skip(manifest))]
    pub fn new(
        project_root: PathBuf,
        port: u16,
        open: bool,
        manifest: Configuration,
    ) -> Result<Self> {
        let project_root = project_root
            .canonicalize()
            .with_context(|| format!("project root {:?} does not exist", project_root))?;

        let local_env = EnvSource::load(&project_root.join(".env"))?;
        let local_build_env = EnvSource::load(&project_root.join(".env.build"))?;

        // §6: dotenv files are merged *over* `env`/`build.env` — the local
        // file wins on a conflicting key, so it is the "overrides" operand.
        let env = manifest::resolve_secrets(&manifest.env, &local_env)?;
        let env = EnvSource::merge(&EnvSource::from_map(env), local_env.as_map());

        let build_env = manifest::resolve_secrets(&manifest.build.env, &local_build_env)?;
        let build_env = EnvSource::merge(&EnvSource::from_map(build_env), local_build_env.as_map());

        Ok(Self {
            project_root,
            port,
            manifest: Arc::new(manifest),
            env,
            build_env,
            open,
        })
    }
}
