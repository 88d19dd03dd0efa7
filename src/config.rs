//! Engine configuration.
//!
//! Defaults are rooted at a data directory; every field can be overridden
//! from `PULL_INTEGRATOR_*` environment variables.

use std::path::PathBuf;
use std::time::Duration;

use crate::git::GitConfig;
use crate::git::resolve::ResolverStrategy;
use crate::squash::SquashBudget;
use crate::types::Signature;

/// Default data directory when `PULL_INTEGRATOR_DATA_DIR` is unset.
pub const DEFAULT_DATA_DIR: &str = "/var/lib/pull-integrator";

/// Default interval between synchronization sweeps (10 minutes).
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 10 * 60;

const ENV_PREFIX: &str = "PULL_INTEGRATOR_";

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub git: GitConfig,

    /// Retarget proposals based on a merged branch that gets deleted.
    pub retarget_on_merge: bool,

    /// Title prefixes marking a proposal as work in progress.
    pub wip_prefixes: Vec<String>,

    pub squash: SquashBudget,

    /// Forces a resolver strategy; detected from the git version when unset.
    pub resolver: Option<ResolverStrategy>,

    /// Committer for engine-made commits; the acting user when unset.
    pub committer: Option<Signature>,

    pub sweep_interval: Duration,

    pub state_file: PathBuf,

    pub policy_file: Option<PathBuf>,
}

impl EngineConfig {
    /// Default configuration rooted at `data_dir`.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        EngineConfig {
            git: GitConfig {
                repos_root: data_dir.join("repositories"),
                workspace_root: data_dir.join("tmp").join("workspaces"),
                ref_prefix: "pull".to_string(),
                workspace_max_age: Duration::from_secs(24 * 3600),
            },
            retarget_on_merge: true,
            wip_prefixes: vec!["WIP:".to_string(), "[WIP]".to_string()],
            squash: SquashBudget::default(),
            resolver: None,
            committer: None,
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            state_file: data_dir.join("state.json"),
            policy_file: None,
        }
    }

    /// Reads the configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary variable lookup.
    ///
    /// Unparseable values fall back to the default and are logged.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |name: &str| {
            lookup(&format!("{}{}", ENV_PREFIX, name)).filter(|v| !v.trim().is_empty())
        };
        let parsed = |name: &str| -> Option<u64> {
            let raw = var(name)?;
            match raw.trim().parse::<u64>() {
                Ok(n) => Some(n),
                Err(_) => {
                    tracing::warn!(variable = name, value = %raw, "ignoring unparseable number");
                    None
                }
            }
        };
        let flag = |name: &str| -> Option<bool> {
            let raw = var(name)?;
            match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Some(true),
                "0" | "false" | "no" | "off" => Some(false),
                _ => {
                    tracing::warn!(variable = name, value = %raw, "ignoring unparseable flag");
                    None
                }
            }
        };

        let mut config = Self::new(var("DATA_DIR").unwrap_or_else(|| DEFAULT_DATA_DIR.to_string()));

        if let Some(root) = var("REPOS_ROOT") {
            config.git.repos_root = root.into();
        }
        if let Some(root) = var("WORKSPACE_ROOT") {
            config.git.workspace_root = root.into();
        }
        if let Some(prefix) = var("REF_PREFIX") {
            config.git.ref_prefix = prefix.trim().trim_matches('/').to_string();
        }
        if let Some(hours) = parsed("WORKSPACE_MAX_AGE_HOURS") {
            config.git.workspace_max_age = Duration::from_secs(hours * 3600);
        }
        if let Some(enabled) = flag("RETARGET_ON_MERGE") {
            config.retarget_on_merge = enabled;
        }
        if let Some(prefixes) = var("WIP_PREFIXES") {
            config.wip_prefixes = prefixes
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(enabled) = flag("SQUASH_FROM_COMMITS") {
            config.squash.populate_from_commits = enabled;
        }
        if let Some(limit) = parsed("SQUASH_COMMITS_LIMIT") {
            config.squash.message_commits = Some(limit as usize);
        }
        if let Some(size) = parsed("SQUASH_MAX_SIZE") {
            config.squash.max_size = Some(size as usize);
        }
        if let Some(all) = flag("SQUASH_ALL_AUTHORS") {
            config.squash.extra_author_commits = if all { None } else { Some(0) };
        }
        if let Some(raw) = var("RESOLVER") {
            match raw.trim().parse::<ResolverStrategy>() {
                Ok(strategy) => config.resolver = Some(strategy),
                Err(e) => tracing::warn!(error = %e, "ignoring resolver override"),
            }
        }
        if let (Some(name), Some(email)) = (var("COMMITTER_NAME"), var("COMMITTER_EMAIL")) {
            config.committer = Some(Signature { name, email });
        }
        if let Some(secs) = parsed("SWEEP_INTERVAL_SECS") {
            config.sweep_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(path) = var("STATE_FILE") {
            config.state_file = path.into();
        }
        if let Some(path) = var("POLICY_FILE") {
            config.policy_file = Some(path.into());
        }

        config
    }
}
