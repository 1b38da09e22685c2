use crate::reconcile::{MetadataUpdatePolicy, ReconcileSettings, tags::IgnoreTags};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::{env, path::PathBuf, str::FromStr};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    pub state_dir: String,
    pub ignore_tag_keys: Vec<String>,
    pub ignore_tag_key_prefixes: Vec<String>,
    pub metadata_update_policy: MetadataUpdatePolicy,
    pub governance_bypass: bool,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Declarative reconciler for versioned objects")]
pub struct Args {
    /// Host to bind to (overrides OBJECT_RECONCILER_HOST)
    #[arg(long, global = true)]
    pub host: Option<String>,

    /// Port to bind to (overrides OBJECT_RECONCILER_PORT)
    #[arg(long, global = true)]
    pub port: Option<u16>,

    /// Directory where object payloads are stored (overrides OBJECT_RECONCILER_STORAGE_DIR)
    #[arg(long, global = true)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides OBJECT_RECONCILER_DATABASE_URL)
    #[arg(long, global = true)]
    pub database_url: Option<String>,

    /// Directory for state records (overrides OBJECT_RECONCILER_STATE_DIR)
    #[arg(long, global = true)]
    pub state_dir: Option<String>,

    /// Comma-separated tag keys to ignore (overrides OBJECT_RECONCILER_IGNORE_TAG_KEYS)
    #[arg(long, global = true)]
    pub ignore_tag_keys: Option<String>,

    /// Comma-separated tag key prefixes to ignore (overrides OBJECT_RECONCILER_IGNORE_TAG_KEY_PREFIXES)
    #[arg(long, global = true)]
    pub ignore_tag_key_prefixes: Option<String>,

    /// `minimal` or `rewrite` (overrides OBJECT_RECONCILER_METADATA_UPDATE_POLICY)
    #[arg(long, global = true)]
    pub metadata_update_policy: Option<MetadataUpdatePolicy>,

    /// Allow deletes to bypass GOVERNANCE retention when force_destroy is set
    /// (overrides OBJECT_RECONCILER_GOVERNANCE_BYPASS)
    #[arg(long, global = true)]
    pub governance_bypass: Option<bool>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run migrations and exit
    Migrate,
    /// Create a bucket in the local store
    BucketCreate {
        name: String,
        #[arg(long, default_value = "local")]
        region: String,
        #[arg(long)]
        versioning: bool,
        #[arg(long)]
        object_lock: bool,
    },
    /// Delete a bucket, its object rows and payloads
    BucketDelete { name: String },
    /// Show what applying a configuration file would do
    Plan { config: PathBuf },
    /// Reconcile the store with a configuration file
    Apply { config: PathBuf },
    /// Delete a managed object and forget its state
    Destroy { name: String },
    /// Adopt an existing object, e.g. `s3://bucket/key`
    Import { name: String, id: String },
    /// Print the refreshed state of a managed object
    Show { name: String },
    /// List the names of every managed object
    Resources,
    /// Serve the HTTP control surface
    Serve,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and the command to run.
    pub fn from_env_and_args() -> Result<(Self, Command)> {
        // Parse CLI once
        let args = Args::parse();

        // --- Environment fallback ---
        let env_host = env::var("OBJECT_RECONCILER_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = env_parse("OBJECT_RECONCILER_PORT", 3000u16)?;
        let env_storage =
            env::var("OBJECT_RECONCILER_STORAGE_DIR").unwrap_or_else(|_| "./data/objects".into());
        let env_db = env::var("OBJECT_RECONCILER_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/object_store.db".into());
        let env_state =
            env::var("OBJECT_RECONCILER_STATE_DIR").unwrap_or_else(|_| "./data/state".into());
        let env_ignore_keys = env::var("OBJECT_RECONCILER_IGNORE_TAG_KEYS").unwrap_or_default();
        let env_ignore_prefixes =
            env::var("OBJECT_RECONCILER_IGNORE_TAG_KEY_PREFIXES").unwrap_or_default();
        let env_policy = env_parse(
            "OBJECT_RECONCILER_METADATA_UPDATE_POLICY",
            MetadataUpdatePolicy::Minimal,
        )?;
        let env_bypass = env_parse("OBJECT_RECONCILER_GOVERNANCE_BYPASS", true)?;

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
            state_dir: args.state_dir.unwrap_or(env_state),
            ignore_tag_keys: split_list(&args.ignore_tag_keys.unwrap_or(env_ignore_keys)),
            ignore_tag_key_prefixes: split_list(
                &args.ignore_tag_key_prefixes.unwrap_or(env_ignore_prefixes),
            ),
            metadata_update_policy: args.metadata_update_policy.unwrap_or(env_policy),
            governance_bypass: args.governance_bypass.unwrap_or(env_bypass),
        };

        Ok((cfg, args.command))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn settings(&self) -> ReconcileSettings {
        ReconcileSettings {
            ignore_tags: IgnoreTags::new(
                self.ignore_tag_keys.clone(),
                self.ignore_tag_key_prefixes.clone(),
            ),
            metadata_update_policy: self.metadata_update_policy,
            governance_bypass: self.governance_bypass,
        }
    }
}

/// Parse an env var, falling back to `default` when unset.
fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .map_err(|err| anyhow::anyhow!("{}", err))
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
