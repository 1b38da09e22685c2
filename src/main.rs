use anyhow::{Context, Result};
use axum::Router;
use object_reconciler::{
    config::{AppConfig, Command},
    handlers::AppState,
    models::desired::ObjectConfig,
    reconcile::Reconciler,
    routes,
    state::StateStore,
    transport::sqlite::{SqliteTransport, run_migrations},
};
use serde::Serialize;
use serde_json::json;
use sqlx::{SqlitePool, sqlite::SqlitePoolOptions};
use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + command ---
    let (cfg, command) = AppConfig::from_env_and_args()?;

    tracing::info!("Starting object-reconciler with config: {:?}", cfg);

    // --- Ensure storage directories exist ---
    for dir in [&cfg.storage_dir, &cfg.state_dir] {
        if !Path::new(dir).exists() {
            fs::create_dir_all(dir)?;
            tracing::info!("Created directory at {}", dir);
        }
    }

    let db = connect(&cfg.database_url).await?;

    // --- Handle migration mode ---
    if matches!(command, Command::Migrate) {
        run_migrations(&db).await?;
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    let transport = Arc::new(SqliteTransport::new(db.clone(), &cfg.storage_dir));
    let reconciler = Reconciler::new(
        transport.clone(),
        StateStore::new(&cfg.state_dir),
        cfg.settings(),
    );

    match command {
        Command::Migrate => {}
        Command::BucketCreate {
            name,
            region,
            versioning,
            object_lock,
        } => {
            let bucket = transport
                .create_bucket(&name, region, versioning, object_lock)
                .await?;
            print_json(&bucket)?;
        }
        Command::BucketDelete { name } => {
            transport.delete_bucket(&name).await?;
            tracing::info!("Deleted bucket {}", name);
        }
        Command::Plan { config } => {
            let (name, config) = load_config(&config)?;
            print_json(&reconciler.plan(&name, config).await?)?;
        }
        Command::Apply { config } => {
            let (name, config) = load_config(&config)?;
            let outcome = reconciler.apply(&name, config).await?;
            print_json(&json!({
                "plan": outcome.plan,
                "state": outcome.state,
                "divergent": outcome.divergent,
            }))?;
            if let Some(err) = outcome.error {
                return Err(err).context("apply finished partially; re-run to converge");
            }
        }
        Command::Destroy { name } => match reconciler.destroy(&name).await? {
            Some(outcome) => print_json(&outcome)?,
            None => tracing::info!("no state for `{}`; nothing to destroy", name),
        },
        Command::Import { name, id } => {
            print_json(&reconciler.import(&name, &id).await?)?;
        }
        Command::Show { name } => match reconciler.read(&name).await? {
            Some(state) => print_json(&state)?,
            None => anyhow::bail!("resource `{}` not found", name),
        },
        Command::Resources => print_json(&reconciler.states().list().await?)?,
        Command::Serve => {
            let state = AppState {
                reconciler,
                db,
                storage_dir: PathBuf::from(&cfg.storage_dir),
            };
            serve(&cfg, routes::routes::routes().with_state(state)).await?;
        }
    }

    Ok(())
}

/// Open the SQLite pool, creating the database file's directory first.
async fn connect(db_url: &str) -> Result<Arc<SqlitePool>> {
    tracing::debug!("Connecting using raw URL => {}", db_url);

    // Extract the local file path SQLx will use
    let db_path = db_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("file:");
    tracing::debug!("Interpreted SQLite path => {}", db_path);

    let db_path_obj = Path::new(db_path);
    if let Some(parent) = db_path_obj.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    // SQLx will not create the file itself without mode=rwc
    if db_path != ":memory:" {
        if let Err(e) = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(db_path)
        {
            tracing::warn!("Failed to open file manually: {}", e);
        }
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(db_url)
        .await
        .with_context(|| format!("connecting to {}", db_url))?;
    Ok(Arc::new(pool))
}

async fn serve(cfg: &AppConfig, app: Router) -> Result<()> {
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    Ok(())
}

/// Read a JSON configuration file; the resource name defaults to the file stem.
fn load_config(path: &Path) -> Result<(String, ObjectConfig)> {
    let raw = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let config: ObjectConfig =
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
    let name = match &config.name {
        Some(name) => name.clone(),
        None => path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .with_context(|| format!("cannot derive a resource name from {}", path.display()))?,
    };
    Ok((name, config))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
