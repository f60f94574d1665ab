mod cli;

use crate::cli::{Backend, Command, CLI};
use anyhow::{anyhow, Context};
use burrow_core::{Repository, ShortUrl, User};
use burrow_storage::shutdown::{self, Shutdown};
use burrow_storage::{InMemoryRepository, LogConfig, LogRepository, PgRepository};
use clap::Parser;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = CLI::parse();
    init_tracing(config.log_json);

    let backend = config.backend();
    let lanes = config.lanes();
    info!(backend = %backend, lanes, "opening repository");

    let (trigger, shutdown) = shutdown::channel();
    let repository = open_repository(&backend, &config, lanes, shutdown).await?;

    let outcome = tokio::select! {
        result = execute(repository.as_ref(), config.command) => result,
        _ = tokio::signal::ctrl_c() => {
            trigger.trigger();
            Err(anyhow!("interrupted"))
        }
    };

    if let Err(err) = repository.close().await {
        error!(error = %err, "failed to close repository");
    }

    match outcome {
        Ok(value) => {
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(())
        }
        Err(err) => {
            error!(error = %err, "command failed");
            Err(err)
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    if json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

async fn open_repository(
    backend: &Backend,
    config: &CLI,
    lanes: usize,
    shutdown: Shutdown,
) -> anyhow::Result<Arc<dyn Repository>> {
    let repository: Arc<dyn Repository> = match backend {
        Backend::Postgres(dsn) => Arc::new(
            PgRepository::connect(dsn, lanes, shutdown)
                .await
                .context("failed to connect to postgres")?,
        ),
        Backend::Log(path) => {
            let log_config = LogConfig::builder()
                .path(path.clone())
                .fsync(!config.no_fsync)
                .lanes(lanes)
                .build();
            Arc::new(
                LogRepository::open(log_config, shutdown)
                    .with_context(|| format!("failed to open log {}", path.display()))?,
            )
        }
        Backend::InMemory => {
            warn!("no DSN or log file configured, changes will not be persisted");
            Arc::new(InMemoryRepository::with_pipeline(lanes, shutdown))
        }
    };
    Ok(repository)
}

async fn execute(repository: &dyn Repository, command: Command) -> anyhow::Result<Value> {
    let value = match command {
        Command::UserCreate { id } => {
            let user = repository
                .user_create(User::with_id(id.unwrap_or_default()))
                .await?;
            serde_json::to_value(user)?
        }
        Command::UserGet { id } => serde_json::to_value(repository.user_get_by_id(id).await?)?,
        Command::UrlCreate {
            id,
            original_url,
            user_id,
        } => {
            let short_url = ShortUrl::new(id, original_url, user_id);
            repository.short_url_create(short_url.clone()).await?;
            serde_json::to_value(short_url)?
        }
        Command::UrlGet { id } => serde_json::to_value(repository.short_url_get_by_id(&id).await?)?,
        Command::UrlFind { original_url } => serde_json::to_value(
            repository
                .short_url_get_by_original_url(&original_url)
                .await?,
        )?,
        Command::UrlList { user_id } => {
            serde_json::to_value(repository.short_url_get_by_user_id(user_id).await?)?
        }
        Command::UrlDelete { owner_id, ids } => {
            let requested = ids.len();
            let deleted = repository.short_url_delete_batch(owner_id, ids).await?;
            json!({ "requested": requested, "deleted": deleted })
        }
        Command::Stats => json!({
            "users": repository.user_count().await?,
            "short_urls": repository.short_url_count().await?,
        }),
    };
    Ok(value)
}
