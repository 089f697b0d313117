use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use diesel_async::AsyncPgConnection;
use diesel_async::async_connection_wrapper::AsyncConnectionWrapper;
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::pooled_connection::deadpool::Object;
use diesel_async::pooled_connection::deadpool::Pool;
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};
use eyre::Result;
use octocrab::Octocrab;
use serde::Deserialize;
use url::Url;

use crate::github::clients::InstallationClients;
use crate::job::model::PgStore;
use crate::job::run::JobRunner;
use crate::readme::CrateDocGenerator;

/// Database connection pool type alias.
pub type DbPool = Pool<AsyncPgConnection>;

fn default_port() -> u16 {
    8080
}

#[derive(Deserialize)]
pub struct Config {
    pub base_url: Url,
    #[serde(default = "default_port")]
    pub port: u16,
    pub database_url: String,
    pub github: GitHub,
    #[serde(default)]
    pub job: Job,
    #[serde(default)]
    pub sentry_dsn: Option<String>,
}

impl Config {
    pub fn new(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            return Err(eyre::eyre!(
                "Config file not found: {}",
                config_path.display()
            ));
        }
        let config_str = std::fs::read_to_string(config_path)?;
        let config: Config = toml::from_str(&config_str)?;
        Ok(config)
    }
}

#[derive(Deserialize)]
pub struct GitHub {
    pub app_id: u64,
    pub app_name: String,
    pub private_key_path: PathBuf,
    pub webhook_secret: String,
}

fn default_job_timeout_seconds() -> u64 {
    60
}

#[derive(Deserialize)]
pub struct Job {
    #[serde(default = "default_job_timeout_seconds")]
    pub timeout_seconds: u64,
}

impl Default for Job {
    fn default() -> Self {
        Self {
            timeout_seconds: default_job_timeout_seconds(),
        }
    }
}

#[derive(Clone)]
pub struct AppState(Arc<InnerState>);

impl Deref for AppState {
    type Target = InnerState;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

pub struct InnerState {
    pub config: Config,
    pub pool: DbPool,
    pub github: Octocrab,
    pub installations: InstallationClients,
    pub runner: JobRunner,
}

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!();

impl AppState {
    pub async fn new(config: Config) -> Result<Self, eyre::Error> {
        let manager =
            AsyncDieselConnectionManager::<diesel_async::AsyncPgConnection>::new(&config.database_url);
        let pool = Pool::builder(manager)
            .build()
            .map_err(|e| eyre::eyre!("Failed to create database pool: {}", e))?;

        let pem = std::fs::read(&config.github.private_key_path).map_err(|e| {
            eyre::eyre!(
                "Failed to read GitHub App private key {}: {}",
                config.github.private_key_path.display(),
                e
            )
        })?;
        let app_private_key = jsonwebtoken::EncodingKey::from_rsa_pem(&pem)
            .map_err(|e| eyre::eyre!("Failed to parse GitHub private key: {}", e))?;

        let github = Octocrab::builder()
            .app(
                octocrab::models::AppId(config.github.app_id),
                app_private_key,
            )
            .build()?;

        let runner = JobRunner::new(
            Arc::new(PgStore::new(pool.clone())),
            Arc::new(CrateDocGenerator),
            Duration::from_secs(config.job.timeout_seconds),
        );

        let state = InnerState {
            config,
            pool,
            github,
            installations: InstallationClients::new(),
            runner,
        };

        Ok(Self(Arc::new(state)))
    }

    pub async fn run_migrations(self: &AppState) -> Result<()> {
        tracing::info!("Running database migrations");
        let conn = self.pool.get().await?;
        let mut async_wrapper: AsyncConnectionWrapper<Object<AsyncPgConnection>> =
            AsyncConnectionWrapper::from(conn);
        tokio::task::spawn_blocking(move || {
            async_wrapper.run_pending_migrations(MIGRATIONS).unwrap();
        })
        .await?;
        Ok(())
    }
}
