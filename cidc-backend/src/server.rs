#![allow(async_fn_in_trait)]
use std::sync::Arc;

use anyhow::Context;
use axum::{Router, routing::get};
use camino::Utf8PathBuf;
use diesel_async::{
    AsyncPgConnection, RunQueryDsl,
    async_connection_wrapper::AsyncConnectionWrapper,
    pooled_connection::{
        AsyncDieselConnectionManager,
        deadpool::{Object, Pool},
    },
};
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};
use tokio::{net::TcpListener, signal};
use tower_http::trace::TraceLayer;
use util::DevContainer;
use uuid::Uuid;

use crate::{
    access,
    config::{Config, LOGIN_USER},
    db::{self, seed_data},
    storage::Storage,
    sync,
};

mod api;
pub mod auth;
pub mod util;

const DEV_DATA_BUCKET: &str = "cidc-dev-data";

/// # Errors
pub async fn serve(config: Config, log_dir: Option<Utf8PathBuf>) -> anyhow::Result<()> {
    let app_addr = config.app_address();
    let app_state = prepare(config, log_dir).await?;

    let app = app(app_state.clone());

    let listener = TcpListener::bind(&app_addr)
        .await
        .context(format!("failed to listen on {app_addr}"))?;
    tracing::info!("cidc-backend listening on {app_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(app_state))
        .await
        .context("failed to serve app")?;

    Ok(())
}

/// Rebuild every trial's relational tables from its stored document.
/// Returns the per-trial failures, after which nothing was kept.
///
/// # Errors
pub async fn sync_blobs(
    config: Config,
    log_dir: Option<Utf8PathBuf>,
    dry_run: bool,
) -> anyhow::Result<Vec<String>> {
    let app_state = prepare(config, log_dir).await?;
    let mut db_conn = app_state.db_conn().await?;

    let errors = sync::syncall_from_blobs(dry_run, &mut db_conn)
        .await
        .context("failed to sync trials")?;

    if errors.is_empty() {
        tracing::info!(dry_run, "synced all trials");
    } else {
        tracing::error!(n_errors = errors.len(), "sync rolled back");
    }

    Ok(errors)
}

/// # Errors
pub async fn disable_inactive_users(
    config: Config,
    log_dir: Option<Utf8PathBuf>,
) -> anyhow::Result<Vec<String>> {
    let app_state = prepare(config, log_dir).await?;
    let mut db_conn = app_state.db_conn().await?;

    let disabled = access::disable_inactive_users(app_state.storage(), &mut db_conn)
        .await
        .context("failed to disable inactive users")?;
    tracing::info!(n_disabled = disabled.len(), "disabled inactive users");

    Ok(disabled)
}

/// # Errors
pub async fn refresh_download_permissions(
    config: Config,
    log_dir: Option<Utf8PathBuf>,
) -> anyhow::Result<usize> {
    let app_state = prepare(config, log_dir).await?;
    let mut db_conn = app_state.db_conn().await?;

    Ok(
        access::refresh_download_permissions(app_state.storage(), &mut db_conn)
            .await
            .context("failed to refresh download permissions")?,
    )
}

/// Everything that happens before the first request: logging, secrets, the
/// database schema, the login user's password and the seeded admin.
async fn prepare(mut config: Config, log_dir: Option<Utf8PathBuf>) -> anyhow::Result<AppState> {
    initialize_logging(log_dir);

    config
        .read_secrets()
        .context("failed to read secrets directory")?;

    let mut app_state = AppState::new(config)
        .await
        .context("failed to initialize app state")?;
    tracing::info!(env = %app_state.config().env(), "initialized app state");

    let db_root_conn = app_state
        .db_root_conn()
        .await
        .context("failed to connect to database as root")?;

    run_migrations(db_root_conn)
        .await
        .context("failed to run database migrations")?;
    tracing::info!("ran database migrations");

    app_state
        .set_login_user_password()
        .await
        .context("failed to set password for login_user")?;

    app_state
        .seed_admin()
        .await
        .context("failed to insert seed data")?;

    app_state.drop_db_root_pool();

    Ok(app_state)
}

fn initialize_logging(log_dir: Option<Utf8PathBuf>) {
    use tracing::Level;
    use tracing_subscriber::{filter::Targets, prelude::*};

    let log_layer = tracing_subscriber::fmt::layer();

    // a second initialization, e.g. from tests, keeps the first subscriber
    let initialized = match log_dir {
        None => {
            let dev_log_filter = Targets::new()
                .with_target("cidc_backend", Level::DEBUG)
                .with_target("tower_http", Level::TRACE);
            let log_layer = log_layer.pretty().with_filter(dev_log_filter);

            tracing_subscriber::registry().with(log_layer).try_init()
        }
        Some(path) => {
            let log_writer = tracing_appender::rolling::daily(path, "cidc.log");
            let prod_log_filter = Targets::new()
                .with_target("cidc_backend", Level::INFO)
                .with_target("tower_http", Level::INFO);
            let log_layer = log_layer
                .json()
                .with_writer(log_writer)
                .with_filter(prod_log_filter);

            tracing_subscriber::registry().with(log_layer).try_init()
        }
    };

    if initialized.is_err() {
        tracing::debug!("logging was already initialized");
    }
}

#[derive(Clone)]
pub enum AppState {
    Dev {
        db_pool: Pool<AsyncPgConnection>,
        _pg_container: Arc<DevContainer>,
        admin_email: String,
        storage: Arc<Storage>,
        config: Arc<Config>,
    },
    Prod {
        db_pool: Pool<AsyncPgConnection>,
        db_root_pool: Option<Pool<AsyncPgConnection>>,
        verifier: Arc<auth::Verifier>,
        storage: Arc<Storage>,
        config: Arc<Config>,
    },
}

impl AppState {
    async fn new(config: Config) -> anyhow::Result<Self> {
        if config.is_dev() {
            Self::dev(config).await
        } else {
            Self::prod(config)
        }
    }

    async fn dev(config: Config) -> anyhow::Result<Self> {
        let pg_container = DevContainer::new("cidc-dev", false)
            .await
            .context("failed to start postgres container instance")?;

        let db_config =
            AsyncDieselConnectionManager::<AsyncPgConnection>::new(pg_container.db_url().await?);
        let db_pool = Pool::builder(db_config).build()?;

        let admin_email = config
            .seed_admin_email()
            .unwrap_or(seed_data::DEV_ADMIN_EMAIL)
            .to_string();

        let bucket = match config.gcs_data_bucket() {
            "" => DEV_DATA_BUCKET,
            bucket => bucket,
        };
        let storage = Storage::dry(bucket, config.gcs_lister_role());

        Ok(Self::Dev {
            db_pool,
            _pg_container: Arc::new(pg_container),
            admin_email,
            storage: Arc::new(storage),
            config: Arc::new(config),
        })
    }

    /// State for a deployed server. Connections are opened lazily, so this
    /// does not touch the database.
    ///
    /// # Errors
    pub fn prod(config: Config) -> anyhow::Result<Self> {
        let db_config =
            AsyncDieselConnectionManager::<AsyncPgConnection>::new(config.db_login_url());
        let db_pool = Pool::builder(db_config).build()?;

        let db_root_config =
            AsyncDieselConnectionManager::<AsyncPgConnection>::new(config.db_root_url());
        let db_root_pool = Some(Pool::builder(db_root_config).max_size(1).build()?);

        let http_client = reqwest::Client::new();
        let verifier = auth::Verifier::new(
            http_client.clone(),
            config.auth_domain(),
            config.auth_client_id(),
        );
        let storage = Storage::gcs(&config, http_client);

        Ok(Self::Prod {
            db_pool,
            db_root_pool,
            verifier: Arc::new(verifier),
            storage: Arc::new(storage),
            config: Arc::new(config),
        })
    }

    /// # Errors
    pub async fn db_conn(&self) -> db::error::Result<Object<AsyncPgConnection>> {
        use AppState::{Dev, Prod};

        match self {
            Dev { db_pool, .. } | Prod { db_pool, .. } => Ok(db_pool.get().await?),
        }
    }

    async fn db_root_conn(&self) -> db::error::Result<Object<AsyncPgConnection>> {
        let AppState::Prod { db_root_pool, .. } = self else {
            return self.db_conn().await;
        };

        let Some(db_root_pool) = db_root_pool else {
            return Err(db::error::Error::Other {
                message: "root user connection to database is no longer available".to_string(),
            });
        };

        Ok(db_root_pool.get().await?)
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        use AppState::{Dev, Prod};

        match self {
            Dev { config, .. } | Prod { config, .. } => config,
        }
    }

    #[must_use]
    pub fn storage(&self) -> &Storage {
        use AppState::{Dev, Prod};

        match self {
            Dev { storage, .. } | Prod { storage, .. } => storage,
        }
    }

    async fn set_login_user_password(&self) -> anyhow::Result<()> {
        let password = match self {
            AppState::Dev { .. } => Uuid::now_v7().to_string(),
            AppState::Prod { config, .. } => config.db_login_user_password().to_string(),
        };

        let mut db_conn = self.db_root_conn().await?;
        diesel::sql_query(format!(
            r#"alter user "{LOGIN_USER}" with password '{password}'"#
        ))
        .execute(&mut db_conn)
        .await?;

        Ok(())
    }

    /// Dev mode always has its admin. A deployed server seeds one only when
    /// an email is configured.
    async fn seed_admin(&self) -> anyhow::Result<()> {
        let email = match self {
            AppState::Dev { admin_email, .. } => admin_email.as_str(),
            AppState::Prod { config, .. } => match config.seed_admin_email() {
                Some(email) => email,
                None => return Ok(()),
            },
        };

        let mut db_conn = self.db_root_conn().await?;
        seed_data::seed_admin(email, &mut db_conn).await?;

        Ok(())
    }

    fn drop_db_root_pool(&mut self) {
        if let AppState::Prod { db_root_pool, .. } = self {
            *db_root_pool = None;
        }
    }
}

/// # Errors
pub async fn run_migrations(db_conn: Object<AsyncPgConnection>) -> anyhow::Result<()> {
    const MIGRATIONS: EmbeddedMigrations = embed_migrations!("../db/migrations");

    let mut wrapper: AsyncConnectionWrapper<Object<AsyncPgConnection>> =
        AsyncConnectionWrapper::from(db_conn);

    tokio::task::spawn_blocking(move || {
        wrapper
            .run_pending_migrations(MIGRATIONS)
            .map(|_| ())
            .map_err(|e| anyhow::anyhow!(e))
    })
    .await??;

    Ok(())
}

pub fn app(app_state: AppState) -> Router {
    api::router()
        .layer(TraceLayer::new_for_http())
        .route("/health", get(|| async {}))
        .with_state(app_state)
}

async fn shutdown_signal(app_state: AppState) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    tracing::info!("shutting down");
    drop(app_state);
}
