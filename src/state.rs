//! Shared application state handed to every handler.
//!
//! Backends are constructed once here and injected into the services; no
//! component builds its own storage client or mailer.

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use std::sync::Arc;

use crate::{
    config::AppConfig,
    services::{
        cleanup_service::CleanupService,
        mailer::{LogMailer, Mailer, MemoryMailer, SmtpMailer},
        notification_service::NotificationService,
        relay_service::{PartRelay, PartTransport},
        storage::{MockStorage, ObjectStorage, create_storage},
        transfer_service::TransferService,
        upload_service::UploadService,
    },
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db: SqlitePool,
    pub storage: Arc<dyn ObjectStorage>,
    pub uploads: UploadService,
    pub relay: PartRelay,
    pub transfers: TransferService,
    pub notifications: NotificationService,
    pub cleanup: CleanupService,
}

/// State wired to in-memory backends, with handles to inspect them.
pub struct MockHarness {
    pub state: AppState,
    pub storage: Arc<MockStorage>,
    pub mailer: Arc<MemoryMailer>,
}

impl AppState {
    /// Build the backends selected by `config` and wire every service.
    pub async fn from_config(config: AppConfig, db: SqlitePool) -> Result<Self> {
        let backends = create_storage(&config)
            .await
            .context("initializing object storage")?;

        let mailer: Arc<dyn Mailer> = match &config.smtp {
            Some(smtp) => Arc::new(SmtpMailer::new(smtp).context("initializing SMTP mailer")?),
            None => {
                tracing::warn!("SMTP not configured; notifications are logged, not sent");
                Arc::new(LogMailer)
            }
        };

        Ok(Self::assemble(
            Arc::new(config),
            db,
            backends.storage,
            backends.transport,
            mailer,
        ))
    }

    /// Mock storage plus an in-memory mailer, regardless of `config`.
    pub fn with_mocks(config: AppConfig, db: SqlitePool) -> MockHarness {
        let storage = Arc::new(MockStorage::new(
            config.storage.bucket.clone(),
            config.uploads.part_url_ttl,
        ));
        let mailer = Arc::new(MemoryMailer::new());
        let state = Self::assemble(
            Arc::new(config),
            db,
            storage.clone(),
            storage.clone(),
            mailer.clone(),
        );
        MockHarness {
            state,
            storage,
            mailer,
        }
    }

    pub fn assemble(
        config: Arc<AppConfig>,
        db: SqlitePool,
        storage: Arc<dyn ObjectStorage>,
        transport: Arc<dyn PartTransport>,
        mailer: Arc<dyn Mailer>,
    ) -> Self {
        tracing::info!(
            storage = storage.backend_name(),
            mailer = mailer.name(),
            "application state assembled"
        );

        let uploads = UploadService::new(db.clone(), storage.clone(), config.clone());
        let transfers = TransferService::new(db.clone(), storage.clone(), config.clone());
        let notifications =
            NotificationService::new(db.clone(), mailer, transfers.clone(), config.clone());
        let cleanup = CleanupService::new(
            db.clone(),
            transfers.clone(),
            uploads.clone(),
            config.clone(),
        );

        Self {
            config,
            db,
            storage,
            uploads,
            relay: PartRelay::new(transport),
            transfers,
            notifications,
            cleanup,
        }
    }
}
