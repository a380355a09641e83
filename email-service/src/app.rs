use std::sync::Arc;

use anyhow::{Error, Result, anyhow};
use tokio::{net::TcpListener, signal, sync::watch, task::JoinHandle};
use tracing::{error, info, warn};

use crate::{
    api::{AppState, router, run_api_server},
    clients::{
        broker::Broker,
        database::DatabaseClient,
        memory::{MemoryBroker, MemoryStore},
        rbmq::RabbitMqBroker,
        redis::RedisTemplateCache,
        smtp::{Mailer, SmtpMailer},
    },
    config::{BrokerBackend, Config, ServiceRole, StorageBackend},
    services::{ingress::IngressService, template::TemplateService},
    store::{OutboxStore, TemplateCache, TemplateRepository},
    workers::{DeliveryPolicy, Dispatcher, spawn_workers},
};

/// The backing services every role is built from.
pub struct Components {
    pub store: Arc<dyn OutboxStore>,
    pub templates: Arc<dyn TemplateRepository>,
    pub cache: Option<Arc<dyn TemplateCache>>,
    pub broker: Arc<dyn Broker>,
    pub mailer: Arc<dyn Mailer>,
}

impl Components {
    pub async fn connect(config: &Config) -> Result<Self, Error> {
        let (store, templates): (Arc<dyn OutboxStore>, Arc<dyn TemplateRepository>) =
            match config.storage_backend {
                StorageBackend::Postgres => {
                    let url = config
                        .database_url
                        .as_deref()
                        .ok_or_else(|| anyhow!("DATABASE_URL is not set"))?;
                    let database = Arc::new(DatabaseClient::connect(url).await?);
                    database.migrate().await?;
                    let store: Arc<dyn OutboxStore> = database.clone();
                    let templates: Arc<dyn TemplateRepository> = database;
                    (store, templates)
                }
                StorageBackend::Memory => {
                    let memory = Arc::new(MemoryStore::new());
                    let store: Arc<dyn OutboxStore> = memory.clone();
                    let templates: Arc<dyn TemplateRepository> = memory;
                    (store, templates)
                }
            };

        let broker: Arc<dyn Broker> = match config.broker_backend {
            BrokerBackend::Rabbitmq => Arc::new(RabbitMqBroker::connect(config).await?),
            BrokerBackend::Memory => Arc::new(MemoryBroker::new()),
        };

        let cache = match &config.redis_url {
            Some(url) => {
                match RedisTemplateCache::connect(url, config.template_cache_ttl_seconds).await {
                    Ok(cache) => Some(Arc::new(cache) as Arc<dyn TemplateCache>),
                    Err(e) => {
                        warn!(error = %e, "Template cache unavailable, continuing without it");
                        None
                    }
                }
            }
            None => None,
        };

        let mailer: Arc<dyn Mailer> = Arc::new(SmtpMailer::new(config.smtp_settings()));

        Ok(Self {
            store,
            templates,
            cache,
            broker,
            mailer,
        })
    }

    pub fn template_service(&self) -> Arc<TemplateService> {
        let service = TemplateService::new(Arc::clone(&self.templates));
        Arc::new(match &self.cache {
            Some(cache) => service.with_cache(Arc::clone(cache)),
            None => service,
        })
    }

    pub fn app_state(&self, config: &Config) -> Arc<AppState> {
        let templates = self.template_service();
        let ingress = IngressService::new(
            Arc::clone(&self.store),
            Arc::clone(&self.broker),
            Arc::clone(&templates),
            config.smtp_from.clone(),
        );

        Arc::new(AppState {
            ingress: Arc::new(ingress),
            templates,
        })
    }

    pub fn dispatcher(&self, config: &Config) -> Arc<Dispatcher> {
        Arc::new(Dispatcher::new(
            Arc::clone(&self.store),
            Arc::clone(&self.broker),
            Arc::clone(&self.mailer),
            DeliveryPolicy::from_config(config),
        ))
    }
}

/// Runs the configured role until SIGINT or SIGTERM.
pub async fn run(config: Config) -> Result<(), Error> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    run_until(config, shutdown_rx).await
}

/// Runs the configured role until `shutdown` flips to `true`.
pub async fn run_until(config: Config, shutdown: watch::Receiver<bool>) -> Result<(), Error> {
    let in_memory = config.storage_backend == StorageBackend::Memory
        || config.broker_backend == BrokerBackend::Memory;
    if in_memory && config.service_role != ServiceRole::All {
        warn!(
            role = ?config.service_role,
            "In-memory backends are process-local; other processes will not see this data"
        );
    }

    info!(
        role = ?config.service_role,
        storage = ?config.storage_backend,
        broker = ?config.broker_backend,
        "Starting email service"
    );

    let components = Components::connect(&config).await?;

    let workers = if config.service_role.runs_workers() {
        spawn_workers(
            &config,
            components.dispatcher(&config),
            Arc::clone(&components.broker),
            shutdown.clone(),
        )
    } else {
        Vec::new()
    };

    let api: Option<JoinHandle<Result<(), Error>>> = if config.service_role.runs_api() {
        let addr = format!("0.0.0.0:{}", config.server_port);
        let listener = TcpListener::bind(&addr).await?;
        let app = router(components.app_state(&config), config.max_request_bytes);
        Some(tokio::spawn(run_api_server(listener, app, shutdown.clone())))
    } else {
        None
    };

    let mut failed = false;

    if let Some(api) = api {
        match api.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(error = %e, "Ingress API exited with an error");
                failed = true;
            }
            Err(e) => {
                error!(error = %e, "Ingress API task panicked");
                failed = true;
            }
        }
    }

    for worker in workers {
        match worker.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(error = %e, "Worker exited with an error");
                failed = true;
            }
            Err(e) => {
                error!(error = %e, "Worker task panicked");
                failed = true;
            }
        }
    }

    info!("Email service stopped");

    if failed {
        Err(anyhow!("one or more components exited with an error"))
    } else {
        Ok(())
    }
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
