#![allow(dead_code)]

pub mod cache;
pub mod mailer;
pub mod relay;

use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::{Result, anyhow};
use email_service::{
    api::{AppState, router, run_api_server},
    app::Components,
    clients::{
        memory::{MemoryBroker, MemoryStore},
        smtp::Mailer,
    },
    config::Config,
    error::EmailServiceError,
    models::{
        context::RequestContext,
        email::SendEmailRequest,
        outbox::OutboxRecord,
        status::OutboxState,
        template::{CreateTemplateRequest, Template},
    },
    store::OutboxStore,
    workers::{Dispatcher, spawn_workers},
};
use tokio::{
    net::TcpListener,
    sync::watch,
    task::JoinHandle,
    time::{Instant, sleep, timeout},
};
use uuid::Uuid;

pub use self::mailer::{ScriptedMailer, Step};

pub const WAIT: Duration = Duration::from_secs(10);

pub const NO_OVERRIDES: &[(&str, &str)] = &[];

/// Memory backends with backoffs short enough for tests.
pub fn test_config<V: AsRef<str>>(overrides: &[(&str, V)]) -> Config {
    let mut pairs: HashMap<String, String> = [
        ("STORAGE_BACKEND", "memory"),
        ("BROKER_BACKEND", "memory"),
        ("RETRY_INITIAL_BACKOFF_MS", "20"),
        ("RETRY_MAX_BACKOFF_MS", "100"),
        ("DLQ_INITIAL_BACKOFF_MS", "20"),
        ("DLQ_MAX_BACKOFF_MS", "100"),
        ("PUBLISH_INITIAL_DELAY_MS", "5"),
        ("WORKER_CONCURRENCY", "2"),
        ("SWEEPER_INTERVAL_SECONDS", "3600"),
        ("SHUTDOWN_GRACE_SECONDS", "1"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();

    for (k, v) in overrides {
        pairs.insert(k.to_string(), v.as_ref().to_string());
    }

    Config::from_pairs(pairs).expect("test config is valid")
}

/// The whole pipeline in one process: memory store, memory broker, scripted mailer.
pub struct Harness<M = ScriptedMailer> {
    pub config: Config,
    pub store: Arc<MemoryStore>,
    pub broker: Arc<MemoryBroker>,
    pub mailer: Arc<M>,
    pub components: Components,
    pub state: Arc<AppState>,
    pub dispatcher: Arc<Dispatcher>,
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<Result<(), EmailServiceError>>>,
}

impl<M: Mailer + 'static> Harness<M> {
    /// Pipeline with sender workers, DLQ controller and sweeper running.
    pub async fn start(mailer: M) -> Self {
        Self::start_with(mailer, NO_OVERRIDES).await
    }

    pub async fn start_with<V: AsRef<str>>(mailer: M, overrides: &[(&str, V)]) -> Self {
        let mut harness = Self::idle_with(mailer, overrides);
        harness.run_workers();
        harness
    }

    /// Starts consuming whatever is already on the topics.
    pub fn run_workers(&mut self) {
        self.workers = spawn_workers(
            &self.config,
            Arc::clone(&self.dispatcher),
            Arc::clone(&self.components.broker),
            self.shutdown.subscribe(),
        );
    }

    /// Ingress only; nothing consumes the topics.
    pub fn idle(mailer: M) -> Self {
        Self::idle_with(mailer, NO_OVERRIDES)
    }

    pub fn idle_with<V: AsRef<str>>(mailer: M, overrides: &[(&str, V)]) -> Self {
        let config = test_config(overrides);
        let store = Arc::new(MemoryStore::new());
        let broker = Arc::new(MemoryBroker::new());
        let mailer = Arc::new(mailer);

        let components = Components {
            store: store.clone(),
            templates: store.clone(),
            cache: None,
            broker: broker.clone(),
            mailer: mailer.clone() as Arc<dyn Mailer>,
        };
        let state = components.app_state(&config);
        let dispatcher = components.dispatcher(&config);
        let (shutdown, _) = watch::channel(false);

        Self {
            config,
            store,
            broker,
            mailer,
            components,
            state,
            dispatcher,
            shutdown,
            workers: Vec::new(),
        }
    }

    pub async fn submit(&self, request: SendEmailRequest) -> Result<Uuid, EmailServiceError> {
        self.state
            .ingress
            .submit(&RequestContext::generate(), request)
            .await
    }

    pub async fn create_template(
        &self,
        name: &str,
        subject: &str,
        body: &str,
        variables: &[&str],
    ) -> Template {
        self.state
            .templates
            .create(CreateTemplateRequest {
                name: name.to_string(),
                subject: subject.to_string(),
                body: body.to_string(),
                variables: variables.iter().map(|v| v.to_string()).collect(),
                description: String::new(),
            })
            .await
            .expect("template is valid")
    }

    pub async fn wait_for_state(&self, send_id: Uuid, state: OutboxState) -> Result<OutboxRecord> {
        let deadline = Instant::now() + WAIT;
        loop {
            let record = self.store.load(send_id).await?;
            if record.state == state {
                return Ok(record);
            }
            if Instant::now() >= deadline {
                return Err(anyhow!(
                    "record {} stuck in {} waiting for {}",
                    send_id,
                    record.state,
                    state
                ));
            }
            sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn wait_for_acks(&self, count: usize) -> Result<()> {
        let deadline = Instant::now() + WAIT;
        while self.broker.ack_count() < count {
            if Instant::now() >= deadline {
                return Err(anyhow!(
                    "only {} of {} acks observed",
                    self.broker.ack_count(),
                    count
                ));
            }
            sleep(Duration::from_millis(10)).await;
        }
        Ok(())
    }

    /// Serves the ingress API on an ephemeral port. Returns its base URL.
    pub async fn serve_api(&self) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(Arc::clone(&self.state), self.config.max_request_bytes);
        tokio::spawn(run_api_server(listener, app, self.shutdown.subscribe()));
        format!("http://{}", addr)
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        for worker in self.workers {
            let _ = timeout(WAIT, worker).await;
        }
    }
}

/// Points the real SMTP client at a local relay, plaintext, with short timeouts.
pub fn relay_overrides(port: u16) -> Vec<(&'static str, String)> {
    vec![
        ("SMTP_HOST", "127.0.0.1".to_string()),
        ("SMTP_PORT", port.to_string()),
        ("SMTP_TLS", "none".to_string()),
        ("SMTP_DIAL_TIMEOUT_MS", "1000".to_string()),
        ("SMTP_COMMAND_TIMEOUT_MS", "500".to_string()),
        ("SMTP_OVERALL_TIMEOUT_MS", "3000".to_string()),
    ]
}

pub fn literal_request(to: &str, subject: &str, body: &str) -> SendEmailRequest {
    SendEmailRequest {
        to: vec![to.to_string()],
        subject: Some(subject.to_string()),
        body: Some(body.to_string()),
        ..SendEmailRequest::default()
    }
}

pub fn template_request(to: &str, template_id: Uuid, data: &[(&str, &str)]) -> SendEmailRequest {
    SendEmailRequest {
        to: vec![to.to_string()],
        template_id: Some(template_id),
        data: data
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        ..SendEmailRequest::default()
    }
}
