//! Store contract against a real Postgres. Needs Docker:
//! `cargo test -- --ignored postgres`.

use std::{sync::Arc, time::Duration};

use anyhow::{Result, anyhow};
use chrono::Utc;
use email_service::{
    clients::database::DatabaseClient,
    error::EmailServiceError,
    models::{
        delivery::DeliveryLogEntry,
        outbox::{NewOutboxRecord, OutboxFilter, StateUpdate},
        status::{DeliveryCategory, OutboxState},
        template::CreateTemplateRequest,
    },
    services::template::TemplateService,
    store::OutboxStore,
};
use testcontainers::{
    ContainerAsync, GenericImage, ImageExt,
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
};
use tokio::time::sleep;

struct Postgres {
    // Dropping the handle stops the container.
    _container: ContainerAsync<GenericImage>,
    client: Arc<DatabaseClient>,
}

async fn postgres() -> Result<Postgres> {
    let container = GenericImage::new("postgres", "16-alpine")
        .with_exposed_port(5432.tcp())
        .with_wait_for(WaitFor::message_on_stderr(
            "database system is ready to accept connections",
        ))
        .with_env_var("POSTGRES_PASSWORD", "postgres")
        .start()
        .await?;

    let host = container.get_host().await?;
    let port = container.get_host_port_ipv4(5432).await?;
    let url = format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

    // The server restarts once after initdb; retry through it.
    let mut last_error = None;
    for _ in 0..20 {
        match DatabaseClient::connect(&url).await {
            Ok(client) => {
                client.migrate().await?;
                return Ok(Postgres {
                    _container: container,
                    client: Arc::new(client),
                });
            }
            Err(e) => {
                last_error = Some(e);
                sleep(Duration::from_millis(500)).await;
            }
        }
    }

    Err(last_error.unwrap_or_else(|| anyhow!("postgres never became ready")))
}

fn new_record(key: Option<&str>) -> NewOutboxRecord {
    NewOutboxRecord {
        recipients: vec!["a@x.com".to_string()],
        cc: vec!["c@x.com".to_string()],
        bcc: vec![],
        from_addr: "noreply@example.com".to_string(),
        subject: "hi".to_string(),
        body: "hello".to_string(),
        content_type: "text/plain".to_string(),
        attachments: vec![],
        idempotency_key: key.map(str::to_string),
        correlation_id: "corr-pg".to_string(),
        template_id: None,
    }
}

/// Test: Appends are idempotent on the key and round-trip every column
#[tokio::test]
#[ignore = "requires docker"]
async fn test_postgres_append_and_load() -> Result<()> {
    let pg = postgres().await?;
    let store = &pg.client;

    let first = store.append(new_record(Some("pg-key-1"))).await?;
    let second = store.append(new_record(Some("pg-key-1"))).await?;
    assert!(first.created);
    assert!(!second.created);
    assert_eq!(first.send_id, second.send_id);

    let record = store.load(first.send_id).await?;
    assert_eq!(record.state, OutboxState::Queued);
    assert_eq!(record.cc, vec!["c@x.com".to_string()]);
    assert_eq!(record.idempotency_key.as_deref(), Some("pg-key-1"));

    let history = store.state_history(first.send_id).await?;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].from, None);
    assert_eq!(history[0].to, OutboxState::Queued);

    Ok(())
}

/// Test: Conditional transitions refuse a stale expected state
#[tokio::test]
#[ignore = "requires docker"]
async fn test_postgres_conditional_transition() -> Result<()> {
    let pg = postgres().await?;
    let store = &pg.client;
    let send_id = store.append(new_record(None)).await?.send_id;

    let claimed = store
        .transition_state(
            send_id,
            OutboxState::Queued,
            OutboxState::Dispatching,
            StateUpdate::new().with_attempt_count(1).dispatched_at(Utc::now()),
        )
        .await?;
    assert_eq!(claimed.attempt_count, 1);

    let err = store
        .transition_state(
            send_id,
            OutboxState::Queued,
            OutboxState::Dispatching,
            StateUpdate::new().with_attempt_count(1),
        )
        .await
        .unwrap_err();
    assert!(err.is_conflict(), "{err}");

    let err = store
        .transition_state(send_id, OutboxState::Sent, OutboxState::Queued, StateUpdate::new())
        .await
        .unwrap_err();
    assert!(matches!(err, EmailServiceError::IllegalTransition { .. }));

    let err = store
        .transition_state(
            send_id,
            OutboxState::Dispatching,
            OutboxState::Sent,
            StateUpdate::new().for_attempt(2),
        )
        .await
        .unwrap_err();
    assert!(
        matches!(err, EmailServiceError::StaleClaim { expected: 2, actual: 1, .. }),
        "{err}"
    );

    let sent = store
        .transition_state(
            send_id,
            OutboxState::Dispatching,
            OutboxState::Sent,
            StateUpdate::new().for_attempt(1),
        )
        .await?;
    assert_eq!(sent.state, OutboxState::Sent);

    Ok(())
}

/// Test: Delivery rows are unique per attempt and listed in order
#[tokio::test]
#[ignore = "requires docker"]
async fn test_postgres_delivery_log() -> Result<()> {
    let pg = postgres().await?;
    let store = &pg.client;
    let send_id = store.append(new_record(None)).await?.send_id;

    for (attempt, category) in [
        (2, DeliveryCategory::Success),
        (1, DeliveryCategory::Transient),
        (1, DeliveryCategory::Permanent),
    ] {
        store
            .append_delivery_attempt(
                DeliveryLogEntry::new(send_id, attempt, category).with_code(Some(421)),
            )
            .await?;
    }

    let log = store.deliveries(send_id).await?;
    assert_eq!(log.len(), 2);
    assert_eq!(log[0].attempt, 1);
    assert_eq!(log[0].category, DeliveryCategory::Transient);
    assert_eq!(log[1].category, DeliveryCategory::Success);

    Ok(())
}

/// Test: Listing filters by state and the stale scan skips settled records
#[tokio::test]
#[ignore = "requires docker"]
async fn test_postgres_list_and_stale_scan() -> Result<()> {
    let pg = postgres().await?;
    let store = &pg.client;

    let queued = store.append(new_record(None)).await?.send_id;
    let settled = store.append(new_record(None)).await?.send_id;
    store
        .transition_state(
            settled,
            OutboxState::Queued,
            OutboxState::Dispatching,
            StateUpdate::new().with_attempt_count(1),
        )
        .await?;
    store
        .transition_state(
            settled,
            OutboxState::Dispatching,
            OutboxState::Sent,
            StateUpdate::new().completed_at(Utc::now()),
        )
        .await?;

    let page = store
        .list(&OutboxFilter {
            state: Some(OutboxState::Queued),
            ..OutboxFilter::default()
        })
        .await?;
    assert_eq!(page.total, 1);
    assert_eq!(page.records[0].send_id, queued);

    sleep(Duration::from_millis(10)).await;
    let stale = store.list_stale(Utc::now(), 10).await?;
    assert_eq!(
        stale.iter().map(|r| r.send_id).collect::<Vec<_>>(),
        vec![queued]
    );

    store.delete(queued).await?;
    assert!(matches!(
        store.load(queued).await.unwrap_err(),
        EmailServiceError::NotFound(_)
    ));

    Ok(())
}

/// Test: Template names are unique among live templates in the database too
#[tokio::test]
#[ignore = "requires docker"]
async fn test_postgres_templates() -> Result<()> {
    let pg = postgres().await?;
    let service = TemplateService::new(pg.client.clone());

    let request = CreateTemplateRequest {
        name: "welcome".to_string(),
        subject: "Welcome {{name}}".to_string(),
        body: "Hi {{name}}".to_string(),
        variables: vec!["name".to_string()],
        description: String::new(),
    };

    let first = service.create(request.clone()).await?;
    assert!(matches!(
        service.create(request.clone()).await.unwrap_err(),
        EmailServiceError::InvalidTemplate(_)
    ));

    service.delete(first.id).await?;
    let second = service.create(request).await?;
    assert_eq!(service.get(second.id).await?.variables, vec!["name".to_string()]);

    Ok(())
}
