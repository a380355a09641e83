use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_postgres::{
    Client, NoTls, Row,
    error::SqlState,
    types::{FromSql, ToSql},
};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::{
    error::EmailServiceError,
    models::{
        delivery::DeliveryLogEntry,
        email::Attachment,
        outbox::{
            Appended, NewOutboxRecord, OutboxFilter, OutboxPage, OutboxRecord, StateChange,
            StateUpdate,
        },
        status::{DeliveryCategory, OutboxState},
        template::Template,
    },
    store::{OutboxStore, TemplateRepository},
};

const MIGRATION: &str = include_str!("../../migrations/0001_init.sql");

const OUTBOX_COLUMNS: &str = "send_id, state, recipients, cc, bcc, from_addr, subject, body, \
     content_type, attachments, attempt_count, dlq_attempt_count, last_error, idempotency_key, \
     correlation_id, template_id, created_at, updated_at, dispatched_at, completed_at";

const TEMPLATE_COLUMNS: &str =
    "id, name, subject, body, variables, description, created_at, updated_at, deleted_at";

/// Postgres-backed outbox and template store.
pub struct DatabaseClient {
    client: Client,
}

impl DatabaseClient {
    pub async fn connect(database_url: &str) -> Result<Self, Error> {
        info!("Connecting to PostgreSQL database");

        let (client, connection) = tokio_postgres::connect(database_url, NoTls)
            .await
            .map_err(|e| anyhow!("Failed to connect to database: {}", e))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(error = %e, "PostgreSQL connection closed with error");
            }
        });

        info!("PostgreSQL connection established");

        Ok(Self { client })
    }

    /// Creates the schema if it does not exist yet.
    pub async fn migrate(&self) -> Result<(), Error> {
        self.client
            .batch_execute(MIGRATION)
            .await
            .map_err(|e| anyhow!("Database migration failed: {}", e))?;

        info!("Database schema is up to date");
        Ok(())
    }

    async fn ensure_record_exists(&self, send_id: Uuid) -> Result<(), EmailServiceError> {
        let exists = self
            .client
            .query_opt(
                "SELECT 1 FROM outbox_records WHERE send_id = $1",
                &[&send_id],
            )
            .await
            .map_err(EmailServiceError::store)?
            .is_some();

        if exists {
            Ok(())
        } else {
            Err(outbox_not_found(send_id))
        }
    }
}

fn outbox_not_found(send_id: Uuid) -> EmailServiceError {
    EmailServiceError::NotFound(format!("outbox record {}", send_id))
}

fn template_not_found(id: Uuid) -> EmailServiceError {
    EmailServiceError::NotFound(format!("template {}", id))
}

fn column<'a, T: FromSql<'a>>(row: &'a Row, name: &str) -> Result<T, EmailServiceError> {
    row.try_get(name).map_err(EmailServiceError::store)
}

fn count(row: &Row, name: &str) -> Result<u32, EmailServiceError> {
    column::<i32>(row, name).map(|n| n.max(0) as u32)
}

fn parse_state(value: &str) -> Result<OutboxState, EmailServiceError> {
    value
        .parse()
        .map_err(|e: String| EmailServiceError::store(anyhow!(e)))
}

fn record_from_row(row: &Row) -> Result<OutboxRecord, EmailServiceError> {
    let state: String = column(row, "state")?;
    let attachments: serde_json::Value = column(row, "attachments")?;
    let attachments: Vec<Attachment> =
        serde_json::from_value(attachments).map_err(EmailServiceError::store)?;

    Ok(OutboxRecord {
        send_id: column(row, "send_id")?,
        state: parse_state(&state)?,
        recipients: column(row, "recipients")?,
        cc: column(row, "cc")?,
        bcc: column(row, "bcc")?,
        from_addr: column(row, "from_addr")?,
        subject: column(row, "subject")?,
        body: column(row, "body")?,
        content_type: column(row, "content_type")?,
        attachments,
        attempt_count: count(row, "attempt_count")?,
        dlq_attempt_count: count(row, "dlq_attempt_count")?,
        last_error: column(row, "last_error")?,
        idempotency_key: column(row, "idempotency_key")?,
        correlation_id: column(row, "correlation_id")?,
        template_id: column(row, "template_id")?,
        created_at: column(row, "created_at")?,
        updated_at: column(row, "updated_at")?,
        dispatched_at: column(row, "dispatched_at")?,
        completed_at: column(row, "completed_at")?,
    })
}

fn delivery_from_row(row: &Row) -> Result<DeliveryLogEntry, EmailServiceError> {
    let category: String = column(row, "category")?;
    let code: Option<i32> = column(row, "code")?;

    Ok(DeliveryLogEntry {
        send_id: column(row, "send_id")?,
        attempt: count(row, "attempt")?,
        code: code.and_then(|c| u16::try_from(c).ok()),
        category: category
            .parse::<DeliveryCategory>()
            .map_err(|e| EmailServiceError::store(anyhow!(e)))?,
        message: column(row, "message")?,
        occurred_at: column(row, "occurred_at")?,
    })
}

fn template_from_row(row: &Row) -> Result<Template, EmailServiceError> {
    Ok(Template {
        id: column(row, "id")?,
        name: column(row, "name")?,
        subject: column(row, "subject")?,
        body: column(row, "body")?,
        variables: column(row, "variables")?,
        description: column(row, "description")?,
        created_at: column(row, "created_at")?,
        updated_at: column(row, "updated_at")?,
        deleted_at: column(row, "deleted_at")?,
    })
}

fn is_unique_violation(e: &tokio_postgres::Error) -> bool {
    e.code() == Some(&SqlState::UNIQUE_VIOLATION)
}

fn name_in_use(name: &str) -> EmailServiceError {
    EmailServiceError::InvalidTemplate(format!("name '{}' is already in use", name))
}

#[async_trait]
impl OutboxStore for DatabaseClient {
    async fn append(&self, record: NewOutboxRecord) -> Result<Appended, EmailServiceError> {
        let send_id = Uuid::new_v4();
        let now = Utc::now();
        let attachments =
            serde_json::to_value(&record.attachments).map_err(EmailServiceError::store)?;

        let sql = "
            WITH inserted AS (
                INSERT INTO outbox_records (
                    send_id, state, recipients, cc, bcc, from_addr, subject, body,
                    content_type, attachments, idempotency_key, correlation_id,
                    template_id, created_at, updated_at
                )
                VALUES ($1, 'queued', $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $13)
                ON CONFLICT (idempotency_key) DO NOTHING
                RETURNING send_id
            ), audit AS (
                INSERT INTO outbox_transitions (send_id, from_state, to_state, occurred_at)
                SELECT send_id, NULL, 'queued', $13 FROM inserted
            )
            SELECT send_id, TRUE AS created FROM inserted";

        let params: [&(dyn ToSql + Sync); 13] = [
            &send_id,
            &record.recipients,
            &record.cc,
            &record.bcc,
            &record.from_addr,
            &record.subject,
            &record.body,
            &record.content_type,
            &attachments,
            &record.idempotency_key,
            &record.correlation_id,
            &record.template_id,
            &now,
        ];

        if let Some(row) = self
            .client
            .query_opt(sql, &params)
            .await
            .map_err(EmailServiceError::store)?
        {
            debug!(send_id = %send_id, "Outbox record appended");
            return Ok(Appended {
                send_id: column(&row, "send_id")?,
                created: true,
            });
        }

        // The insert was skipped, so the idempotency key is already taken.
        let row = self
            .client
            .query_one(
                "SELECT send_id FROM outbox_records WHERE idempotency_key = $1",
                &[&record.idempotency_key],
            )
            .await
            .map_err(EmailServiceError::store)?;

        Ok(Appended {
            send_id: column(&row, "send_id")?,
            created: false,
        })
    }

    async fn transition_state(
        &self,
        send_id: Uuid,
        from: OutboxState,
        to: OutboxState,
        update: StateUpdate,
    ) -> Result<OutboxRecord, EmailServiceError> {
        if !from.can_transition_to(to) {
            return Err(EmailServiceError::IllegalTransition { from, to });
        }

        let sql = format!(
            "
            WITH updated AS (
                UPDATE outbox_records SET
                    state = $3,
                    updated_at = $4,
                    attempt_count = GREATEST(attempt_count, COALESCE($5::int4, attempt_count)),
                    dlq_attempt_count =
                        GREATEST(dlq_attempt_count, COALESCE($6::int4, dlq_attempt_count)),
                    last_error = COALESCE($7::text, last_error),
                    dispatched_at = COALESCE(dispatched_at, $8::timestamptz),
                    completed_at = COALESCE($9::timestamptz, completed_at)
                WHERE send_id = $1 AND state = $2
                    AND ($10::int4 IS NULL OR attempt_count = $10)
                RETURNING {OUTBOX_COLUMNS}
            ), audit AS (
                INSERT INTO outbox_transitions (send_id, from_state, to_state, occurred_at)
                SELECT send_id, $2, $3, $4 FROM updated
            )
            SELECT {OUTBOX_COLUMNS} FROM updated"
        );

        let now = Utc::now();
        let attempt_count = update.attempt_count.map(|n| n as i32);
        let dlq_attempt_count = update.dlq_attempt_count.map(|n| n as i32);
        let expected_attempt = update.expected_attempt.map(|n| n as i32);

        let row = self
            .client
            .query_opt(
                &sql,
                &[
                    &send_id,
                    &from.as_str(),
                    &to.as_str(),
                    &now,
                    &attempt_count,
                    &dlq_attempt_count,
                    &update.last_error,
                    &update.dispatched_at,
                    &update.completed_at,
                    &expected_attempt,
                ],
            )
            .await
            .map_err(EmailServiceError::store)?;

        if let Some(row) = row {
            return record_from_row(&row);
        }

        let current = self
            .client
            .query_opt(
                "SELECT state, attempt_count FROM outbox_records WHERE send_id = $1",
                &[&send_id],
            )
            .await
            .map_err(EmailServiceError::store)?
            .ok_or_else(|| outbox_not_found(send_id))?;

        let actual = parse_state(&column::<String>(&current, "state")?)?;
        let attempts = count(&current, "attempt_count")?;

        match update.expected_attempt {
            Some(expected) if actual == from => Err(EmailServiceError::StaleClaim {
                send_id,
                expected,
                actual: attempts,
            }),
            _ => Err(EmailServiceError::ConflictingState {
                send_id,
                expected: from,
                actual,
            }),
        }
    }

    async fn load(&self, send_id: Uuid) -> Result<OutboxRecord, EmailServiceError> {
        let sql = format!("SELECT {OUTBOX_COLUMNS} FROM outbox_records WHERE send_id = $1");

        let row = self
            .client
            .query_opt(&sql, &[&send_id])
            .await
            .map_err(EmailServiceError::store)?
            .ok_or_else(|| outbox_not_found(send_id))?;

        record_from_row(&row)
    }

    async fn append_delivery_attempt(
        &self,
        entry: DeliveryLogEntry,
    ) -> Result<(), EmailServiceError> {
        let result = self
            .client
            .execute(
                "INSERT INTO delivery_log (send_id, attempt, code, category, message, occurred_at)
                 VALUES ($1, $2, $3, $4, $5, $6)
                 ON CONFLICT (send_id, attempt) DO NOTHING",
                &[
                    &entry.send_id,
                    &(entry.attempt as i32),
                    &entry.code.map(i32::from),
                    &entry.category.as_str(),
                    &entry.message,
                    &entry.occurred_at,
                ],
            )
            .await;

        match result {
            Ok(0) => {
                debug!(
                    send_id = %entry.send_id,
                    attempt = entry.attempt,
                    "Delivery attempt already logged"
                );
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(e) if e.code() == Some(&SqlState::FOREIGN_KEY_VIOLATION) => {
                Err(outbox_not_found(entry.send_id))
            }
            Err(e) => Err(EmailServiceError::store(e)),
        }
    }

    async fn deliveries(&self, send_id: Uuid) -> Result<Vec<DeliveryLogEntry>, EmailServiceError> {
        self.ensure_record_exists(send_id).await?;

        self.client
            .query(
                "SELECT send_id, attempt, code, category, message, occurred_at
                 FROM delivery_log WHERE send_id = $1 ORDER BY attempt",
                &[&send_id],
            )
            .await
            .map_err(EmailServiceError::store)?
            .iter()
            .map(delivery_from_row)
            .collect()
    }

    async fn state_history(&self, send_id: Uuid) -> Result<Vec<StateChange>, EmailServiceError> {
        self.ensure_record_exists(send_id).await?;

        let rows = self
            .client
            .query(
                "SELECT from_state, to_state, occurred_at
                 FROM outbox_transitions WHERE send_id = $1 ORDER BY id",
                &[&send_id],
            )
            .await
            .map_err(EmailServiceError::store)?;

        rows.iter()
            .map(|row| {
                let from: Option<String> = column(row, "from_state")?;
                let to: String = column(row, "to_state")?;
                Ok(StateChange {
                    from: from.as_deref().map(parse_state).transpose()?,
                    to: parse_state(&to)?,
                    occurred_at: column(row, "occurred_at")?,
                })
            })
            .collect()
    }

    async fn list(&self, filter: &OutboxFilter) -> Result<OutboxPage, EmailServiceError> {
        let state = filter.state.map(|s| s.as_str());
        let conditions = "($1::text IS NULL OR state = $1)
            AND ($2::timestamptz IS NULL OR created_at >= $2)
            AND ($3::timestamptz IS NULL OR created_at < $3)";

        let total_row = self
            .client
            .query_one(
                &format!("SELECT COUNT(*) AS total FROM outbox_records WHERE {conditions}"),
                &[&state, &filter.from, &filter.to],
            )
            .await
            .map_err(EmailServiceError::store)?;
        let total: i64 = column(&total_row, "total")?;

        let rows = self
            .client
            .query(
                &format!(
                    "SELECT {OUTBOX_COLUMNS} FROM outbox_records WHERE {conditions}
                     ORDER BY created_at DESC LIMIT $4 OFFSET $5"
                ),
                &[
                    &state,
                    &filter.from,
                    &filter.to,
                    &(filter.limit() as i64),
                    &(filter.offset() as i64),
                ],
            )
            .await
            .map_err(EmailServiceError::store)?;

        Ok(OutboxPage {
            records: rows.iter().map(record_from_row).collect::<Result<_, _>>()?,
            total: total.max(0) as u64,
        })
    }

    async fn list_stale(
        &self,
        updated_before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<OutboxRecord>, EmailServiceError> {
        let sql = format!(
            "SELECT {OUTBOX_COLUMNS} FROM outbox_records
             WHERE state NOT IN ('sent', 'failed') AND updated_at < $1
             ORDER BY updated_at LIMIT $2"
        );

        self.client
            .query(&sql, &[&updated_before, &(limit as i64)])
            .await
            .map_err(EmailServiceError::store)?
            .iter()
            .map(record_from_row)
            .collect()
    }

    async fn delete(&self, send_id: Uuid) -> Result<(), EmailServiceError> {
        let deleted = self
            .client
            .execute("DELETE FROM outbox_records WHERE send_id = $1", &[&send_id])
            .await
            .map_err(EmailServiceError::store)?;

        if deleted == 0 {
            return Err(outbox_not_found(send_id));
        }
        Ok(())
    }
}

#[async_trait]
impl TemplateRepository for DatabaseClient {
    async fn insert(&self, template: &Template) -> Result<(), EmailServiceError> {
        self.client
            .execute(
                "INSERT INTO templates
                    (id, name, subject, body, variables, description, created_at, updated_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
                &[
                    &template.id,
                    &template.name,
                    &template.subject,
                    &template.body,
                    &template.variables,
                    &template.description,
                    &template.created_at,
                    &template.updated_at,
                ],
            )
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    name_in_use(&template.name)
                } else {
                    EmailServiceError::store(e)
                }
            })?;

        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Template, EmailServiceError> {
        let sql =
            format!("SELECT {TEMPLATE_COLUMNS} FROM templates WHERE id = $1 AND deleted_at IS NULL");

        let row = self
            .client
            .query_opt(&sql, &[&id])
            .await
            .map_err(EmailServiceError::store)?
            .ok_or_else(|| template_not_found(id))?;

        template_from_row(&row)
    }

    async fn update(&self, template: &Template) -> Result<(), EmailServiceError> {
        let updated = self
            .client
            .execute(
                "UPDATE templates SET
                    name = $2, subject = $3, body = $4, variables = $5,
                    description = $6, updated_at = $7
                 WHERE id = $1 AND deleted_at IS NULL",
                &[
                    &template.id,
                    &template.name,
                    &template.subject,
                    &template.body,
                    &template.variables,
                    &template.description,
                    &template.updated_at,
                ],
            )
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    name_in_use(&template.name)
                } else {
                    EmailServiceError::store(e)
                }
            })?;

        if updated == 0 {
            return Err(template_not_found(template.id));
        }
        Ok(())
    }

    async fn soft_delete(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), EmailServiceError> {
        let deleted = self
            .client
            .execute(
                "UPDATE templates SET deleted_at = $2, updated_at = $2
                 WHERE id = $1 AND deleted_at IS NULL",
                &[&id, &at],
            )
            .await
            .map_err(EmailServiceError::store)?;

        if deleted == 0 {
            return Err(template_not_found(id));
        }
        Ok(())
    }
}
