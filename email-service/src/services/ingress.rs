use std::sync::Arc;

use base64::{Engine, engine::general_purpose::STANDARD};
use tokio::time::timeout;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    clients::broker::Broker,
    error::EmailServiceError,
    models::{
        context::RequestContext,
        email::{
            Attachment, AttachmentPayload, CONTENT_TYPE_HTML, CONTENT_TYPE_PLAIN, SendEmailRequest,
        },
        message::{BrokerMessage, Topic},
        outbox::{NewOutboxRecord, OutboxDetail, OutboxFilter, OutboxPage},
        status::OutboxState,
        validation::{
            is_mime_type, validate_addresses, validate_attachment_filename, validate_body,
            validate_subject,
        },
    },
    services::template::TemplateService,
    store::OutboxStore,
};

const MAX_IDEMPOTENCY_KEY_LEN: usize = 255;

/// Accepts send-intents: validate, render, append to the outbox, publish to main.
pub struct IngressService {
    store: Arc<dyn OutboxStore>,
    broker: Arc<dyn Broker>,
    templates: Arc<TemplateService>,
    from_addr: String,
}

impl IngressService {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        broker: Arc<dyn Broker>,
        templates: Arc<TemplateService>,
        from_addr: impl Into<String>,
    ) -> Self {
        Self {
            store,
            broker,
            templates,
            from_addr: from_addr.into(),
        }
    }

    /// Returns the send-id once the record is durable and announced on the main topic.
    ///
    /// A publish failure leaves the record `queued` for the sweeper and
    /// surfaces as a broker error.
    pub async fn submit(
        &self,
        ctx: &RequestContext,
        request: SendEmailRequest,
    ) -> Result<Uuid, EmailServiceError> {
        let record = self.prepare(ctx, request).await?;
        let idempotency_key = record.idempotency_key.clone();

        let appended = self.store.append(record).await?;

        if !appended.created {
            let existing = self.store.load(appended.send_id).await?;
            info!(
                send_id = %appended.send_id,
                state = %existing.state,
                correlation_id = %ctx.correlation_id,
                "Duplicate idempotency key, returning original send"
            );
            if existing.state != OutboxState::Queued {
                return Ok(appended.send_id);
            }
        } else {
            info!(
                send_id = %appended.send_id,
                correlation_id = %ctx.correlation_id,
                idempotency_key = ?idempotency_key,
                "Send-intent queued"
            );
        }

        let message = BrokerMessage::main(appended.send_id, 1, ctx.correlation_id.clone());
        self.publish(ctx, &message).await?;

        Ok(appended.send_id)
    }

    pub async fn detail(&self, send_id: Uuid) -> Result<OutboxDetail, EmailServiceError> {
        let record = self.store.load(send_id).await?;
        let deliveries = self.store.deliveries(send_id).await?;
        let history = self.store.state_history(send_id).await?;

        Ok(OutboxDetail {
            record,
            deliveries,
            history,
        })
    }

    pub async fn list(&self, filter: &OutboxFilter) -> Result<OutboxPage, EmailServiceError> {
        if let (Some(from), Some(to)) = (filter.from, filter.to)
            && from > to
        {
            return Err(EmailServiceError::Validation(
                "from: must not be after 'to'".to_string(),
            ));
        }
        self.store.list(filter).await
    }

    pub async fn delete(&self, send_id: Uuid) -> Result<(), EmailServiceError> {
        self.store.delete(send_id).await?;
        info!(send_id = %send_id, "Outbox record deleted by operator");
        Ok(())
    }

    async fn publish(
        &self,
        ctx: &RequestContext,
        message: &BrokerMessage,
    ) -> Result<(), EmailServiceError> {
        let publish = self.broker.publish(Topic::Main, message);

        let result = match ctx.remaining() {
            Some(remaining) => timeout(remaining, publish)
                .await
                .unwrap_or_else(|_| Err(anyhow::anyhow!("publish deadline exceeded"))),
            None => publish.await,
        };

        result.map_err(|e| {
            warn!(
                send_id = %message.send_id,
                correlation_id = %ctx.correlation_id,
                error = %e,
                "Main-topic publish failed, record left queued for the sweeper"
            );
            EmailServiceError::broker(e)
        })
    }

    /// Validation and rendering. Nothing touches the outbox before this succeeds.
    async fn prepare(
        &self,
        ctx: &RequestContext,
        request: SendEmailRequest,
    ) -> Result<NewOutboxRecord, EmailServiceError> {
        if request.to.is_empty() {
            return Err(EmailServiceError::Validation(
                "to: at least one recipient is required".to_string(),
            ));
        }
        validate_addresses("to", &request.to)?;
        validate_addresses("cc", &request.cc)?;
        validate_addresses("bcc", &request.bcc)?;

        let content_type = match request.content_type.as_deref() {
            None => CONTENT_TYPE_HTML,
            Some(CONTENT_TYPE_HTML) => CONTENT_TYPE_HTML,
            Some(CONTENT_TYPE_PLAIN) => CONTENT_TYPE_PLAIN,
            Some(other) => {
                return Err(EmailServiceError::Validation(format!(
                    "content_type: must be '{}' or '{}', got '{}'",
                    CONTENT_TYPE_HTML, CONTENT_TYPE_PLAIN, other
                )));
            }
        };

        if let Some(key) = &request.idempotency_key
            && (key.trim().is_empty() || key.len() > MAX_IDEMPOTENCY_KEY_LEN)
        {
            return Err(EmailServiceError::Validation(
                "idempotency_key: must be 1 to 255 characters".to_string(),
            ));
        }

        let attachments = request
            .attachments
            .iter()
            .enumerate()
            .map(|(i, payload)| decode_attachment(i, payload))
            .collect::<Result<Vec<_>, _>>()?;

        let (subject, body) = match request.template_id {
            Some(template_id) => {
                if request.subject.is_some() || request.body.is_some() {
                    return Err(EmailServiceError::Validation(
                        "template_id: cannot be combined with a literal subject or body"
                            .to_string(),
                    ));
                }
                let rendered = self
                    .templates
                    .render(template_id, &request.data)
                    .await
                    .map_err(|e| match e {
                        EmailServiceError::NotFound(_) => EmailServiceError::Validation(format!(
                            "template_id: unknown template {}",
                            template_id
                        )),
                        other => other,
                    })?;
                (rendered.subject, rendered.body)
            }
            None => {
                let subject = request.subject.unwrap_or_default();
                let body = request.body.unwrap_or_default();
                (subject, body)
            }
        };

        validate_subject(&subject)?;
        validate_body(&body)?;

        Ok(NewOutboxRecord {
            recipients: request.to,
            cc: request.cc,
            bcc: request.bcc,
            from_addr: self.from_addr.clone(),
            subject,
            body,
            content_type: content_type.to_string(),
            attachments,
            idempotency_key: request.idempotency_key,
            correlation_id: ctx.correlation_id.clone(),
            template_id: request.template_id,
        })
    }
}

fn decode_attachment(index: usize, payload: &AttachmentPayload) -> Result<Attachment, EmailServiceError> {
    let field = format!("attachments[{}]", index);

    validate_attachment_filename(&format!("{}.filename", field), &payload.filename)?;

    if !is_mime_type(&payload.content_type) {
        return Err(EmailServiceError::Validation(format!(
            "{}.content_type: invalid MIME type '{}'",
            field, payload.content_type
        )));
    }

    let content = STANDARD
        .decode(payload.content.trim())
        .map_err(|e| EmailServiceError::Validation(format!("{}.content: invalid base64: {}", field, e)))?;

    if content.is_empty() {
        return Err(EmailServiceError::Validation(format!(
            "{}.content: attachment cannot be empty",
            field
        )));
    }

    Ok(Attachment {
        filename: payload.filename.clone(),
        content_type: payload.content_type.clone(),
        content,
    })
}
