mod connection;
mod error;
pub mod message;
mod response;

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use self::{connection::SmtpConnection, error::SmtpError, response::Response};
use crate::{
    config::{SmtpSettings, TlsMode},
    models::{email::Attachment, outbox::OutboxRecord, validation::validate_email_address},
};

/// Everything needed to put one outbox record on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingEmail {
    pub send_id: Uuid,
    pub from: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub subject: String,
    pub body: String,
    pub content_type: String,
    pub attachments: Vec<Attachment>,
}

impl OutgoingEmail {
    /// Envelope recipients: to, cc and bcc in one envelope.
    pub fn envelope_recipients(&self) -> impl Iterator<Item = &str> {
        self.to
            .iter()
            .chain(self.cc.iter())
            .chain(self.bcc.iter())
            .map(String::as_str)
    }
}

impl From<&OutboxRecord> for OutgoingEmail {
    fn from(record: &OutboxRecord) -> Self {
        Self {
            send_id: record.send_id,
            from: record.from_addr.clone(),
            to: record.recipients.clone(),
            cc: record.cc.clone(),
            bcc: record.bcc.clone(),
            subject: record.subject.clone(),
            body: record.body.clone(),
            content_type: record.content_type.clone(),
            attachments: record.attachments.clone(),
        }
    }
}

/// Final reply of an accepted message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpReceipt {
    pub code: u16,
    pub message: String,
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: &OutgoingEmail) -> Result<SmtpReceipt, SmtpError>;
}

/// Opens a fresh relay session per message.
pub struct SmtpMailer {
    settings: SmtpSettings,
}

impl SmtpMailer {
    pub fn new(settings: SmtpSettings) -> Self {
        if settings.accept_invalid_certs {
            warn!(
                host = %settings.host,
                "TLS certificate validation is disabled for the SMTP relay"
            );
        }
        Self { settings }
    }

    async fn session(&self, email: &OutgoingEmail, data: &str) -> Result<SmtpReceipt, SmtpError> {
        let settings = &self.settings;
        let mut connection = SmtpConnection::connect(
            &settings.host,
            settings.port,
            settings.dial_timeout,
            settings.command_timeout,
        )
        .await?;

        expect(connection.read_greeting().await?, &[220])?;

        let mut ehlo = self.hello(&mut connection).await?;

        let offers_tls = ehlo.has_extension("STARTTLS");
        let upgrade = match settings.tls {
            TlsMode::None => false,
            TlsMode::Opportunistic => offers_tls,
            TlsMode::Required if offers_tls => true,
            TlsMode::Required => {
                return Err(SmtpError::Tls("relay does not offer STARTTLS".to_string()));
            }
        };

        if upgrade {
            let reply = connection.command("STARTTLS").await?;
            if reply.code == 220 {
                connection
                    .upgrade_to_tls(&settings.host, settings.accept_invalid_certs)
                    .await?;
                ehlo = self.hello(&mut connection).await?;
            } else if settings.tls == TlsMode::Required {
                return Err(SmtpError::Tls(format!(
                    "STARTTLS refused: {} {}",
                    reply.code,
                    reply.message()
                )));
            } else {
                debug!(code = reply.code, "STARTTLS refused, continuing in plaintext");
            }
        }

        debug!(tls = connection.is_tls(), host = %settings.host, "SMTP session ready");

        if let (Some(username), Some(password)) = (&settings.username, &settings.password) {
            if !ehlo.has_extension("AUTH") {
                debug!("Relay does not advertise AUTH, attempting PLAIN anyway");
            }
            let token = STANDARD.encode(format!("\0{}\0{}", username, password));
            let reply = connection.command(&format!("AUTH PLAIN {}", token)).await?;
            if reply.code != 235 {
                return Err(SmtpError::Auth {
                    code: reply.code,
                    message: reply.message(),
                });
            }
        }

        expect(
            connection
                .command(&format!("MAIL FROM:<{}>", email.from))
                .await?,
            &[250],
        )?;

        for recipient in email.envelope_recipients() {
            expect(
                connection
                    .command(&format!("RCPT TO:<{}>", recipient))
                    .await?,
                &[250, 251],
            )?;
        }

        expect(connection.command("DATA").await?, &[354])?;
        let accepted = expect(connection.send_data(data).await?, &[250])?;

        if let Err(e) = connection.command("QUIT").await {
            debug!(error = %e, "QUIT failed after the message was accepted");
        }

        Ok(SmtpReceipt {
            code: accepted.code,
            message: accepted.message(),
        })
    }

    async fn hello(&self, connection: &mut SmtpConnection) -> Result<Response, SmtpError> {
        let helo_name = &self.settings.helo_name;
        let reply = connection.command(&format!("EHLO {}", helo_name)).await?;
        if reply.is_success() {
            return Ok(reply);
        }

        expect(
            connection.command(&format!("HELO {}", helo_name)).await?,
            &[250],
        )
    }
}

/// Passes `reply` through when its code is one of `accepted`.
fn expect(reply: Response, accepted: &[u16]) -> Result<Response, SmtpError> {
    if accepted.contains(&reply.code) {
        return Ok(reply);
    }

    if reply.is_error() {
        Err(SmtpError::Rejected {
            code: reply.code,
            message: reply.message(),
        })
    } else {
        Err(SmtpError::Protocol(format!(
            "unexpected reply {} {}",
            reply.code,
            reply.message()
        )))
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, email: &OutgoingEmail) -> Result<SmtpReceipt, SmtpError> {
        for address in std::iter::once(email.from.as_str()).chain(email.envelope_recipients()) {
            validate_email_address("address", address)
                .map_err(|_| SmtpError::InvalidAddress(address.to_string()))?;
        }

        let data = message::assemble(email);
        let overall = self.settings.overall_timeout;

        let receipt = timeout(overall, self.session(email, &data))
            .await
            .map_err(|_| SmtpError::Timeout {
                stage: "session".to_string(),
                after: overall,
            })??;

        info!(
            send_id = %email.send_id,
            code = receipt.code,
            relay = %self.settings.host,
            "Relay accepted message"
        );

        Ok(receipt)
    }
}
