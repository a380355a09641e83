use std::collections::VecDeque;

use anyhow::Result;
use base64::{Engine, engine::general_purpose::STANDARD};
use email_service::{
    clients::smtp::{Mailer, OutgoingEmail, SmtpError, SmtpMailer},
    models::{email::Attachment, status::DeliveryCategory},
};
use tokio::net::TcpListener;
use uuid::Uuid;

use crate::support::{
    relay::{FakeRelay, RelayBehavior},
    relay_overrides, test_config,
};

fn mailer_for(port: u16, extra: &[(&'static str, &str)]) -> SmtpMailer {
    let mut overrides = relay_overrides(port);
    overrides.extend(extra.iter().map(|(k, v)| (*k, v.to_string())));
    SmtpMailer::new(test_config(&overrides).smtp_settings())
}

fn email() -> OutgoingEmail {
    OutgoingEmail {
        send_id: Uuid::new_v4(),
        from: "noreply@example.com".to_string(),
        to: vec!["a@x.com".to_string()],
        cc: vec!["c@x.com".to_string()],
        bcc: vec!["hidden@x.com".to_string()],
        subject: "Quarterly report".to_string(),
        body: "<p>Numbers attached.</p>".to_string(),
        content_type: "text/html".to_string(),
        attachments: vec![],
    }
}

fn relay_with_data_replies(codes: &[u16]) -> RelayBehavior {
    RelayBehavior {
        data_replies: codes.iter().copied().collect::<VecDeque<_>>(),
        ..RelayBehavior::default()
    }
}

/// Test: Every recipient is in the envelope but Bcc never reaches the headers
#[tokio::test]
async fn test_delivery_keeps_bcc_out_of_headers() -> Result<()> {
    let relay = FakeRelay::start().await;
    let mailer = mailer_for(relay.port(), &[]);

    let receipt = mailer.send(&email()).await?;
    assert_eq!(receipt.code, 250);

    let sessions = relay.sessions();
    assert_eq!(sessions.len(), 1);
    let session = &sessions[0];
    assert_eq!(session.helo.as_deref(), Some("localhost"));
    assert_eq!(session.mail_from.as_deref(), Some("noreply@example.com"));
    assert_eq!(session.rcpt_to, vec!["a@x.com", "c@x.com", "hidden@x.com"]);
    assert!(!session.data.contains("hidden@x.com"));
    assert!(!session.data.to_ascii_lowercase().contains("bcc:"));

    let parsed = mailparse::parse_mail(session.data.as_bytes())?;
    let header = |name: &str| {
        parsed
            .headers
            .iter()
            .find(|h| h.get_key().eq_ignore_ascii_case(name))
            .map(|h| h.get_value())
    };
    assert_eq!(header("To").as_deref(), Some("a@x.com"));
    assert_eq!(header("Cc").as_deref(), Some("c@x.com"));
    assert_eq!(header("Subject").as_deref(), Some("Quarterly report"));

    Ok(())
}

/// Test: Attachments arrive as a multipart message
#[tokio::test]
async fn test_attachments_are_multipart() -> Result<()> {
    let relay = FakeRelay::start().await;
    let mailer = mailer_for(relay.port(), &[]);

    let mut message = email();
    message.attachments.push(Attachment {
        filename: "report.csv".to_string(),
        content_type: "text/csv".to_string(),
        content: b"q,revenue\n1,100\n".to_vec(),
    });
    mailer.send(&message).await?;

    let data = relay.sessions()[0].data.clone();
    let parsed = mailparse::parse_mail(data.as_bytes())?;
    assert_eq!(parsed.ctype.mimetype, "multipart/mixed");
    assert_eq!(parsed.subparts.len(), 2);
    assert_eq!(parsed.subparts[1].get_body_raw()?, b"q,revenue\n1,100\n".to_vec());

    Ok(())
}

/// Test: A 5xx reply to DATA is a permanent rejection
#[tokio::test]
async fn test_550_is_permanent() -> Result<()> {
    let relay = FakeRelay::start_with(relay_with_data_replies(&[550])).await;
    let mailer = mailer_for(relay.port(), &[]);

    let err = mailer.send(&email()).await.unwrap_err();

    assert!(matches!(err, SmtpError::Rejected { code: 550, .. }));
    assert_eq!(err.code(), Some(550));
    assert_eq!(err.classify(1, 2), DeliveryCategory::Permanent);

    Ok(())
}

/// Test: A 4xx reply to DATA is transient and the next session can succeed
#[tokio::test]
async fn test_421_is_transient() -> Result<()> {
    let relay = FakeRelay::start_with(relay_with_data_replies(&[421])).await;
    let mailer = mailer_for(relay.port(), &[]);

    let err = mailer.send(&email()).await.unwrap_err();
    assert_eq!(err.classify(1, 2), DeliveryCategory::Transient);

    let receipt = mailer.send(&email()).await?;
    assert_eq!(receipt.code, 250);
    assert_eq!(relay.sessions().len(), 2);

    Ok(())
}

/// Test: A relay that never greets times out
#[tokio::test]
async fn test_silent_relay_times_out() -> Result<()> {
    let relay = FakeRelay::start_with(RelayBehavior {
        silent: true,
        ..RelayBehavior::default()
    })
    .await;
    let mailer = mailer_for(relay.port(), &[]);

    let err = mailer.send(&email()).await.unwrap_err();

    assert!(matches!(err, SmtpError::Timeout { ref stage, .. } if stage == "greeting"));
    assert_eq!(err.classify(1, 2), DeliveryCategory::Transient);
    assert_eq!(err.classify(3, 2), DeliveryCategory::Permanent);

    Ok(())
}

/// Test: A refused connection is a transient connect error
#[tokio::test]
async fn test_connection_refused() -> Result<()> {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        listener.local_addr()?.port()
    };
    let mailer = mailer_for(port, &[]);

    let err = mailer.send(&email()).await.unwrap_err();

    assert!(matches!(err, SmtpError::Connect(_)), "{err}");
    assert_eq!(err.classify(5, 2), DeliveryCategory::Transient);

    Ok(())
}

/// Test: Credentials are sent with AUTH PLAIN
#[tokio::test]
async fn test_auth_plain_credentials() -> Result<()> {
    let relay = FakeRelay::start().await;
    let mailer = mailer_for(
        relay.port(),
        &[("SMTP_USERNAME", "mailer"), ("SMTP_PASSWORD", "s3cret")],
    );

    mailer.send(&email()).await?;

    let auth = relay.sessions()[0].auth.clone().unwrap_or_default();
    let token = auth.strip_prefix("AUTH PLAIN ").unwrap_or_default();
    assert_eq!(STANDARD.decode(token)?, b"\0mailer\0s3cret".to_vec());

    Ok(())
}

/// Test: Rejected credentials get one transient retry, then turn permanent
#[tokio::test]
async fn test_auth_rejection() -> Result<()> {
    let relay = FakeRelay::start_with(RelayBehavior {
        auth_reply: 535,
        ..RelayBehavior::default()
    })
    .await;
    let mailer = mailer_for(
        relay.port(),
        &[("SMTP_USERNAME", "mailer"), ("SMTP_PASSWORD", "wrong")],
    );

    let err = mailer.send(&email()).await.unwrap_err();

    assert!(matches!(err, SmtpError::Auth { code: 535, .. }));
    assert_eq!(err.classify(1, 2), DeliveryCategory::Transient);
    assert_eq!(err.classify(2, 2), DeliveryCategory::Permanent);
    assert!(relay.sessions().is_empty());

    Ok(())
}

/// Test: Required TLS fails when the relay does not offer STARTTLS
#[tokio::test]
async fn test_required_tls_without_starttls() -> Result<()> {
    let relay = FakeRelay::start().await;
    let mailer = mailer_for(relay.port(), &[("SMTP_TLS", "required")]);

    let err = mailer.send(&email()).await.unwrap_err();

    assert!(matches!(err, SmtpError::Tls(_)), "{err}");
    assert!(relay.sessions().is_empty());

    Ok(())
}

/// Test: Required TLS fails when STARTTLS is refused, opportunistic carries on
#[tokio::test]
async fn test_refused_starttls() -> Result<()> {
    let behavior = RelayBehavior {
        advertise_starttls: true,
        ..RelayBehavior::default()
    };

    let strict_relay = FakeRelay::start_with(behavior.clone()).await;
    let strict = mailer_for(strict_relay.port(), &[("SMTP_TLS", "required")]);
    let err = strict.send(&email()).await.unwrap_err();
    assert!(matches!(err, SmtpError::Tls(ref m) if m.contains("454")), "{err}");

    let relaxed_relay = FakeRelay::start_with(behavior).await;
    let relaxed = mailer_for(relaxed_relay.port(), &[("SMTP_TLS", "opportunistic")]);
    relaxed.send(&email()).await?;
    assert_eq!(relaxed_relay.sessions().len(), 1);

    Ok(())
}

/// Test: Invalid addresses are rejected before connecting
#[tokio::test]
async fn test_invalid_address_is_permanent() -> Result<()> {
    let relay = FakeRelay::start().await;
    let mailer = mailer_for(relay.port(), &[]);

    let mut message = email();
    message.bcc = vec!["bad address@x.com".to_string()];
    let err = mailer.send(&message).await.unwrap_err();

    assert!(matches!(err, SmtpError::InvalidAddress(_)));
    assert_eq!(err.classify(1, 2), DeliveryCategory::Permanent);
    assert!(relay.sessions().is_empty());

    Ok(())
}

/// Test: Body lines starting with a dot survive transmission
#[tokio::test]
async fn test_dot_stuffing_round_trips() -> Result<()> {
    let relay = FakeRelay::start().await;
    let mailer = mailer_for(relay.port(), &[]);

    let mut message = email();
    message.content_type = "text/plain".to_string();
    message.body = "first\n.hidden line\n..double\n.".to_string();
    mailer.send(&message).await?;

    let data = relay.sessions()[0].data.clone();
    assert!(data.contains("\r\n.hidden line\r\n"));
    assert!(data.contains("\r\n..double\r\n"));

    let parsed = mailparse::parse_mail(data.as_bytes())?;
    assert_eq!(
        parsed.get_body()?.replace("\r\n", "\n").trim_end(),
        "first\n.hidden line\n..double\n."
    );

    Ok(())
}
