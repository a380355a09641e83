use std::{future::Future, sync::Arc, time::Duration};

use rustls::{
    ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::{CryptoProvider, ring},
    pki_types::{CertificateDer, ServerName, UnixTime},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::timeout,
};
use tokio_rustls::{TlsConnector, client::TlsStream};
use tracing::warn;

use super::{error::SmtpError, response::Response};

const BUFFER_SIZE: usize = 8192;
const MAX_BUFFER_SIZE: usize = 1024 * 1024;

enum Stream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl Stream {
    async fn write_all(&mut self, data: &[u8]) -> Result<(), SmtpError> {
        match self {
            Self::Plain(stream) => stream.write_all(data).await?,
            Self::Tls(stream) => stream.write_all(data).await?,
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), SmtpError> {
        match self {
            Self::Plain(stream) => stream.flush().await?,
            Self::Tls(stream) => stream.flush().await?,
        }
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, SmtpError> {
        let n = match self {
            Self::Plain(stream) => stream.read(buf).await?,
            Self::Tls(stream) => stream.read(buf).await?,
        };
        if n == 0 {
            return Err(SmtpError::ConnectionClosed);
        }
        Ok(n)
    }
}

/// One client session with a relay. Every read is bounded by the command timeout.
pub struct SmtpConnection {
    stream: Option<Stream>,
    buffer: Vec<u8>,
    buffer_pos: usize,
    command_timeout: Duration,
}

impl SmtpConnection {
    pub async fn connect(
        host: &str,
        port: u16,
        dial_timeout: Duration,
        command_timeout: Duration,
    ) -> Result<Self, SmtpError> {
        let stream = timeout(dial_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| SmtpError::Timeout {
                stage: "connect".to_string(),
                after: dial_timeout,
            })?
            .map_err(SmtpError::Connect)?;

        Ok(Self {
            stream: Some(Stream::Plain(stream)),
            buffer: vec![0u8; BUFFER_SIZE],
            buffer_pos: 0,
            command_timeout,
        })
    }

    pub fn is_tls(&self) -> bool {
        matches!(self.stream, Some(Stream::Tls(_)))
    }

    fn stream(&mut self) -> Result<&mut Stream, SmtpError> {
        self.stream.as_mut().ok_or(SmtpError::ConnectionClosed)
    }

    async fn bounded<T>(
        &self,
        stage: &str,
        operation: impl Future<Output = Result<T, SmtpError>>,
    ) -> Result<T, SmtpError> {
        timeout(self.command_timeout, operation)
            .await
            .map_err(|_| SmtpError::Timeout {
                stage: stage.to_string(),
                after: self.command_timeout,
            })?
    }

    pub async fn read_greeting(&mut self) -> Result<Response, SmtpError> {
        let limit = self.command_timeout;
        timeout(limit, self.read_response())
            .await
            .map_err(|_| SmtpError::Timeout {
                stage: "greeting".to_string(),
                after: limit,
            })?
    }

    /// Sends `command` and reads the reply.
    pub async fn command(&mut self, command: &str) -> Result<Response, SmtpError> {
        let verb = command
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_ascii_uppercase();
        let limit = self.command_timeout;

        let exchange = async {
            let stream = self.stream()?;
            stream.write_all(command.as_bytes()).await?;
            stream.write_all(b"\r\n").await?;
            stream.flush().await?;
            self.read_response().await
        };

        timeout(limit, exchange)
            .await
            .map_err(|_| SmtpError::Timeout {
                stage: verb,
                after: limit,
            })?
    }

    /// Transmits a message after `354`, dot-stuffing lines and appending the
    /// terminating `.` line.
    pub async fn send_data(&mut self, message: &str) -> Result<Response, SmtpError> {
        let mut payload = String::with_capacity(message.len() + 64);
        for line in message.split("\r\n") {
            if line.starts_with('.') {
                payload.push('.');
            }
            payload.push_str(line);
            payload.push_str("\r\n");
        }
        if message.ends_with("\r\n") {
            // `split` yields a trailing empty line for the final CRLF.
            payload.truncate(payload.len() - 2);
        }
        payload.push_str(".\r\n");

        let limit = self.command_timeout;
        let exchange = async {
            let stream = self.stream()?;
            stream.write_all(payload.as_bytes()).await?;
            stream.flush().await?;
            self.read_response().await
        };

        timeout(limit, exchange)
            .await
            .map_err(|_| SmtpError::Timeout {
                stage: "DATA".to_string(),
                after: limit,
            })?
    }

    /// Replaces the plain stream with a TLS stream after a `220` to STARTTLS.
    pub async fn upgrade_to_tls(
        &mut self,
        domain: &str,
        accept_invalid_certs: bool,
    ) -> Result<(), SmtpError> {
        let plain = match self.stream.take() {
            Some(Stream::Plain(stream)) => stream,
            Some(tls @ Stream::Tls(_)) => {
                self.stream = Some(tls);
                return Err(SmtpError::Tls("connection is already TLS".to_string()));
            }
            None => return Err(SmtpError::ConnectionClosed),
        };

        let connector = TlsConnector::from(Arc::new(tls_config(accept_invalid_certs)?));
        let server_name = ServerName::try_from(domain.to_string())
            .map_err(|e| SmtpError::Tls(format!("invalid domain: {e}")))?;

        let tls = self
            .bounded("TLS handshake", async move {
                connector
                    .connect(server_name, plain)
                    .await
                    .map_err(|e| SmtpError::Tls(e.to_string()))
            })
            .await?;

        self.stream = Some(Stream::Tls(Box::new(tls)));
        self.buffer_pos = 0;
        Ok(())
    }

    async fn read_response(&mut self) -> Result<Response, SmtpError> {
        loop {
            if let Some((response, consumed)) =
                Response::parse_response(&self.buffer[..self.buffer_pos])?
            {
                self.buffer.copy_within(consumed..self.buffer_pos, 0);
                self.buffer_pos -= consumed;
                return Ok(response);
            }

            if self.buffer_pos >= self.buffer.len() {
                let new_size = self.buffer.len() * 2;
                if new_size > MAX_BUFFER_SIZE {
                    return Err(SmtpError::Protocol(format!(
                        "response too large (exceeds {MAX_BUFFER_SIZE} bytes)"
                    )));
                }
                self.buffer.resize(new_size, 0);
            }

            let pos = self.buffer_pos;
            let stream = self.stream.as_mut().ok_or(SmtpError::ConnectionClosed)?;
            let n = stream.read(&mut self.buffer[pos..]).await?;
            self.buffer_pos += n;
        }
    }
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(ring::default_provider())
}

fn tls_config(accept_invalid_certs: bool) -> Result<ClientConfig, SmtpError> {
    let mut roots = RootCertStore::empty();

    let native = rustls_native_certs::load_native_certs();
    for cert in native.certs {
        if let Err(e) = roots.add(cert) {
            warn!(error = %e, "Skipping unusable system certificate");
        }
    }
    if !native.errors.is_empty() {
        warn!(errors = ?native.errors, "Some system certificates could not be loaded");
    }

    let provider = provider();
    let mut config = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .map_err(|e| SmtpError::Tls(e.to_string()))?
        .with_root_certificates(roots)
        .with_no_client_auth();

    if accept_invalid_certs {
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(NoVerifier { provider }));
    }

    Ok(config)
}

/// Accepts any server certificate. Only reachable with `SMTP_ACCEPT_INVALID_CERTS`.
#[derive(Debug)]
struct NoVerifier {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
