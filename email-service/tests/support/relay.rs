use std::{
    collections::VecDeque,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    time::sleep,
};

/// What one client session handed to the relay.
#[derive(Debug, Clone, Default)]
pub struct RelaySession {
    pub helo: Option<String>,
    pub auth: Option<String>,
    pub mail_from: Option<String>,
    pub rcpt_to: Vec<String>,
    pub data: String,
}

#[derive(Debug, Clone)]
pub struct RelayBehavior {
    /// Accept connections but never send a greeting.
    pub silent: bool,
    pub advertise_starttls: bool,
    pub auth_reply: u16,
    /// Final reply per DATA, in order; `250` once exhausted.
    pub data_replies: VecDeque<u16>,
}

impl Default for RelayBehavior {
    fn default() -> Self {
        Self {
            silent: false,
            advertise_starttls: false,
            auth_reply: 235,
            data_replies: VecDeque::new(),
        }
    }
}

/// Minimal scripted SMTP server on a local port.
pub struct FakeRelay {
    pub addr: SocketAddr,
    sessions: Arc<Mutex<Vec<RelaySession>>>,
}

impl FakeRelay {
    pub async fn start() -> Self {
        Self::start_with(RelayBehavior::default()).await
    }

    pub async fn start_with(behavior: RelayBehavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let sessions = Arc::new(Mutex::new(Vec::new()));
        let behavior = Arc::new(Mutex::new(behavior));

        let recorded = Arc::clone(&sessions);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let recorded = Arc::clone(&recorded);
                let behavior = Arc::clone(&behavior);
                tokio::spawn(async move {
                    let _ = serve(stream, behavior, recorded).await;
                });
            }
        });

        Self { addr, sessions }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Sessions that completed DATA.
    pub fn sessions(&self) -> Vec<RelaySession> {
        self.sessions.lock().unwrap().clone()
    }
}

fn angle_address(command: &str) -> String {
    command
        .split_once('<')
        .and_then(|(_, rest)| rest.split_once('>'))
        .map(|(address, _)| address.to_string())
        .unwrap_or_default()
}

async fn serve(
    stream: TcpStream,
    behavior: Arc<Mutex<RelayBehavior>>,
    sessions: Arc<Mutex<Vec<RelaySession>>>,
) -> std::io::Result<()> {
    let (silent, advertise_starttls, auth_reply) = {
        let b = behavior.lock().unwrap();
        (b.silent, b.advertise_starttls, b.auth_reply)
    };

    if silent {
        sleep(Duration::from_secs(30)).await;
        return Ok(());
    }

    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);
    let mut session = RelaySession::default();
    let mut line = String::new();

    write.write_all(b"220 fake.relay ESMTP ready\r\n").await?;

    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        let command = line.trim_end().to_string();
        let verb = command
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_ascii_uppercase();

        match verb.as_str() {
            "EHLO" => {
                session.helo = command.split_whitespace().nth(1).map(str::to_string);
                let mut reply = String::from("250-fake.relay\r\n250-AUTH PLAIN\r\n");
                if advertise_starttls {
                    reply.push_str("250-STARTTLS\r\n");
                }
                reply.push_str("250 8BITMIME\r\n");
                write.write_all(reply.as_bytes()).await?;
            }
            "HELO" => write.write_all(b"250 fake.relay\r\n").await?,
            "AUTH" => {
                session.auth = Some(command.clone());
                let reply = if auth_reply == 235 {
                    "235 2.7.0 authenticated\r\n".to_string()
                } else {
                    format!("{} 5.7.8 authentication failed\r\n", auth_reply)
                };
                write.write_all(reply.as_bytes()).await?;
            }
            "STARTTLS" => write.write_all(b"454 4.7.0 TLS not available\r\n").await?,
            "MAIL" => {
                session.mail_from = Some(angle_address(&command));
                write.write_all(b"250 2.1.0 OK\r\n").await?;
            }
            "RCPT" => {
                session.rcpt_to.push(angle_address(&command));
                write.write_all(b"250 2.1.5 OK\r\n").await?;
            }
            "DATA" => {
                write.write_all(b"354 end with <CRLF>.<CRLF>\r\n").await?;

                let mut data = String::new();
                loop {
                    line.clear();
                    if reader.read_line(&mut line).await? == 0 {
                        return Ok(());
                    }
                    if line == ".\r\n" {
                        break;
                    }
                    match line.strip_prefix('.') {
                        Some(unstuffed) => data.push_str(unstuffed),
                        None => data.push_str(&line),
                    }
                }
                session.data = data;

                let code = behavior
                    .lock()
                    .unwrap()
                    .data_replies
                    .pop_front()
                    .unwrap_or(250);
                sessions.lock().unwrap().push(session.clone());

                let reply = if code == 250 {
                    "250 2.0.0 queued as FAKE1\r\n".to_string()
                } else {
                    format!("{} scripted rejection\r\n", code)
                };
                write.write_all(reply.as_bytes()).await?;
            }
            "RSET" | "NOOP" => write.write_all(b"250 OK\r\n").await?,
            "QUIT" => {
                write.write_all(b"221 bye\r\n").await?;
                return Ok(());
            }
            _ => write.write_all(b"502 command not implemented\r\n").await?,
        }
    }
}
