use std::{
    collections::VecDeque,
    io,
    sync::Mutex,
    time::Duration,
};

use async_trait::async_trait;
use email_service::clients::smtp::{Mailer, OutgoingEmail, SmtpError, SmtpReceipt};

/// One scripted relay outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Accept,
    Reply(u16),
    Timeout,
    Disconnect,
}

impl Step {
    fn outcome(self) -> Result<SmtpReceipt, SmtpError> {
        match self {
            Step::Accept => Ok(SmtpReceipt {
                code: 250,
                message: "2.0.0 queued".to_string(),
            }),
            Step::Reply(code) => Err(SmtpError::Rejected {
                code,
                message: format!("scripted {}", code),
            }),
            Step::Timeout => Err(SmtpError::Timeout {
                stage: "DATA".to_string(),
                after: Duration::from_secs(30),
            }),
            Step::Disconnect => Err(SmtpError::Connect(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "scripted refusal",
            ))),
        }
    }
}

/// Plays `steps` in order, then repeats `fallback`. Records every email it is handed.
pub struct ScriptedMailer {
    steps: Mutex<VecDeque<Step>>,
    fallback: Step,
    sent: Mutex<Vec<OutgoingEmail>>,
}

impl ScriptedMailer {
    pub fn new(steps: impl IntoIterator<Item = Step>, fallback: Step) -> Self {
        Self {
            steps: Mutex::new(steps.into_iter().collect()),
            fallback,
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn always(step: Step) -> Self {
        Self::new([], step)
    }

    pub fn calls(&self) -> Vec<OutgoingEmail> {
        self.sent.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl Mailer for ScriptedMailer {
    async fn send(&self, email: &OutgoingEmail) -> Result<SmtpReceipt, SmtpError> {
        self.sent.lock().unwrap().push(email.clone());
        let step = self.steps.lock().unwrap().pop_front().unwrap_or(self.fallback);
        step.outcome()
    }
}
