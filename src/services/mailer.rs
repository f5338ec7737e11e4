//! Outgoing mail.
//!
//! `SmtpMailer` talks to a real relay. `LogMailer` only logs, for servers
//! running without SMTP. `MemoryMailer` keeps messages for tests.

use async_trait::async_trait;
use lettre::{
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
    message::{Mailbox, MultiPart},
    transport::smtp::authentication::Credentials,
};
use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, PoisonError},
};
use thiserror::Error;

use crate::config::SmtpConfig;

#[derive(Debug, Error)]
pub enum MailError {
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("message rejected: {0}")]
    Rejected(String),
    #[error("mail transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingEmail {
    pub to: String,
    pub subject: String,
    pub text: String,
    pub html: String,
}

#[async_trait]
pub trait Mailer: Send + Sync {
    /// Deliver one message to one recipient.
    async fn send(&self, email: &OutgoingEmail) -> Result<(), MailError>;

    fn name(&self) -> &'static str;
}

pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpMailer {
    pub fn new(config: &SmtpConfig) -> Result<Self, MailError> {
        let from: Mailbox = config
            .from
            .parse()
            .map_err(|e| MailError::InvalidAddress(format!("{}: {}", config.from, e)))?;

        let builder = if config.starttls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
                .map_err(|e| MailError::Transport(e.to_string()))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host)
        };
        let builder = builder.port(config.port);
        let builder = match (&config.username, &config.password) {
            (Some(user), Some(password)) => {
                builder.credentials(Credentials::new(user.clone(), password.clone()))
            }
            _ => builder,
        };

        tracing::info!(
            host = %config.host,
            port = config.port,
            starttls = config.starttls,
            "SMTP mailer initialized"
        );
        Ok(Self {
            transport: builder.build(),
            from,
        })
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, email: &OutgoingEmail) -> Result<(), MailError> {
        let to: Mailbox = email
            .to
            .parse()
            .map_err(|e| MailError::InvalidAddress(format!("{}: {}", email.to, e)))?;

        let message = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(email.subject.clone())
            .multipart(MultiPart::alternative_plain_html(
                email.text.clone(),
                email.html.clone(),
            ))
            .map_err(|e| MailError::Rejected(e.to_string()))?;

        self.transport.send(message).await.map_err(|e| {
            if e.is_permanent() {
                MailError::Rejected(e.to_string())
            } else {
                MailError::Transport(e.to_string())
            }
        })?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "smtp"
    }
}

#[derive(Default)]
struct MemoryState {
    sent: Vec<OutgoingEmail>,
    /// Remaining forced failures per address; `None` fails forever.
    failures: HashMap<String, Option<u32>>,
}

/// Records messages instead of sending them.
#[derive(Default)]
pub struct MemoryMailer {
    state: Mutex<MemoryState>,
}

impl MemoryMailer {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn sent(&self) -> Vec<OutgoingEmail> {
        self.state().sent.clone()
    }

    pub fn sent_to(&self, address: &str) -> Vec<OutgoingEmail> {
        self.state()
            .sent
            .iter()
            .filter(|m| m.to.eq_ignore_ascii_case(address))
            .cloned()
            .collect()
    }

    /// Fail the next `times` sends to `address`.
    pub fn fail_next(&self, address: &str, times: u32) {
        self.state()
            .failures
            .insert(address.to_ascii_lowercase(), Some(times));
    }

    /// Reject every send to `address`.
    pub fn reject_always(&self, address: &str) {
        self.state().failures.insert(address.to_ascii_lowercase(), None);
    }
}

#[async_trait]
impl Mailer for MemoryMailer {
    async fn send(&self, email: &OutgoingEmail) -> Result<(), MailError> {
        let mut state = self.state();
        let address = email.to.to_ascii_lowercase();
        match state.failures.get_mut(&address) {
            Some(None) => {
                return Err(MailError::Rejected(format!("{} rejected by provider", email.to)));
            }
            Some(Some(remaining)) if *remaining > 0 => {
                *remaining -= 1;
                return Err(MailError::Transport("temporary failure".into()));
            }
            _ => {}
        }
        state.sent.push(email.clone());
        tracing::debug!(to = %email.to, subject = %email.subject, "mail recorded");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Logs each message and drops it. Keeps nothing between sends.
#[derive(Debug, Default)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, email: &OutgoingEmail) -> Result<(), MailError> {
        email
            .to
            .parse::<Mailbox>()
            .map_err(|e| MailError::InvalidAddress(format!("{}: {}", email.to, e)))?;
        tracing::info!(to = %email.to, subject = %email.subject, "mail not sent (no SMTP relay)");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "log"
    }
}
