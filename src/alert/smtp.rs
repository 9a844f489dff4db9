use anyhow::{Context, Result};
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use crate::config::{SmtpConfig, SmtpSecurity};

use super::{AlertMessage, Notifier};

/// Delivers alerts through an authenticated SMTP relay.
pub struct SmtpNotifier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpNotifier {
    /// Builds the transport. Does not connect until the first send.
    pub fn new(cfg: &SmtpConfig) -> Result<Self> {
        let builder = match cfg.security {
            SmtpSecurity::Starttls => {
                AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&cfg.host)
                    .with_context(|| format!("configuring STARTTLS relay {}", cfg.host))?
            }
            SmtpSecurity::Tls => AsyncSmtpTransport::<Tokio1Executor>::relay(&cfg.host)
                .with_context(|| format!("configuring TLS relay {}", cfg.host))?,
            SmtpSecurity::Plain => {
                AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&cfg.host)
            }
        };

        let transport = builder
            .port(cfg.port)
            .credentials(Credentials::new(
                cfg.username.clone(),
                cfg.password.clone(),
            ))
            .timeout(Some(cfg.timeout))
            .build();

        let from = cfg
            .sender()
            .parse()
            .with_context(|| format!("invalid sender address {:?}", cfg.sender()))?;

        Ok(Self { transport, from })
    }
}

impl Notifier for SmtpNotifier {
    fn name(&self) -> &str {
        "smtp"
    }

    async fn send(&self, message: &AlertMessage) -> Result<()> {
        let email = build_message(&self.from, message)?;

        self.transport
            .send(email)
            .await
            .with_context(|| format!("sending alert mail to {}", message.recipient))?;

        Ok(())
    }
}

/// Builds a plain-text mail for an alert.
pub fn build_message(from: &Mailbox, message: &AlertMessage) -> Result<Message> {
    let to: Mailbox = message
        .recipient
        .parse()
        .with_context(|| format!("invalid recipient address {:?}", message.recipient))?;

    Message::builder()
        .from(from.clone())
        .to(to)
        .subject(message.subject.as_str())
        .header(ContentType::TEXT_PLAIN)
        .body(message.body.clone())
        .context("building alert mail")
}
