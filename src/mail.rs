//! SMTP delivery for watchdog alerts

use crate::alert::Notifier;
use crate::config::MailConfig;
use crate::{IntakeError, Result};
use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

/// SMTP-backed [`Notifier`]
///
/// TLS is opportunistic and accepts self-signed certificates; alert mail
/// usually goes through an internal relay.
pub struct MailNotifier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl MailNotifier {
    pub fn new(config: &MailConfig) -> Result<Self> {
        let from: Mailbox = config
            .from
            .parse()
            .map_err(|e| IntakeError::Mail(format!("invalid from address: {e}")))?;
        let tls = TlsParameters::builder(config.server.clone())
            .dangerous_accept_invalid_certs(true)
            .build()
            .map_err(|e| IntakeError::Mail(e.to_string()))?;
        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(
            config.server.as_str(),
        )
        .port(config.port)
        .tls(Tls::Opportunistic(tls));
        if !config.username.is_empty() {
            builder = builder.credentials(Credentials::new(
                config.username.clone(),
                config.password.clone(),
            ));
        }
        Ok(Self {
            transport: builder.build(),
            from,
        })
    }
}

#[async_trait]
impl Notifier for MailNotifier {
    async fn notify(&self, recipient: &str, subject: &str, body_html: &str) -> anyhow::Result<()> {
        let message = Message::builder()
            .from(self.from.clone())
            .to(recipient.parse()?)
            .subject(subject)
            .header(ContentType::TEXT_HTML)
            .body(body_html.to_string())?;
        self.transport.send(message).await?;
        Ok(())
    }
}
