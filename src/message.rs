use chrono::{SecondsFormat, Utc};
use log::debug;
use mailparse::{MailHeaderMap, ParsedMail};
use serde::Serialize;

use crate::config::RoutingConfig;
use crate::router::{check_domain, AddressError, AddressRouter, Route};
use crate::spf::SpfPolicy;

/// One inbound message, as posted to the webhook
#[derive(Debug, Clone, Default, Serialize)]
pub struct Message {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub body: String,
    pub time: String,
    #[serde(rename = "spf")]
    pub spf_result: String,
    #[serde(rename = "sender-IP")]
    pub sender_ip: String,
    #[serde(skip)]
    route: Option<Route>,
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("Undecodable message: {0}")]
    Mail(#[from] mailparse::MailParseError),
    #[error("Message has no recipient")]
    MissingRecipient,
    #[error(transparent)]
    MalformedAddress(#[from] AddressError),
    #[error("SPF not pass for sender {sender}: {verdict}")]
    SenderRejected { sender: String, verdict: String },
    #[error("Not accepting email for domain: {0}")]
    DomainRejected(String),
    #[error("No text/plain formatting of message")]
    NoPlainTextPart,
}

impl Message {
    pub fn new(from: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            ..Default::default()
        }
    }

    /// Records the envelope recipient, lower-cased. Only the first call has
    /// any effect.
    pub fn set_recipient(&mut self, to: &str) -> bool {
        if !self.to.is_empty() {
            return false;
        }
        self.to = to.to_lowercase();
        true
    }

    pub fn route(&self) -> Option<&Route> {
        self.route.as_ref()
    }

    /// Derives the route from `to` the first time round and keeps it
    pub fn resolve_route(&mut self, router: &AddressRouter) -> Result<&Route, AddressError> {
        let route = match self.route.take() {
            Some(route) => route,
            None => router.split(&self.to)?,
        };
        Ok(self.route.insert(route))
    }
}

/// Collapses line breaks in an extracted text part into single spaces
pub fn normalize_body(text: &str) -> String {
    text.trim().replace("\r\n", " ").replace('\n', " ")
}

/// Turns the raw DATA stream into the fields of a [`Message`]
pub struct MessageParser {
    router: AddressRouter,
    routing: RoutingConfig,
    spf: SpfPolicy,
}

impl MessageParser {
    pub fn new(routing: RoutingConfig, spf: SpfPolicy) -> Self {
        Self {
            router: AddressRouter::new(routing.api_route.clone()),
            routing,
            spf,
        }
    }

    pub fn router(&self) -> &AddressRouter {
        &self.router
    }

    pub fn routing(&self) -> &RoutingConfig {
        &self.routing
    }

    /// Fill `message` from `raw`. Each step must succeed before the next
    /// runs, so a message that fails here never reaches dispatch.
    pub async fn parse(&self, raw: &[u8], message: &mut Message) -> Result<(), ParseError> {
        let mail = mailparse::parse_mail(raw)?;
        let headers = &mail.headers;
        let received = headers.get_first_value("Received").unwrap_or_default();

        // Standalone parsing (no SMTP envelope) takes the addresses from the headers
        if message.from.is_empty() {
            if let Some(from) = headers.get_first_value("From") {
                message.from = first_address(&from).unwrap_or(from);
            }
        }
        if message.to.is_empty() {
            let to = headers
                .get_first_value("To")
                .ok_or(ParseError::MissingRecipient)?;
            let to = first_address(&to).unwrap_or(to);
            message.set_recipient(&to);
        } else if let Some(to) = headers.get_first_value("To") {
            debug!("To header {:?}, envelope recipient {}", to, message.to);
        }

        let verdict = self.spf.lookup(&message.from, &received).await;
        message.spf_result = verdict.result.clone();
        message.sender_ip = verdict.sender_ip.clone();
        if !self.spf.admits(&verdict) {
            return Err(ParseError::SenderRejected {
                sender: message.from.clone(),
                verdict: verdict.result,
            });
        }

        message.time = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);

        let route = message.resolve_route(&self.router)?;
        if !check_domain(
            &route.domain,
            self.routing.domain_checking,
            &self.routing.valid_domains,
        ) {
            return Err(ParseError::DomainRejected(route.domain.clone()));
        }

        message.subject = headers.get_first_value("Subject").unwrap_or_default();
        message.body = extract_plain_text(&mail)?;

        Ok(())
    }
}

fn first_address(header: &str) -> Option<String> {
    let list = mailparse::addrparse(header).ok()?;
    list.iter().find_map(|addr| match addr {
        mailparse::MailAddr::Single(info) => Some(info.addr.clone()),
        mailparse::MailAddr::Group(group) => group.addrs.first().map(|info| info.addr.clone()),
    })
}

/// Body text of a multipart message.
///
/// Non-multipart messages carry no extractable text and yield an empty body.
/// In a multipart message the first part must be `text/plain`; any other
/// leading part fails the message.
fn extract_plain_text(mail: &ParsedMail<'_>) -> Result<String, ParseError> {
    if !mail.ctype.mimetype.starts_with("multipart") {
        return Ok(String::new());
    }

    let part = mail.subparts.first().ok_or(ParseError::NoPlainTextPart)?;
    let content_type = part
        .headers
        .get_first_value("Content-Type")
        .unwrap_or_default()
        .to_ascii_lowercase();
    if !content_type.contains("text/plain") {
        debug!("Leading part is {:?}, not text/plain", content_type);
        return Err(ParseError::NoPlainTextPart);
    }

    Ok(normalize_body(&part.get_body()?))
}
