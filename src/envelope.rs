use async_trait::async_trait;
use log::{debug, error, info, warn};
use std::sync::Arc;

use crate::action::{Delivery, DispatchError, Dispatcher};
use crate::config::Config;
use crate::http::{JsonClient, JsonTransport};
use crate::message::{Message, MessageParser, ParseError};
use crate::router::{check_domain, AddressError};
use crate::spf::{HttpSpfVerifier, SpfPolicy, SpfVerifier};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeState {
    New,
    RecipientAccepted,
    DataStarted,
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum RecipientRejectedError {
    #[error("Not accepting email for domain: {0}")]
    Domain(String),
    #[error(transparent)]
    Malformed(#[from] AddressError),
    #[error("Envelope already has a recipient")]
    AlreadyAccepted,
}

#[derive(Debug, thiserror::Error)]
pub enum CloseError {
    #[error("Envelope closed before any data")]
    NoData,
    #[error("Message dropped: {0}")]
    Parse(#[from] ParseError),
    #[error("Failed to run action: {0}")]
    Dispatch(#[from] DispatchError),
}

/// Protocol events for one inbound message.
///
/// The SMTP session drives any implementer through
/// `New -> RecipientAccepted -> DataStarted -> Closed`.
#[async_trait]
pub trait Envelope: Send {
    fn state(&self) -> EnvelopeState;

    fn on_recipient(&mut self, address: &str) -> Result<(), RecipientRejectedError>;

    fn on_data_start(&mut self);

    fn on_data_chunk(&mut self, bytes: &[u8]);

    /// Parse and dispatch. The envelope is `Closed` afterwards whatever the
    /// outcome.
    async fn on_close(&mut self) -> Result<Delivery, CloseError>;
}

/// Opens an envelope per `MAIL FROM`
pub trait EnvelopeFactory: Send + Sync {
    fn new_envelope(&self, from: &str) -> Box<dyn Envelope>;
}

/// Read-only pipeline shared by every session: parse, then dispatch
pub struct Relay {
    config: Arc<Config>,
    parser: MessageParser,
    dispatcher: Dispatcher,
}

impl Relay {
    pub fn new(config: Arc<Config>, transport: Arc<dyn JsonTransport>) -> Self {
        let client = JsonClient::new(transport);
        let verifier: Option<Arc<dyn SpfVerifier>> = if config.spf.enabled {
            Some(Arc::new(HttpSpfVerifier::new(
                client.clone(),
                config.spf.api_url.clone(),
            )))
        } else {
            None
        };
        Self::with_spf_verifier(config, client, verifier)
    }

    pub fn with_spf_verifier(
        config: Arc<Config>,
        client: JsonClient,
        verifier: Option<Arc<dyn SpfVerifier>>,
    ) -> Self {
        let spf = SpfPolicy::new(config.spf.clone(), verifier);
        Self {
            parser: MessageParser::new(config.routing.clone(), spf),
            dispatcher: Dispatcher::new(&config, client),
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn parser(&self) -> &MessageParser {
        &self.parser
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }
}

impl EnvelopeFactory for Arc<Relay> {
    fn new_envelope(&self, from: &str) -> Box<dyn Envelope> {
        Box::new(MessageEnvelope::new(self.clone(), from))
    }
}

/// The production envelope: buffers DATA, then parses and dispatches
pub struct MessageEnvelope {
    relay: Arc<Relay>,
    message: Message,
    raw: Vec<u8>,
    state: EnvelopeState,
}

impl MessageEnvelope {
    pub fn new(relay: Arc<Relay>, from: &str) -> Self {
        Self {
            relay,
            message: Message::new(from),
            raw: Vec::new(),
            state: EnvelopeState::New,
        }
    }

    pub fn message(&self) -> &Message {
        &self.message
    }
}

#[async_trait]
impl Envelope for MessageEnvelope {
    fn state(&self) -> EnvelopeState {
        self.state
    }

    fn on_recipient(&mut self, address: &str) -> Result<(), RecipientRejectedError> {
        if self.state != EnvelopeState::New {
            return Err(RecipientRejectedError::AlreadyAccepted);
        }

        // Routed on a scratch copy so a rejected address leaves `to` unset
        let mut candidate = self.message.clone();
        candidate.set_recipient(address);
        let routing = self.relay.parser.routing();
        let route = candidate.resolve_route(self.relay.parser.router())?;
        if !check_domain(&route.domain, routing.domain_checking, &routing.valid_domains) {
            info!("Rejecting recipient {}: domain {} not accepted", address, route.domain);
            return Err(RecipientRejectedError::Domain(route.domain.clone()));
        }

        self.message = candidate;
        self.state = EnvelopeState::RecipientAccepted;
        Ok(())
    }

    fn on_data_start(&mut self) {
        self.state = EnvelopeState::DataStarted;
    }

    fn on_data_chunk(&mut self, bytes: &[u8]) {
        if self.state == EnvelopeState::DataStarted {
            self.raw.extend_from_slice(bytes);
        } else {
            warn!("Ignoring {} bytes of data outside the DATA phase", bytes.len());
        }
    }

    async fn on_close(&mut self) -> Result<Delivery, CloseError> {
        let prior = std::mem::replace(&mut self.state, EnvelopeState::Closed);
        if prior != EnvelopeState::DataStarted {
            return Err(CloseError::NoData);
        }
        let raw = std::mem::take(&mut self.raw);
        debug!("Parsing {} bytes from {}", raw.len(), self.message.from);

        if let Err(e) = self.relay.parser.parse(&raw, &mut self.message).await {
            warn!("Dropping message from {}: {}", self.message.from, e);
            return Err(e.into());
        }

        info!(
            "Received message from {}: [{}] {}",
            self.message.from, self.message.subject, self.message.body
        );

        match self.relay.dispatcher.dispatch(&self.message).await {
            Ok(delivery) => Ok(delivery),
            Err(e) => {
                error!("Failed to run action: {}", e);
                Err(e.into())
            }
        }
    }
}
