pub mod action;
pub mod config;
pub mod counter;
pub mod envelope;
pub mod health;
pub mod http;
pub mod logging;
pub mod message;
pub mod router;
pub mod session;
pub mod shutdown;
pub mod smtp;
pub mod spf;

pub use action::{Action, Delivery, DispatchError, Dispatcher};
pub use config::Config;
pub use envelope::{Envelope, EnvelopeFactory, EnvelopeState, MessageEnvelope, Relay};
pub use http::{HttpError, JsonClient, JsonTransport, Method, ReqwestTransport};
pub use message::{Message, MessageParser, ParseError};
pub use router::{AddressRouter, Route};
pub use smtp::SmtpServer;
