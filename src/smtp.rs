use futures::stream::{FuturesUnordered, StreamExt};
use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::config::ServerConfig;
use crate::envelope::{CloseError, EnvelopeFactory, RecipientRejectedError};
use crate::message::ParseError;
use crate::session::{EnvelopeHandle, SessionError};
use crate::shutdown;

/// RFC 5321 allows 512 octets per command line; longer ones are refused.
const COMMAND_LINE_LIMIT: u64 = 1024;

/// Inbound mail listener.
///
/// Speaks enough of RFC 5321 for relays to hand over single-recipient
/// messages: HELO/EHLO, MAIL, RCPT, DATA, RSET, NOOP, VRFY and QUIT. Each
/// `MAIL FROM` opens an envelope from the factory; the lone `.` closing DATA
/// parses and dispatches it before the final reply is written.
pub struct SmtpServer {
    hostname: String,
    max_message_size: usize,
    factory: Arc<dyn EnvelopeFactory>,
}

#[derive(Default)]
struct Session {
    helo: Option<String>,
    envelope: Option<EnvelopeHandle>,
    has_recipient: bool,
    data: Option<DataPhase>,
}

#[derive(Default)]
struct DataPhase {
    size: usize,
    oversize: bool,
}

impl Session {
    fn reset(&mut self) {
        self.envelope = None;
        self.has_recipient = false;
        self.data = None;
    }
}

impl SmtpServer {
    pub fn new(config: &ServerConfig, factory: Arc<dyn EnvelopeFactory>) -> Self {
        Self {
            hostname: config.hostname.clone(),
            max_message_size: config.max_message_size,
            factory,
        }
    }

    /// Accepts until `must_exit` flips, then waits for open sessions to end
    pub async fn run(
        self: Arc<Self>,
        listener: TcpListener,
        mut must_exit: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        info!("SMTP listening on {}", listener.local_addr()?);

        let mut connections = FuturesUnordered::new();
        while !*must_exit.borrow() {
            let wait_conn_finished = async {
                if connections.is_empty() {
                    futures::future::pending().await
                } else {
                    connections.next().await
                }
            };
            let (socket, remote_addr) = tokio::select! {
                a = listener.accept() => a?,
                _ = wait_conn_finished => continue,
                _ = shutdown::requested(&mut must_exit) => continue,
            };
            debug!("Accepted SMTP connection from {}", remote_addr);

            let server = self.clone();
            let exit = must_exit.clone();
            let conn = tokio::spawn(async move {
                if let Err(e) = server.handle_connection(socket, exit).await {
                    warn!("SMTP session with {} ended with error: {}", remote_addr, e);
                }
            });
            connections.push(conn);
        }
        drop(listener);

        info!(
            "SMTP listener shutting down, draining {} session(s)",
            connections.len()
        );
        while connections.next().await.is_some() {}

        Ok(())
    }

    pub async fn handle_connection<S>(
        &self,
        stream: S,
        mut must_exit: watch::Receiver<bool>,
    ) -> std::io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = BufReader::new(read_half);
        let mut writer = BufWriter::new(write_half);
        let data_line_limit = self.max_message_size as u64 + 2;

        write_reply(&mut writer, &format!("220 {} ESMTP dewmail", self.hostname)).await?;

        let mut session = Session::default();
        let mut buf = Vec::new();
        let mut overlong = false;
        loop {
            buf.clear();
            let in_data = session.data.is_some();
            let line_limit = if in_data { data_line_limit } else { COMMAND_LINE_LIMIT };
            let mut limited = (&mut reader).take(line_limit);
            let n = tokio::select! {
                n = limited.read_until(b'\n', &mut buf) => n?,
                _ = shutdown::requested(&mut must_exit), if !in_data => {
                    write_reply(&mut writer, "421 4.3.2 Service shutting down").await?;
                    break;
                }
            };
            if n == 0 {
                if session.envelope.is_some() {
                    debug!("Connection closed with an open envelope, discarding it");
                }
                break;
            }

            if !in_data {
                let complete = buf.ends_with(b"\n");
                if overlong {
                    // Rest of a refused command line
                    overlong = !complete;
                    continue;
                }
                if !complete && buf.len() as u64 >= line_limit {
                    write_reply(&mut writer, "500 5.5.2 Line too long").await?;
                    overlong = true;
                    continue;
                }
            }

            let line = trim_line_ending(&buf);

            if let Some(data) = session.data.as_mut() {
                if line == b"." {
                    let reply = self.finish_data(&mut session).await;
                    write_reply(&mut writer, reply).await?;
                    continue;
                }

                // Dot unstuffing
                let line = line.strip_prefix(b".").unwrap_or(line);
                data.size += line.len() + 2;
                if data.size > self.max_message_size {
                    data.oversize = true;
                }
                if data.oversize {
                    continue;
                }

                let mut chunk = Vec::with_capacity(line.len() + 2);
                chunk.extend_from_slice(line);
                chunk.extend_from_slice(b"\r\n");
                let forwarded = match &session.envelope {
                    Some(envelope) => envelope.data_chunk(chunk).await.is_ok(),
                    None => false,
                };
                if !forwarded {
                    warn!("Envelope worker went away during DATA");
                    data.oversize = true;
                }
                continue;
            }

            let line = String::from_utf8_lossy(line);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (verb, arg) = match line.split_once(' ') {
                Some((verb, arg)) => (verb.to_ascii_uppercase(), arg.trim()),
                None => (line.to_ascii_uppercase(), ""),
            };

            match verb.as_str() {
                "EHLO" => {
                    session.helo = Some(arg.to_string());
                    session.reset();
                    write_reply(&mut writer, &format!("250-{}", self.hostname)).await?;
                    write_reply(&mut writer, "250-PIPELINING").await?;
                    write_reply(&mut writer, &format!("250-SIZE {}", self.max_message_size)).await?;
                    write_reply(&mut writer, "250 8BITMIME").await?;
                }
                "HELO" => {
                    session.helo = Some(arg.to_string());
                    session.reset();
                    write_reply(&mut writer, &format!("250 {}", self.hostname)).await?;
                }
                "MAIL" => {
                    let reply = self.mail_from(&mut session, arg);
                    write_reply(&mut writer, reply).await?;
                }
                "RCPT" => {
                    let reply = self.rcpt_to(&mut session, arg).await;
                    write_reply(&mut writer, reply).await?;
                }
                "DATA" => {
                    let reply = match &session.envelope {
                        None => "503 5.5.1 Need MAIL command",
                        Some(_) if !session.has_recipient => "503 5.5.1 Need RCPT command",
                        Some(envelope) => match envelope.data_start().await {
                            Ok(()) => {
                                session.data = Some(DataPhase::default());
                                "354 End data with <CR><LF>.<CR><LF>"
                            }
                            Err(_) => {
                                session.reset();
                                "451 4.3.0 Temporary failure"
                            }
                        },
                    };
                    write_reply(&mut writer, reply).await?;
                }
                "RSET" => {
                    session.reset();
                    write_reply(&mut writer, "250 2.0.0 OK").await?;
                }
                "NOOP" => write_reply(&mut writer, "250 2.0.0 OK").await?,
                "VRFY" => write_reply(&mut writer, "252 2.1.5 Cannot VRFY user").await?,
                "QUIT" => {
                    write_reply(&mut writer, "221 2.0.0 Bye").await?;
                    break;
                }
                _ => {
                    write_reply(&mut writer, "500 5.5.2 Syntax error, command unrecognized").await?
                }
            }
        }

        writer.shutdown().await.ok();
        Ok(())
    }

    fn mail_from(&self, session: &mut Session, arg: &str) -> &'static str {
        if session.helo.is_none() {
            return "503 5.5.1 Send EHLO/HELO first";
        }
        if session.envelope.is_some() {
            return "503 5.5.1 Nested MAIL command";
        }
        let Some(from) = command_address(arg, "FROM:") else {
            return "501 5.5.4 Syntax: MAIL FROM:<address>";
        };

        debug!("New envelope from {:?}", from);
        session.envelope = Some(EnvelopeHandle::spawn(self.factory.new_envelope(&from)));
        session.has_recipient = false;
        "250 2.1.0 Sender OK"
    }

    async fn rcpt_to(&self, session: &mut Session, arg: &str) -> &'static str {
        let Some(envelope) = &session.envelope else {
            return "503 5.5.1 Need MAIL command";
        };
        let Some(to) = command_address(arg, "TO:") else {
            return "501 5.5.4 Syntax: RCPT TO:<address>";
        };

        match envelope.recipient(&to).await {
            Ok(()) => {
                session.has_recipient = true;
                "250 2.1.5 Recipient OK"
            }
            Err(SessionError::Rejected(RecipientRejectedError::AlreadyAccepted)) => {
                "452 4.5.3 Too many recipients"
            }
            Err(SessionError::Rejected(RecipientRejectedError::Malformed(e))) => {
                debug!("Malformed recipient {:?}: {}", to, e);
                "501 5.1.3 Invalid recipient syntax"
            }
            Err(SessionError::Rejected(RecipientRejectedError::Domain(_))) => {
                "550 5.7.1 Relaying denied"
            }
            Err(e) => {
                warn!("Recipient {} not processed: {}", to, e);
                "451 4.3.0 Temporary failure"
            }
        }
    }

    async fn finish_data(&self, session: &mut Session) -> &'static str {
        let oversize = session.data.take().map(|d| d.oversize).unwrap_or(false);
        let envelope = session.envelope.take();
        session.has_recipient = false;

        if oversize {
            info!("Discarding message over {} bytes", self.max_message_size);
            return "552 5.3.4 Message size exceeds fixed maximum";
        }
        let Some(envelope) = envelope else {
            return "451 4.3.0 Temporary failure";
        };

        match envelope.close().await {
            Ok(delivery) => {
                debug!("Delivered to {}", delivery.url);
                "250 2.0.0 OK"
            }
            Err(SessionError::Close(CloseError::Parse(ParseError::SenderRejected { .. }))) => {
                "550 5.7.23 SPF validation failed"
            }
            Err(SessionError::Close(CloseError::Parse(_))) => "554 5.6.0 Message rejected",
            Err(SessionError::Close(CloseError::Dispatch(e))) if e.is_delivered_uncounted() => {
                "250 2.0.0 OK"
            }
            Err(e) => {
                error!("Message not delivered: {}", e);
                "451 4.3.0 Temporary failure"
            }
        }
    }
}

async fn write_reply<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\r\n").await?;
    writer.flush().await
}

fn trim_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Address out of `FROM:<a@b> SIZE=1` / `TO:<a@b>`; `<>` is the null sender
fn command_address(arg: &str, keyword: &str) -> Option<String> {
    let head = arg.get(..keyword.len())?;
    if !head.eq_ignore_ascii_case(keyword) {
        return None;
    }
    let rest = arg[keyword.len()..].trim_start();
    let addr = rest.split_whitespace().next().unwrap_or("");
    let addr = match addr.strip_prefix('<') {
        Some(inner) => inner.strip_suffix('>')?,
        None => addr,
    };
    Some(addr.trim().to_string())
}
