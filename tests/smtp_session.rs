use async_trait::async_trait;
use dewmail::envelope::Relay;
use dewmail::http::{HttpError, JsonTransport, Method};
use dewmail::smtp::SmtpServer;
use dewmail::Config;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

const COUNT_URL: &str = "http://store.test/mailsSent.json";
const MIRROR_URL: &str = "http://store.test/messages.json";

/// Webhook receivers and a datastore that takes any larger count
#[derive(Default)]
struct FakeBackend {
    count: Mutex<i64>,
    calls: Mutex<Vec<(Method, String, String)>>,
}

#[async_trait]
impl JsonTransport for FakeBackend {
    async fn request(&self, method: Method, url: &str, body: Option<&[u8]>) -> Result<String, HttpError> {
        let body = body.map(|b| String::from_utf8_lossy(b).to_string()).unwrap_or_default();
        self.calls.lock().unwrap().push((method, url.to_string(), body.clone()));

        let mut count = self.count.lock().unwrap();
        match (method, url) {
            (Method::Get, COUNT_URL) => Ok(format!("{{\"count\":{}}}", *count)),
            (Method::Patch, COUNT_URL) => {
                let proposed: serde_json::Value = serde_json::from_str(&body).unwrap();
                let proposed = proposed["count"].as_i64().unwrap();
                if proposed > *count {
                    *count = proposed;
                    Ok(body)
                } else {
                    Ok(r#"{"error":"Permission denied"}"#.to_string())
                }
            }
            _ => Ok(r#"{"ok":true}"#.to_string()),
        }
    }
}

struct Client {
    reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
    writer: tokio::net::tcp::OwnedWriteHalf,
}

impl Client {
    async fn connect(addr: std::net::SocketAddr) -> Self {
        let (read_half, writer) = TcpStream::connect(addr).await.unwrap().into_split();
        let mut client = Client {
            reader: BufReader::new(read_half),
            writer,
        };
        assert!(client.reply().await.starts_with("220 "));
        client
    }

    /// Final line of a possibly multi-line reply
    async fn reply(&mut self) -> String {
        loop {
            let mut line = String::new();
            self.reader.read_line(&mut line).await.unwrap();
            if line.len() < 4 || line.as_bytes()[3] != b'-' {
                return line.trim_end().to_string();
            }
        }
    }

    async fn send(&mut self, line: &str) -> String {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\r\n").await.unwrap();
        self.reply().await
    }
}

async fn start(config: Config, backend: Arc<FakeBackend>) -> (std::net::SocketAddr, watch::Sender<bool>, tokio::task::JoinHandle<anyhow::Result<()>>) {
    let config = Arc::new(config);
    let relay = Arc::new(Relay::new(config.clone(), backend));
    let server = Arc::new(SmtpServer::new(&config.server, Arc::new(relay)));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (exit_tx, exit_rx) = watch::channel(false);
    let handle = tokio::spawn(server.run(listener, exit_rx));
    (addr, exit_tx, handle)
}

fn config() -> Config {
    let mut config = Config::default();
    config.server.hostname = "mx.dewmail.test".to_string();
    config.routing.domain_checking = true;
    config.routing.api_route = "/hooks/".to_string();
    config.datastore.url = MIRROR_URL.to_string();
    config.datastore.count_url = COUNT_URL.to_string();
    config
}

const MESSAGE: &[&str] = &[
    "From: Alice <alice@example.org>",
    "To: deploy+prod@api.example.org",
    "Subject: =?UTF-8?Q?Release_=E2=9C=93?=",
    "MIME-Version: 1.0",
    "Content-Type: multipart/alternative; boundary=\"b1\"",
    "",
    "--b1",
    "Content-Type: text/plain; charset=utf-8",
    "Content-Transfer-Encoding: quoted-printable",
    "",
    "Version 1.2 is=",
    " ready",
    "to ship",
    "--b1",
    "Content-Type: text/html",
    "",
    "<p>ignored</p>",
    "--b1--",
];

#[tokio::test]
async fn test_message_becomes_webhook_call() {
    let backend = Arc::new(FakeBackend::default());
    *backend.count.lock().unwrap() = 41;
    let (addr, exit_tx, server) = start(config(), backend.clone()).await;

    let mut client = Client::connect(addr).await;
    assert!(client.send("EHLO relay.example.org").await.starts_with("250 "));
    assert!(client.send("MAIL FROM:<alice@example.org>").await.starts_with("250"));
    assert!(client.send("RCPT TO:<nobody@unlisted.test>").await.starts_with("550 5.7.1"));
    assert!(client.send("RCPT TO:<Deploy+Prod@api.example.org>").await.starts_with("250"));
    assert!(client.send("DATA").await.starts_with("354"));
    for line in MESSAGE {
        client.writer.write_all(line.as_bytes()).await.unwrap();
        client.writer.write_all(b"\r\n").await.unwrap();
    }
    assert_eq!(client.send(".").await, "250 2.0.0 OK");
    assert!(client.send("QUIT").await.starts_with("221"));

    let calls = backend.calls.lock().unwrap().clone();
    assert_eq!(calls.len(), 4);
    assert_eq!(calls[0].0, Method::Post);
    assert_eq!(calls[0].1, "http://api.example.org/hooks/deploy/prod");
    assert_eq!(calls[1].1, MIRROR_URL);
    assert_eq!(calls[0].2, calls[1].2);

    let posted: serde_json::Value = serde_json::from_str(&calls[0].2).unwrap();
    assert_eq!(posted["from"], "alice@example.org");
    assert_eq!(posted["to"], "deploy+prod@api.example.org");
    assert_eq!(posted["subject"], "Release ✓");
    assert_eq!(posted["body"], "Version 1.2 is ready to ship");
    assert_eq!(posted["spf"], "None");
    assert!(posted["time"].as_str().unwrap().ends_with('Z'));
    assert_eq!(*backend.count.lock().unwrap(), 42);

    exit_tx.send(true).unwrap();
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_dropped_connection_sends_nothing() {
    let backend = Arc::new(FakeBackend::default());
    let (addr, exit_tx, server) = start(config(), backend.clone()).await;

    let mut client = Client::connect(addr).await;
    client.send("HELO relay.example.org").await;
    client.send("MAIL FROM:<alice@example.org>").await;
    client.send("RCPT TO:<deploy@example.com>").await;
    client.send("DATA").await;
    client.writer.write_all(b"Subject: cut off\r\n").await.unwrap();
    drop(client);

    exit_tx.send(true).unwrap();
    server.await.unwrap().unwrap();
    assert!(backend.calls.lock().unwrap().is_empty());
}
