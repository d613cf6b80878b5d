use futures::stream::{FuturesUnordered, StreamExt};
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use log::{debug, info, warn};
use std::convert::Infallible;
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::shutdown;

pub const HEALTH_BODY: &str = "<h1>Dewmail</h1><p>Service is up</p>";

async fn health(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    debug!("Health probe {} {}", req.method(), req.uri());
    let mut response = Response::new(Full::new(Bytes::from_static(HEALTH_BODY.as_bytes())));
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("text/html"),
    );
    Ok(response)
}

/// Uptime probe: every path answers 200 with a fixed page
pub async fn serve(listener: TcpListener, mut must_exit: watch::Receiver<bool>) -> anyhow::Result<()> {
    info!("Health endpoint listening on {}", listener.local_addr()?);

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

        let conn = tokio::spawn(async move {
            let served = http1::Builder::new()
                .keep_alive(false)
                .serve_connection(TokioIo::new(socket), service_fn(health))
                .await;
            if let Err(e) = served {
                warn!("Health connection from {} failed: {}", remote_addr, e);
            }
        });
        connections.push(conn);
    }
    drop(listener);

    while connections.next().await.is_some() {}
    Ok(())
}
