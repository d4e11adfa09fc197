//! `/metrics` and `/metrics.json` endpoint for long running decodes.

use std::net::SocketAddr;
use std::sync::mpsc;
use std::thread::JoinHandle;

use anyhow::{Context, Result, anyhow};
use hyper::body::Bytes;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, StatusCode};
use tokio::sync::oneshot;

use super::MetricsCollector;

pub struct MetricsServer {
    shutdown_tx: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
    address: SocketAddr,
}

impl MetricsServer {
    pub fn start(listen: SocketAddr, collector: MetricsCollector) -> Result<Self> {
        let (tx, rx) = oneshot::channel::<()>();
        let (addr_tx, addr_rx) = mpsc::channel::<Result<SocketAddr, String>>();

        let thread = std::thread::Builder::new()
            .name("vpu-metrics".into())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(err) => {
                        addr_tx.send(Err(err.to_string())).ok();
                        return;
                    }
                };

                runtime.block_on(async move {
                    let make_svc = make_service_fn(move |_| {
                        let collector = collector.clone();
                        async move {
                            Ok::<_, hyper::Error>(service_fn(move |req| {
                                let collector = collector.clone();
                                async move {
                                    Ok::<_, hyper::Error>(handle_request(req, &collector))
                                }
                            }))
                        }
                    });

                    let builder = match hyper::Server::try_bind(&listen) {
                        Ok(builder) => builder,
                        Err(err) => {
                            addr_tx.send(Err(err.to_string())).ok();
                            return;
                        }
                    };
                    addr_tx.send(Ok(builder.local_addr())).ok();
                    let server = builder.serve(make_svc).with_graceful_shutdown(async move {
                        let _ = rx.await;
                    });
                    if let Err(err) = server.await {
                        tracing::error!(error = %err, "Metrics server error");
                    }
                });
            })
            .context("spawning metrics server thread")?;

        let address = addr_rx
            .recv()
            .context("metrics server exited during startup")?
            .map_err(|err| anyhow!("metrics server failed to bind {listen}: {err}"))?;

        Ok(Self {
            shutdown_tx: Some(tx),
            thread: Some(thread),
            address,
        })
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for MetricsServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn handle_request(req: Request<Body>, collector: &MetricsCollector) -> Response<Body> {
    let (status, content_type, body) = match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => (
            StatusCode::OK,
            "text/plain; version=0.0.4",
            Body::from(collector.snapshot().to_prometheus()),
        ),
        (&Method::GET, "/metrics.json") => {
            let json = serde_json::to_vec(&collector.snapshot()).unwrap_or_else(|_| b"{}".to_vec());
            (StatusCode::OK, "application/json", Body::from(json))
        }
        _ => (
            StatusCode::NOT_FOUND,
            "text/plain",
            Body::from(Bytes::from_static(b"Not Found")),
        ),
    };
    let mut response = Response::new(body);
    *response.status_mut() = status;
    if let Ok(value) = hyper::header::HeaderValue::from_str(content_type) {
        response
            .headers_mut()
            .insert(hyper::header::CONTENT_TYPE, value);
    }
    response
}
