//! HTTP front door.
//!
//! Parses requests with hyper, hands them to the gateway as exchanges and
//! waits for the completion sink to deliver the response. Requests on one
//! connection share a partition key, so they are handled in order.

use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, COOKIE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use rampart_bus::SubmitError;
use rampart_chain::{Exchange, GatewayResponse, InboundRequest};
use rampart_telemetry::{events, log_listening, PROMETHEUS_CONTENT_TYPE};
use tokio::net::TcpListener;

use crate::gateway::Gateway;
use crate::handlers::Completion;

const RESERVED_PREFIX: &str = "/__rampart/";
pub const HEALTH_PATH: &str = "/__rampart/health";
pub const METRICS_PATH: &str = "/__rampart/metrics";

/// Accept connections until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, gateway: Arc<Gateway>, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()>,
{
    let local = listener.local_addr()?;
    log_listening!(addr = %local, "front door listening");

    let connection_ids = AtomicU64::new(1);
    tokio::pin!(shutdown);

    loop {
        let (stream, remote) = tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok(connection) => connection,
                Err(error) => {
                    tracing::warn!(error = %error, "accept failed");
                    continue;
                }
            },
        };

        let connection_id = connection_ids.fetch_add(1, Ordering::Relaxed);
        let gateway = Arc::clone(&gateway);
        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let gateway = Arc::clone(&gateway);
                async move { Ok::<_, Infallible>(handle(&gateway, req, connection_id, remote).await) }
            });

            if let Err(error) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                if error.is_incomplete_message() || error.is_closed() || error.is_canceled() {
                    tracing::debug!(
                        event = events::CLIENT_DISCONNECTED,
                        connection_id = connection_id,
                        "connection closed by client"
                    );
                } else {
                    tracing::warn!(connection_id = connection_id, error = %error, "connection error");
                }
            }
        });
    }

    tracing::info!(addr = %local, "front door stopped accepting");
    Ok(())
}

/// Handle one HTTP request.
pub async fn handle(
    gateway: &Gateway,
    req: Request<Incoming>,
    connection_id: u64,
    remote: SocketAddr,
) -> Response<Full<Bytes>> {
    let path = req.uri().path().to_string();
    if path.starts_with(RESERVED_PREFIX) {
        return reserved(gateway, &path, req.method());
    }

    let method = req.method().as_str().to_string();
    let query = req.uri().query().map(str::to_string);
    let headers = fold_headers(req.headers());

    let body = match req.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(_) => {
            return into_hyper(GatewayResponse::json(
                400,
                &serde_json::json!({ "error": "failed to read request body" }),
            ))
        }
    };

    let request = InboundRequest {
        method,
        path,
        query,
        headers,
        body,
        connection_id,
        remote_addr: Some(remote),
    };
    let mut exchange = Exchange::new(request);
    let (completion, rx) = Completion::channel();
    completion.attach(&mut exchange);

    match gateway.submit(connection_id, exchange) {
        Ok(()) => {}
        Err(SubmitError::Overloaded(_)) => {
            return into_hyper(GatewayResponse::unavailable("overloaded"))
        }
        Err(SubmitError::ShuttingDown(_)) => {
            return into_hyper(GatewayResponse::unavailable("shutting down"))
        }
    }

    match rx.await {
        Ok(response) => into_hyper(response),
        // The completion was dropped without being invoked.
        Err(_) => into_hyper(GatewayResponse::unavailable("response abandoned")),
    }
}

/// Flatten a header map to one value per name. Repeated headers are joined
/// with `, `, or `; ` for `cookie`; values that are not visible ASCII are
/// dropped.
fn fold_headers(map: &HeaderMap) -> HashMap<String, String> {
    let mut headers: HashMap<String, String> = HashMap::with_capacity(map.keys_len());
    for (name, value) in map {
        let Ok(value) = value.to_str() else {
            continue;
        };
        let separator = if name == COOKIE { "; " } else { ", " };
        headers
            .entry(name.as_str().to_string())
            .and_modify(|joined| {
                joined.push_str(separator);
                joined.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    headers
}

fn reserved(gateway: &Gateway, path: &str, method: &Method) -> Response<Full<Bytes>> {
    if method != Method::GET {
        return into_hyper(
            GatewayResponse::json(405, &serde_json::json!({ "error": "method not allowed" }))
                .with_header("allow", "GET"),
        );
    }

    match path {
        HEALTH_PATH => {
            let requests = gateway.request_stats();
            let responses = gateway.response_stats();
            let body = serde_json::json!({
                "status": if gateway.is_accepting() { "healthy" } else { "draining" },
                "plugins": gateway.plugins().names(),
                "request_bus": { "partitions": requests.partitions, "depths": requests.depths },
                "response_bus": { "partitions": responses.partitions, "depths": responses.depths },
            });
            into_hyper(GatewayResponse::json(200, &body))
        }
        METRICS_PATH => {
            let text = rampart_telemetry::prometheus::render_metrics(gateway.metrics());
            into_hyper(
                GatewayResponse::new(200)
                    .with_header("content-type", PROMETHEUS_CONTENT_TYPE)
                    .with_body(text),
            )
        }
        _ => into_hyper(GatewayResponse::json(404, &serde_json::json!({ "error": "not found" }))),
    }
}

fn into_hyper(response: GatewayResponse) -> Response<Full<Bytes>> {
    let GatewayResponse {
        status,
        headers,
        body,
    } = response;

    let mut out = Response::new(Full::new(body));
    *out.status_mut() = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    for (name, value) in headers {
        match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(&value)) {
            (Ok(name), Ok(value)) => {
                out.headers_mut().insert(name, value);
            }
            _ => tracing::debug!(header = %name, "dropping invalid response header"),
        }
    }
    out
}
