//! HTTP ingress (§4.D).
//!
//! Translates an inbound HTTP request into a request envelope, invokes the
//! correlator, and reconstructs the HTTP response — or returns 404 when
//! no tunnel answers for the subdomain.

use axum::body::Body;
use axum::http::{HeaderName, HeaderValue, Request, Response, StatusCode};
use tracing::warn;
use tunnelgate_shared::{encode_body, Envelope, HttpRequestPayload, HttpResponsePayload, Kind};

use crate::AppState;

const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Extract the subdomain as the first dot-separated label of `Host`.
pub fn subdomain_from_host(host: &str) -> &str {
    host.split('.').next().unwrap_or("")
}

pub async fn handle(state: &AppState, req: Request<Body>) -> Response<Body> {
    let host = req
        .headers()
        .get(axum::http::header::HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("")
        .to_string();
    let subdomain = subdomain_from_host(&host).to_string();

    let method = req.method().to_string();
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let headers: Vec<(String, String)> = req
        .headers()
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
        .collect();

    let body_bytes = match axum::body::to_bytes(req.into_body(), MAX_BODY_BYTES).await {
        Ok(b) => b.to_vec(),
        Err(e) => {
            warn!(%subdomain, "reading request body failed: {e}");
            return not_found();
        }
    };

    let payload = HttpRequestPayload {
        method,
        path,
        headers,
        body: encode_body(&body_bytes),
    };

    let id = crate::new_request_id();
    let envelope = match Envelope::new(Kind::Request, id, payload) {
        Ok(e) => e,
        Err(e) => {
            warn!("encoding request envelope failed: {e}");
            return not_found();
        }
    };

    match state
        .correlator
        .exchange_with_timeout(&subdomain, envelope, state.config.exchange_timeout)
        .await
    {
        Ok(response_envelope) => build_response(response_envelope),
        Err(e) if e.is_not_found() => not_found(),
        Err(e) => {
            warn!(%subdomain, "exchange failed: {e}");
            not_found()
        }
    }
}

fn not_found() -> Response<Body> {
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .body(Body::from("Not Found"))
        .expect("static response is valid")
}

fn build_response(envelope: Envelope) -> Response<Body> {
    let payload: HttpResponsePayload = match envelope.decode() {
        Ok(p) => p,
        Err(_) => return not_found(),
    };

    let body = match tunnelgate_shared::decode_body(&payload.body) {
        Ok(b) => b,
        Err(_) => return not_found(),
    };

    let status = StatusCode::from_u16(payload.status).unwrap_or(StatusCode::OK);
    let mut builder = Response::builder().status(status);
    if let Some(headers_mut) = builder.headers_mut() {
        for (name, value) in &payload.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                headers_mut.append(name, value);
            }
        }
    }

    builder
        .body(Body::from(body))
        .unwrap_or_else(|_| not_found())
}
