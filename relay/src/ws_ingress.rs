//! WebSocket ingress (§4.E).
//!
//! A single external WebSocket session maps to one `id` chosen at accept
//! time and owns two long-lived tasks against the shared reply queue named
//! `<subdomain>_<id>`. Unlike the HTTP path, this reply queue survives the
//! initial handshake for the lifetime of the session, so it's managed by
//! hand here rather than through [`crate::correlator::RequestCorrelator`],
//! whose `exchange` always tears its reply queue down after one round
//! trip.

use axum::body::Body;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::{Response, StatusCode};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, warn};
use tunnelgate_shared::{
    decode_body, encode_body, Envelope, Kind, WsConnectPayload, WsDisconnectPayload,
    WsMessagePayload,
};

use crate::AppState;

pub async fn accept(
    ws: WebSocketUpgrade,
    state: AppState,
    subdomain: String,
    path: String,
    headers: Vec<(String, String)>,
) -> Response<Body> {
    let id = crate::new_request_id();
    let reply_name = format!("{subdomain}_{id}");

    if state.transport.create(&reply_name).await.is_err() {
        return rejected();
    }

    if let Err(e) = handshake(&state, &subdomain, &reply_name, &id, path, headers).await {
        debug!(%subdomain, %id, "ws handshake rejected: {e}");
        let _ = state.transport.delete(&reply_name).await;
        return rejected();
    }

    ws.on_upgrade(move |socket| run_session(socket, state, subdomain, id, reply_name))
}

async fn handshake(
    state: &AppState,
    subdomain: &str,
    reply_name: &str,
    id: &str,
    path: String,
    headers: Vec<(String, String)>,
) -> tunnelgate_shared::Result<()> {
    state.transport.open(subdomain).await?;

    let connect = Envelope::new(Kind::Connect, id.to_string(), WsConnectPayload { path, headers })?;
    state.transport.enqueue(subdomain, &connect).await?;

    let reply = state.transport.dequeue(reply_name).await?;
    if reply.kind != Kind::Ack {
        return Err(tunnelgate_shared::Error::ProtocolViolation(
            "expected ws-ack, got other kind".into(),
        ));
    }
    Ok(())
}

fn rejected() -> Response<Body> {
    Response::builder()
        .status(StatusCode::BAD_GATEWAY)
        .body(Body::from("tunnel rejected websocket"))
        .expect("static response is valid")
}

async fn run_session(socket: WebSocket, state: AppState, subdomain: String, id: String, reply_name: String) {
    let (mut sink, mut stream) = socket.split();

    let outbound_transport = state.transport.clone();
    let outbound_reply_name = reply_name.clone();
    let outbound = tokio::spawn(async move {
        loop {
            match outbound_transport.dequeue(&outbound_reply_name).await {
                Ok(envelope) => {
                    if envelope.kind != Kind::Message {
                        continue;
                    }
                    let payload: WsMessagePayload = match envelope.decode() {
                        Ok(p) => p,
                        Err(_) => continue,
                    };
                    let bytes = match decode_body(&payload.body) {
                        Ok(b) => b,
                        Err(_) => continue,
                    };
                    // The gateway cannot distinguish the client's original
                    // frame type on this path, so it always emits text
                    // (§4.E — a documented asymmetry).
                    let text = String::from_utf8_lossy(&bytes).into_owned();
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    let mut close_code: u16 = 1000;
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                if enqueue_message(&state, &subdomain, &id, text.as_bytes()).await.is_err() {
                    break;
                }
            }
            Ok(Message::Binary(data)) => {
                if enqueue_message(&state, &subdomain, &id, &data).await.is_err() {
                    break;
                }
            }
            Ok(Message::Close(frame)) => {
                close_code = frame.map(|f| f.code).unwrap_or(1000);
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(%subdomain, %id, "websocket read error: {e}");
                break;
            }
        }
    }

    let disconnect = Envelope::new(
        Kind::Disconnect,
        id.clone(),
        WsDisconnectPayload { close_code },
    );
    if let Ok(disconnect) = disconnect {
        let _ = state.transport.enqueue(&subdomain, &disconnect).await;
    }

    outbound.abort();
    let _ = state.transport.delete(&reply_name).await;
}

async fn enqueue_message(
    state: &AppState,
    subdomain: &str,
    id: &str,
    raw: &[u8],
) -> tunnelgate_shared::Result<()> {
    let envelope = Envelope::new(
        Kind::Message,
        id.to_string(),
        WsMessagePayload {
            body: encode_body(raw),
        },
    )?;
    state.transport.enqueue(subdomain, &envelope).await
}
