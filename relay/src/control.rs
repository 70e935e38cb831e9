//! Control session (§4.F).
//!
//! The tunnel client's single outbound WebSocket: handshake, inbox pump,
//! and reply routing back to per-request queues.

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use tunnelgate_shared::Envelope;

use crate::AppState;

const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Deserialize)]
struct Handshake {
    subdomain: Option<String>,
    #[serde(default = "default_version")]
    version: String,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

#[derive(Debug, Serialize)]
struct HandshakeReply {
    url: String,
}

pub async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let handshake = match socket.recv().await {
        Some(Ok(Message::Text(text))) => match serde_json::from_str::<Handshake>(&text) {
            Ok(h) => h,
            Err(e) => {
                warn!("control handshake parse error: {e}");
                let _ = socket.send(Message::Close(None)).await;
                return;
            }
        },
        _ => {
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };

    if let Some(code) = version_gate(&handshake.version) {
        let reason = if code == 4000 {
            "client too old"
        } else {
            "client too new"
        };
        info!(client_version = %handshake.version, %reason, "rejecting control handshake");
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code,
                reason: reason.into(),
            })))
            .await;
        return;
    }

    let subdomain = match state.registry.claim(handshake.subdomain).await {
        Ok(s) => s,
        Err(e) => {
            warn!("claiming subdomain failed: {e}");
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };

    let url = format!(
        "{}://{}.{}",
        if state.config.secure { "https" } else { "http" },
        subdomain,
        state.config.tunnel_domain,
    );
    let reply = HandshakeReply { url: url.clone() };
    let reply_json = match serde_json::to_string(&reply) {
        Ok(j) => j,
        Err(_) => return,
    };
    if socket.send(Message::Text(reply_json.into())).await.is_err() {
        let _ = state.registry.release(&subdomain).await;
        return;
    }
    info!(%subdomain, %url, "tunnel active");

    let (mut sender, mut receiver) = socket.split();

    let pump_transport = state.transport.clone();
    let pump_subdomain = subdomain.clone();
    let pump = tokio::spawn(async move {
        loop {
            match pump_transport.dequeue(&pump_subdomain).await {
                Ok(envelope) => match envelope.to_json() {
                    Ok(json) => {
                        if sender.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("encoding outbound envelope failed: {e}"),
                },
                Err(_) => break,
            }
        }
    });

    while let Some(frame) = receiver.next().await {
        match frame {
            Ok(Message::Text(text)) => route_reply(&state, &subdomain, &text).await,
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(%subdomain, "control socket read error: {e}");
                break;
            }
        }
    }

    pump.abort();
    let _ = state.registry.release(&subdomain).await;
    info!(%subdomain, "tunnel closed");
}

/// For every inbound JSON frame from the client, interpret as a reply
/// envelope and route it to `<subdomain>_<id>` if that queue still
/// exists. A caller who gave up (deleted its reply queue already) means
/// the reply is simply dropped — no error, no retry (§4.F step 5, §7).
async fn route_reply(state: &AppState, subdomain: &str, text: &str) {
    let envelope = match Envelope::from_json(text) {
        Ok(e) => e,
        Err(e) => {
            warn!(%subdomain, "dropping malformed frame from tunnel client: {e}");
            return;
        }
    };

    let reply_name = format!("{subdomain}_{}", envelope.id);
    if state.transport.exists(&reply_name).await.unwrap_or(false) {
        if let Err(e) = state.transport.enqueue(&reply_name, &envelope).await {
            debug!(%subdomain, reply_name, "dropping reply: {e}");
        }
    } else {
        debug!(%subdomain, reply_name, "dropping reply for unknown/abandoned exchange");
    }
}

/// Compare the client-declared version against this build's version.
/// Returns `Some(close_code)` if the handshake should be rejected.
fn version_gate(client_version: &str) -> Option<u16> {
    version_gate_against(client_version, SERVER_VERSION)
}

/// Compare client-declared major version against a given server version.
/// Development builds (semver pre-release tags, e.g. `0.0.0-dev`) skip
/// gating entirely, matching the original's `'git' not in client_version`
/// and `__version__ != 'development'` escape hatches. Split out from
/// [`version_gate`] so tests can exercise the real comparison logic
/// against a chosen server major instead of this build's compiled-in
/// `SERVER_VERSION` (currently `0.1.0`, major `0`).
fn version_gate_against(client_version: &str, server_version: &str) -> Option<u16> {
    if is_development_build(client_version) || is_development_build(server_version) {
        return None;
    }

    let client_major = major_version(client_version)?;
    let server_major = major_version(server_version)?;

    if client_major < server_major {
        Some(4000)
    } else if client_major > server_major {
        Some(4001)
    } else {
        None
    }
}

fn is_development_build(version: &str) -> bool {
    version.contains('-') || version.eq_ignore_ascii_case("development")
}

fn major_version(version: &str) -> Option<u64> {
    version.split('.').next()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn older_client_is_rejected_with_4000() {
        // Scenario S6: client 0.9.0 against server major 1 -> close 4000.
        assert_eq!(version_gate_against("0.9.0", "1.0.0"), Some(4000));
    }

    #[test]
    fn newer_client_is_rejected_with_4001() {
        assert_eq!(version_gate_against("2.0.0", "1.0.0"), Some(4001));
    }

    #[test]
    fn matching_major_is_accepted() {
        assert_eq!(version_gate_against("1.2.0", "1.5.0"), None);
    }

    #[test]
    fn development_client_skips_gating() {
        assert_eq!(version_gate_against("0.9.0-dev", "1.0.0"), None);
    }

    #[test]
    fn development_server_skips_gating() {
        assert_eq!(version_gate_against("0.9.0", "development"), None);
    }

    #[test]
    fn is_development_build_recognizes_prerelease_tags_and_literal() {
        assert!(is_development_build("0.9.0-dev"));
        assert!(is_development_build("development"));
        assert!(!is_development_build("0.9.0"));
    }

    #[test]
    fn version_gate_wires_through_the_compiled_server_version() {
        assert_eq!(
            version_gate("0.9.0"),
            version_gate_against("0.9.0", SERVER_VERSION)
        );
    }
}
