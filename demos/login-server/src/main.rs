//! Minimal login server: answers every session request with a session
//! reply and establishes the session.
//!
//! ```text
//! RUST_LOG=h1emu=debug cargo run -p login-server -- config.json
//! ```

use std::collections::HashMap;

use h1emu::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct SessionRequest {
    client_version: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
struct SessionReply {
    session: String,
    ping_ms: u64,
}

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

struct LoginHandler {
    ping_ms: u64,
    /// Client version each live session announced.
    versions: HashMap<SessionId, String>,
}

impl LoginHandler {
    fn new(config: &ServerConfig) -> Self {
        Self {
            ping_ms: config.ping_time,
            versions: HashMap::new(),
        }
    }
}

impl MessageHandler<JsonCodec> for LoginHandler {
    type Payload = Value;

    fn on_message(
        &mut self,
        ctx: &mut SessionContext<'_, JsonCodec>,
        session: SessionId,
        opcode: Opcode,
        payload: Value,
    ) {
        match opcode {
            Opcode::SESSION_REQUEST => {
                let request: SessionRequest =
                    serde_json::from_value(payload).unwrap_or_default();
                let version = request.client_version.unwrap_or_else(|| "unknown".into());
                tracing::info!(peer = %session, %version, "login");
                self.versions.insert(session, version);

                if let Err(e) = ctx.establish(session) {
                    tracing::warn!(peer = %session, error = %e, "establish failed");
                    return;
                }
                let reply = SessionReply {
                    session: session.to_string(),
                    ping_ms: self.ping_ms,
                };
                ctx.send(session, Opcode::SESSION_REPLY, &reply);
            }
            Opcode::ACK => {}
            other => {
                tracing::debug!(peer = %session, opcode = %other, "ignored");
            }
        }
    }

    fn on_session_evicted(&mut self, session: SessionId, reason: EvictionReason) {
        let version = self.versions.remove(&session);
        tracing::info!(peer = %session, ?reason, ?version, "logout");
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => ServerConfig::from_json_file(path)?,
        None => ServerConfig {
            server_port: 1110,
            ..ServerConfig::default()
        },
    };

    let handler = LoginHandler::new(&config);
    let handle = H1emuServer::builder()
        .config(config)
        .build(handler, JsonCodec)
        .start()
        .await?;

    tokio::signal::ctrl_c().await?;
    handle.stop().await?;
    Ok(())
}
