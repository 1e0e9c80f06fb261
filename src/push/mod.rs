//! Push-stream client.
//!
//! Emby exposes a websocket that pushes playback events and full session
//! lists. Frames are translated into the same normalized observations the
//! poller produces, so the intervalizer sees one event stream regardless
//! of transport. The poller remains the primary data source; this channel
//! only tightens latency, and the service degrades gracefully when it is
//! unavailable.

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_tls_with_config, Connector};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::SessionCache;
use crate::config::ServerConfig;
use crate::errors::PushError;
use crate::intervalizer::{Intervalizer, ObservationKind};
use crate::models::ServerKind;
use crate::sources::emby::{normalize_emby_session, EmbySession};

/// Reconnect backoff bounds.
const BACKOFF_INITIAL: Duration = Duration::from_secs(2);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct WsEnvelope {
    #[serde(rename = "MessageType")]
    message_type: String,
    #[serde(rename = "Data", default)]
    data: serde_json::Value,
}

pub struct PushStreamClient {
    server_id: String,
    base_url: String,
    api_key: String,
    device_id: String,
    accept_invalid_certs: bool,
    keepalive: Duration,
    intervalizer: Arc<Intervalizer>,
    cache: Arc<SessionCache>,
}

impl PushStreamClient {
    pub fn new(
        config: &ServerConfig,
        keepalive_seconds: u64,
        intervalizer: Arc<Intervalizer>,
        cache: Arc<SessionCache>,
    ) -> Self {
        Self {
            server_id: config.id.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.credential.clone(),
            device_id: format!("playtally-{}", uuid::Uuid::new_v4().simple()),
            accept_invalid_certs: config.accept_invalid_certs,
            keepalive: Duration::from_secs(keepalive_seconds.max(5)),
            intervalizer,
            cache,
        }
    }

    /// Derive the websocket endpoint from the configured base URL scheme.
    fn endpoint(&self) -> Result<Url, PushError> {
        let mut url = Url::parse(&self.base_url).map_err(|e| PushError::InvalidEndpoint {
            url: self.base_url.clone(),
            message: e.to_string(),
        })?;
        let scheme = match url.scheme() {
            "https" => "wss",
            _ => "ws",
        };
        url.set_scheme(scheme).map_err(|_| PushError::InvalidEndpoint {
            url: self.base_url.clone(),
            message: "unsupported scheme".to_string(),
        })?;
        url.set_path("/embywebsocket");
        url.set_query(Some(&format!(
            "api_key={}&deviceId={}",
            self.api_key, self.device_id
        )));
        Ok(url)
    }

    fn tls_connector(&self) -> Result<Option<Connector>, PushError> {
        if !self.accept_invalid_certs {
            return Ok(None);
        }
        let connector = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| PushError::Tls {
                message: e.to_string(),
            })?;
        Ok(Some(Connector::NativeTls(connector)))
    }

    /// Connect-and-read until cancellation, reconnecting with capped
    /// exponential backoff and jitter.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut backoff = BACKOFF_INITIAL;
        loop {
            if cancel.is_cancelled() {
                return;
            }
            match self.connect_and_read(&cancel).await {
                Ok(()) => {
                    debug!(server_id = %self.server_id, "push stream stopped");
                    return;
                }
                Err(e) => {
                    warn!(server_id = %self.server_id, error = %e, "push stream disconnected");
                }
            }

            let jitter = Duration::from_millis(fastrand::u64(0..1000));
            let delay = backoff + jitter;
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return,
            }
            backoff = (backoff * 2).min(BACKOFF_CAP);
        }
    }

    async fn connect_and_read(&self, cancel: &CancellationToken) -> Result<(), PushError> {
        let endpoint = self.endpoint()?;
        let (stream, _) =
            connect_async_tls_with_config(endpoint.as_str(), None, false, self.tls_connector()?)
                .await?;
        info!(server_id = %self.server_id, "push stream connected");

        let (mut sink, mut stream) = stream.split();

        // Subscribe to periodic session lists alongside playback events.
        sink.send(Message::Text(
            serde_json::json!({"MessageType": "SessionsStart", "Data": "0,1500"}).to_string(),
        ))
        .await?;

        let read_deadline = self.keepalive * 3;
        let mut ping_ticker = tokio::time::interval(self.keepalive);
        ping_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut deadline = tokio::time::Instant::now() + read_deadline;

        loop {
            tokio::select! {
                message = stream.next() => {
                    let Some(message) = message else {
                        return Err(PushError::Closed);
                    };
                    deadline = tokio::time::Instant::now() + read_deadline;
                    match message? {
                        Message::Text(text) => self.handle_frame(&text).await,
                        Message::Ping(payload) => {
                            let _ = sink.send(Message::Pong(payload)).await;
                        }
                        Message::Pong(_) => {}
                        Message::Close(_) => return Err(PushError::Closed),
                        _ => {}
                    }
                }
                _ = ping_ticker.tick() => {
                    sink.send(Message::Ping(Vec::new())).await?;
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(PushError::ReadDeadline {
                        seconds: read_deadline.as_secs(),
                    });
                }
                _ = cancel.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return Ok(());
                }
            }
        }
    }

    async fn handle_frame(&self, text: &str) {
        let envelope: WsEnvelope = match serde_json::from_str(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(server_id = %self.server_id, error = %e, "unparseable push frame");
                return;
            }
        };

        match envelope.message_type.as_str() {
            "KeepAlive" | "ForceKeepAlive" => {}
            "Sessions" => self.handle_session_list(envelope.data).await,
            kind if kind.starts_with("Playback") => {
                self.handle_playback_event(kind, envelope.data).await;
            }
            other => {
                debug!(server_id = %self.server_id, message_type = other, "ignoring push frame");
            }
        }
    }

    /// A full session list frame: re-project every playing session into a
    /// synthetic progress observation, and hand the set of observed keys
    /// to the stopped-session detector.
    async fn handle_session_list(&self, data: serde_json::Value) {
        let raw: Vec<EmbySession> = match serde_json::from_value(data) {
            Ok(raw) => raw,
            Err(e) => {
                debug!(server_id = %self.server_id, error = %e, "unparseable session list frame");
                return;
            }
        };

        let sessions: Vec<_> = raw
            .iter()
            .filter_map(|s| normalize_emby_session(&self.server_id, ServerKind::Emby, s))
            .collect();

        let live_ids: HashSet<String> = sessions.iter().map(|s| s.session_id.clone()).collect();
        for session in &sessions {
            self.intervalizer
                .handle_event(ObservationKind::Progress, session)
                .await;
        }
        self.intervalizer
            .retain_server_sessions(&self.server_id, &live_ids)
            .await;
        self.cache
            .set_from_push(&self.server_id, ServerKind::Emby, sessions)
            .await;
    }

    async fn handle_playback_event(&self, kind: &str, data: serde_json::Value) {
        let raw: EmbySession = match serde_json::from_value(data) {
            Ok(raw) => raw,
            Err(e) => {
                debug!(
                    server_id = %self.server_id,
                    message_type = kind,
                    error = %e,
                    "unparseable playback frame"
                );
                return;
            }
        };
        let Some(session) = normalize_emby_session(&self.server_id, ServerKind::Emby, &raw) else {
            return;
        };

        let observation = match kind {
            "PlaybackStart" => ObservationKind::Start,
            "PlaybackStopped" => ObservationKind::Stopped,
            _ => ObservationKind::Progress,
        };
        self.cache.record_websocket_update();
        self.intervalizer.handle_event(observation, &session).await;
    }
}
