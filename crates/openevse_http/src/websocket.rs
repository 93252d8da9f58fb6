//! Push channel on `ws://{host}/ws`.
//!
//! The gateway sends partial status objects whenever a value changes. Each
//! object is handed to the frame callback; the task reconnects on its own
//! after a drop and reports its progress through [`WsState`].

use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use futures_util::SinkExt;
use futures_util::StreamExt;
use serde_json::Map;
use serde_json::Value;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;
use tracing::info;
use tracing::warn;

/// Connection state of the push channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsState {
    Stopped,
    Starting,
    Connected,
    Disconnected,
}

impl WsState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WsState::Stopped => "stopped",
            WsState::Starting => "starting",
            WsState::Connected => "connected",
            WsState::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for WsState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const KEEPALIVE: Duration = Duration::from_secs(30);
const PING: &str = r#"{"ping":1}"#;

pub(crate) fn set_state(state: &Mutex<WsState>, next: WsState) {
    if let Ok(mut s) = state.lock() {
        *s = next;
    }
}

/// Connect, read frames until the socket drops, wait, repeat.
pub(crate) async fn run<F>(url: String, state: Arc<Mutex<WsState>>, reconnect: Duration, on_frame: F)
where
    F: Fn(Map<String, Value>) + Send + Sync + 'static,
{
    loop {
        set_state(&state, WsState::Starting);
        debug!("Connecting websocket to {}", url);

        match connect_async(url.as_str()).await {
            Ok((stream, _)) => {
                info!("Websocket connected to {}", url);
                set_state(&state, WsState::Connected);

                let (mut tx, mut rx) = stream.split();
                let mut keepalive = tokio::time::interval(KEEPALIVE);
                keepalive.tick().await;

                loop {
                    tokio::select! {
                        msg = rx.next() => match msg {
                            Some(Ok(Message::Text(text))) => match serde_json::from_str::<Value>(&text) {
                                Ok(Value::Object(frame)) => {
                                    if frame.contains_key("pong") {
                                        continue;
                                    }
                                    on_frame(frame);
                                }
                                Ok(_) => debug!("Ignoring non-object websocket frame"),
                                Err(e) => warn!("Invalid websocket frame from {}: {}", url, e),
                            },
                            Some(Ok(Message::Close(_))) | None => {
                                info!("Websocket to {} closed", url);
                                break;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                warn!("Websocket error from {}: {}", url, e);
                                break;
                            }
                        },
                        _ = keepalive.tick() => {
                            if let Err(e) = tx.send(Message::Text(PING.to_string())).await {
                                warn!("Websocket keepalive to {} failed: {}", url, e);
                                break;
                            }
                        }
                    }
                }
            }
            Err(e) => warn!("Websocket connection to {} failed: {}", url, e),
        }

        set_state(&state, WsState::Disconnected);
        tokio::time::sleep(reconnect).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_names() {
        assert_eq!(WsState::Stopped.to_string(), "stopped");
        assert_eq!(WsState::Disconnected.as_str(), "disconnected");
    }

    #[tokio::test]
    async fn test_unreachable_host_reports_disconnected() {
        let state = Arc::new(Mutex::new(WsState::Stopped));
        // Port 9 on localhost is closed in any sane test environment
        let task = tokio::spawn(run(
            "ws://127.0.0.1:9/ws".to_string(),
            state.clone(),
            Duration::from_secs(60),
            |_| {},
        ));

        for _ in 0..50 {
            if *state.lock().unwrap() == WsState::Disconnected {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(*state.lock().unwrap(), WsState::Disconnected);
        task.abort();
    }
}
