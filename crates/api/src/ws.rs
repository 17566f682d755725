use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use notify_bus::Message as BusMessage;
use tracing::instrument;

use crate::state::AppState;

/// `/ws` — upgrades to a push channel that forwards every [`BusMessage`]
/// published on the server's notification bus, and answers a client
/// `{"type":"ping"}` probe with `{"type":"pong"}`.
#[instrument(skip_all)]
pub(crate) async fn handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| run(socket, state))
}

async fn run(socket: WebSocket, state: AppState) {
    let mut receiver = state.bus.subscribe();
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(WsMessage::Text(text))) => {
                        if is_ping(&text) {
                            if send(&mut sink, &BusMessage::Pong).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(source)) => {
                        tracing::debug!(%source, "websocket read failed");
                        break;
                    }
                }
            }
            published = receiver.recv() => {
                match published {
                    Ok(message) => {
                        if send(&mut sink, &message).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
}

fn is_ping(text: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(text)
        .ok()
        .and_then(|value| value.get("type").and_then(|t| t.as_str()).map(str::to_owned))
        .is_some_and(|kind| kind == "ping")
}

async fn send(sink: &mut futures_util::stream::SplitSink<WebSocket, WsMessage>, message: &BusMessage) -> Result<(), axum::Error> {
    let text = serde_json::to_string(message).expect("Message always serialises");
    sink.send(WsMessage::Text(text.into())).await
}

#[cfg(test)]
mod tests {
    use super::is_ping;

    #[test]
    fn recognises_a_ping_probe() {
        assert!(is_ping(r#"{"type":"ping"}"#));
    }

    #[test]
    fn ignores_unrelated_text() {
        assert!(!is_ping(r#"{"type":"pong"}"#));
        assert!(!is_ping("not json"));
        assert!(!is_ping("{}"));
    }
}
