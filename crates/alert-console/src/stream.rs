//! Live alert streams: Server-Sent Events and WebSocket.
//!
//! Both protocols speak the same [`StreamMessage`] set: a snapshot on
//! connect, then incremental deltas. SSE clients additionally get comment
//! heartbeats every 30 seconds; WebSocket clients may send `ping` and
//! `subscribe` control messages.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
#[cfg(test)]
use futures::Stream;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;
use warp::ws::{Message, WebSocket};

use crate::alert::{ControlMessage, StreamMessage};
use crate::store::{AlertStore, SubscriberKind};

/// Interval between SSE keep-alive comments.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Build the SSE reply for one subscriber.
pub fn sse_reply(store: Arc<AlertStore>) -> impl warp::Reply {
    let subscription = store.subscribe(SubscriberKind::Sse);
    let snapshot = StreamMessage::Snapshot {
        alerts: subscription.snapshot,
    };
    let guard = subscription.guard;

    let events = futures::stream::once(async move { snapshot })
        .chain(ReceiverStream::new(subscription.rx))
        .map(move |message| {
            // The guard rides the stream; dropping the connection
            // unsubscribes.
            let _ = &guard;
            sse_event(&message)
        });

    warp::sse::reply(
        warp::sse::keep_alive()
            .interval(HEARTBEAT_INTERVAL)
            .stream(events),
    )
}

fn sse_event(message: &StreamMessage) -> Result<warp::sse::Event, Infallible> {
    let event = warp::sse::Event::default().event(message.kind());
    Ok(match event.json_data(message) {
        Ok(event) => event,
        // Serialization of our own types does not fail; keep the stream
        // alive regardless.
        Err(_) => warp::sse::Event::default().comment("serialization error"),
    })
}

/// Drive one WebSocket subscriber until either side hangs up.
pub async fn ws_connection(socket: WebSocket, store: Arc<AlertStore>) {
    let (mut tx, mut rx) = socket.split();
    let mut subscription = store.subscribe(SubscriberKind::WebSocket);

    let snapshot = StreamMessage::Snapshot {
        alerts: std::mem::take(&mut subscription.snapshot),
    };
    if send_message(&mut tx, &snapshot).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            update = subscription.rx.recv() => match update {
                Some(message) => {
                    if send_message(&mut tx, &message).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            incoming = rx.next() => match incoming {
                Some(Ok(message)) => {
                    if message.is_close() {
                        break;
                    }
                    if let Ok(text) = message.to_str() {
                        match serde_json::from_str::<ControlMessage>(text) {
                            Ok(ControlMessage::Ping) => {
                                if send_message(&mut tx, &StreamMessage::Pong).await.is_err() {
                                    break;
                                }
                            }
                            Ok(ControlMessage::Subscribe) => {
                                let ack = StreamMessage::Subscribed;
                                let snapshot = StreamMessage::Snapshot {
                                    alerts: store.snapshot(),
                                };
                                if send_message(&mut tx, &ack).await.is_err()
                                    || send_message(&mut tx, &snapshot).await.is_err()
                                {
                                    break;
                                }
                            }
                            Err(err) => {
                                debug!(error = %err, "ignoring unparseable ws control message");
                            }
                        }
                    }
                }
                Some(Err(err)) => {
                    debug!(error = %err, "websocket read error");
                    break;
                }
                None => break,
            },
        }
    }
    // Subscription guard drops here and unsubscribes.
}

async fn send_message(
    tx: &mut SplitSink<WebSocket, Message>,
    message: &StreamMessage,
) -> Result<(), ()> {
    let text = serde_json::to_string(message).map_err(|_| ())?;
    tx.send(Message::text(text)).await.map_err(|_| ())
}

/// Adapt the SSE stream type for tests.
#[cfg(test)]
pub(crate) fn snapshot_then_updates(
    store: &Arc<AlertStore>,
) -> impl Stream<Item = StreamMessage> {
    let subscription = store.subscribe(SubscriberKind::Sse);
    let snapshot = StreamMessage::Snapshot {
        alerts: subscription.snapshot,
    };
    let guard = subscription.guard;
    futures::stream::once(async move { snapshot })
        .chain(ReceiverStream::new(subscription.rx))
        .map(move |message| {
            let _ = &guard;
            message
        })
}
