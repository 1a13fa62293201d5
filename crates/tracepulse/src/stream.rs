use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::time::{Instant, MissedTickBehavior};
use tracepulse_core::ErrorKind;
use tracepulse_core::stream::{ClientMessage, StreamContract, SubscribeRequest};
use tracepulse_ingest::api::{ApiResult, require_tenant};
use tracepulse_ingest::{Subscription, TenantPipeline};

use crate::query_server::QueryState;

const CLOSE_GOING_AWAY: u16 = 1001;
const CLOSE_POLICY: u16 = 1008;
const CLOSE_TRY_AGAIN: u16 = 1013;

/// Query-string subscription for clients that cannot send a `subscribe`
/// frame. When `topics` is given the handshake is skipped.
#[derive(Debug, Default, Deserialize)]
pub struct StreamParams {
    pub tenant: Option<String>,
    pub topics: Option<String>,
    pub series: Option<String>,
    pub last_seq: Option<u64>,
}

impl StreamParams {
    fn subscribe_request(&self) -> tracepulse_core::Result<Option<SubscribeRequest>> {
        let Some(topics) = self.topics.as_deref() else {
            return Ok(None);
        };
        let topics = topics
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect::<Vec<_>>();
        SubscribeRequest::parse(&topics, self.last_seq, self.series.as_deref()).map(Some)
    }
}

pub async fn stream_handler(
    ws: WebSocketUpgrade,
    State(state): State<QueryState>,
    Query(params): Query<StreamParams>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let tenant = require_tenant(&headers, params.tenant.as_deref())?;
    let pipeline = state.registry.get(&tenant)?;
    let preset = params.subscribe_request()?;
    let contract = StreamContract::from_config(&state.cfg);
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, pipeline, contract, preset)))
}

type Sender = SplitSink<WebSocket, Message>;

async fn handle_socket(
    socket: WebSocket,
    pipeline: Arc<TenantPipeline>,
    contract: StreamContract,
    preset: Option<SubscribeRequest>,
) {
    let tenant = pipeline.tenant().clone();
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let request = match preset {
        Some(req) => req,
        None => await_subscribe(&mut ws_receiver, &contract).await,
    };
    let mut subscription = match pipeline.subscribe(&request) {
        Ok(sub) => sub,
        Err(err) => {
            close(&mut ws_sender, CLOSE_POLICY, err.kind().as_str()).await;
            return;
        }
    };
    tracing::info!(tenant = %tenant, subscriber = subscription.id, "stream client connected");

    let idle_timeout = Duration::from_millis(contract.idle_timeout_ms);
    let mut last_seen = Instant::now();
    let mut pings = tokio::time::interval(Duration::from_millis(contract.heartbeat_interval_ms));
    pings.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            envelope = subscription.receiver.recv() => {
                let Some(envelope) = envelope else {
                    let reason = subscription.disconnect_reason();
                    tracing::info!(
                        tenant = %tenant,
                        subscriber = subscription.id,
                        reason = reason.map(ErrorKind::as_str),
                        "hub closed subscription"
                    );
                    let code = match reason {
                        Some(ErrorKind::SubscriberBackpressure) => CLOSE_TRY_AGAIN,
                        Some(_) => CLOSE_POLICY,
                        None => CLOSE_GOING_AWAY,
                    };
                    close(&mut ws_sender, code, reason.map_or("closed", ErrorKind::as_str)).await;
                    break;
                };
                let Ok(text) = envelope.to_json() else {
                    continue;
                };
                if ws_sender.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        last_seen = Instant::now();
                        match handle_client_message(&text, &pipeline, &mut subscription) {
                            Ok(()) => {}
                            Err(err) => tracing::debug!(
                                tenant = %tenant,
                                error = %err,
                                "ignoring client frame"
                            ),
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        last_seen = Instant::now();
                        let _ = ws_sender.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Pong(_))) | Some(Ok(Message::Binary(_))) => {
                        last_seen = Instant::now();
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(err)) => {
                        tracing::debug!(tenant = %tenant, error = %err, "websocket error");
                        break;
                    }
                }
            }
            _ = pings.tick() => {
                if last_seen.elapsed() >= idle_timeout {
                    tracing::info!(tenant = %tenant, subscriber = subscription.id, "closing idle stream");
                    close(&mut ws_sender, CLOSE_GOING_AWAY, "idle timeout").await;
                    break;
                }
                if ws_sender.send(Message::Ping(Default::default())).await.is_err() {
                    break;
                }
            }
        }
    }

    pipeline.hub().unsubscribe(subscription.id);
    tracing::info!(tenant = %tenant, subscriber = subscription.id, "stream client disconnected");
}

/// Waits for the client's `subscribe` frame; silence or garbage falls back to
/// the default subscription.
async fn await_subscribe(
    receiver: &mut futures::stream::SplitStream<WebSocket>,
    contract: &StreamContract,
) -> SubscribeRequest {
    let wait = Duration::from_millis(contract.subscribe_timeout_ms);
    let first = tokio::time::timeout(wait, async {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Text(text) = msg {
                return Some(text);
            }
        }
        None
    })
    .await;

    let Ok(Some(text)) = first else {
        return SubscribeRequest::default();
    };
    match serde_json::from_str::<ClientMessage>(&text) {
        Ok(ClientMessage::Subscribe {
            topics,
            last_seq,
            series,
        }) => SubscribeRequest::parse(&topics, last_seq, series.as_deref()).unwrap_or_else(|err| {
            tracing::debug!(error = %err, "invalid subscribe frame; using defaults");
            SubscribeRequest::default()
        }),
        _ => SubscribeRequest::default(),
    }
}

fn handle_client_message(
    text: &str,
    pipeline: &TenantPipeline,
    subscription: &mut Subscription,
) -> tracepulse_core::Result<()> {
    let msg: ClientMessage = serde_json::from_str(text)
        .map_err(|e| tracepulse_core::TracepulseError::Parse(format!("bad client frame: {e}")))?;
    match msg {
        ClientMessage::Ack { seq } => pipeline.hub().ack(subscription.id, seq),
        ClientMessage::Ping => {}
        ClientMessage::Subscribe {
            topics,
            last_seq,
            series,
        } => {
            let req = SubscribeRequest::parse(&topics, last_seq, series.as_deref())?;
            let next = pipeline.subscribe(&req)?;
            pipeline.hub().unsubscribe(subscription.id);
            *subscription = next;
        }
    }
    Ok(())
}

async fn close(sender: &mut Sender, code: u16, reason: &str) {
    let frame = CloseFrame {
        code,
        reason: reason.to_string().into(),
    };
    let _ = sender.send(Message::Close(Some(frame))).await;
    let _ = sender.close().await;
}
