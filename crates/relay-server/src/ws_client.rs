use std::collections::{HashMap, HashSet};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use relay_types::{ControllerEvent, OutputStream};
use relay_wire::{ClientToServerMessage, ServerControlMessage};

use crate::AppState;

/// Per-subscriber outbound output queue depth (spec.md §4.6). Output
/// chunks are batched below so a slow client mostly just sees coarser
/// chunks rather than drops; once even that queue is saturated the
/// client is told via `TaskOutputTruncated` rather than left guessing.
/// Control/status events (`TaskUpdated`, agent events, pings) ride a
/// separate unbounded queue so they are never starved or dropped by a
/// burst of command output.
const OUTBOUND_QUEUE_CAPACITY: usize = 1024;
const OUTPUT_BATCH_WINDOW: Duration = Duration::from_millis(50);

enum Outbound {
    Event(ControllerEvent),
    Pong,
}

/// Serves one `/ws/client` UI-observer connection end to end: sends the
/// `initial_state` snapshot, then fans out `ControllerEvent`s with
/// same-stream output batched over a 50ms window, until the socket closes.
pub async fn handle(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();

    let initial = ControllerEvent::InitialState {
        agents: state.orchestrator.registry.list().await,
        tasks: state.orchestrator.tasks.list(None, None).await,
    };
    if send_event(&mut sink, &initial).await.is_err() {
        return;
    }

    let (important_tx, mut important_rx) = mpsc::unbounded_channel::<Outbound>();
    let (output_tx, mut output_rx) = mpsc::channel::<Outbound>(OUTBOUND_QUEUE_CAPACITY);

    let writer = tokio::spawn(async move {
        loop {
            let outbound = tokio::select! {
                biased;
                outbound = important_rx.recv() => match outbound {
                    Some(outbound) => outbound,
                    None => break,
                },
                outbound = output_rx.recv() => match outbound {
                    Some(outbound) => outbound,
                    None => break,
                },
            };
            let result = match outbound {
                Outbound::Event(event) => send_event(&mut sink, &event).await,
                Outbound::Pong => send_pong(&mut sink).await,
            };
            if result.is_err() {
                break;
            }
        }
    });

    let mut bus_rx = state.orchestrator.event_bus.subscribe();
    let mut pending_output: HashMap<(String, OutputStream, usize), String> = HashMap::new();
    let mut truncated: HashSet<String> = HashSet::new();
    let mut flush_ticker = tokio::time::interval(OUTPUT_BATCH_WINDOW);
    flush_ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if let Ok(ClientToServerMessage::Ping) = serde_json::from_str(&text) {
                            if important_tx.send(Outbound::Pong).is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
            _ = flush_ticker.tick() => {
                if flush_pending(&mut pending_output, &important_tx, &output_tx, &mut truncated).is_err() {
                    break;
                }
            }
            event = bus_rx.recv() => {
                match event {
                    Ok(ControllerEvent::TaskOutput { task_id, command_index, stream, content }) => {
                        pending_output
                            .entry((task_id, stream, command_index))
                            .or_insert_with(String::new)
                            .push_str(&content);
                    }
                    Ok(other) => {
                        if flush_pending(&mut pending_output, &important_tx, &output_tx, &mut truncated).is_err() {
                            break;
                        }
                        if enqueue(&important_tx, &output_tx, &mut truncated, other).is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "client event subscriber lagged behind the bus");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    writer.abort();
}

fn flush_pending(
    pending: &mut HashMap<(String, OutputStream, usize), String>,
    important_tx: &mpsc::UnboundedSender<Outbound>,
    output_tx: &mpsc::Sender<Outbound>,
    truncated: &mut HashSet<String>,
) -> Result<(), ()> {
    for ((task_id, stream, command_index), content) in pending.drain() {
        let event = ControllerEvent::TaskOutput { task_id, command_index, stream, content };
        enqueue(important_tx, output_tx, truncated, event)?;
    }
    Ok(())
}

/// Routes `event` to the queue matching its priority. `TaskOutput` chunks
/// go on the bounded output queue and degrade to a one-time
/// `TaskOutputTruncated` notice (delivered on the unbounded queue, so it
/// can't itself be dropped) once that queue is saturated. Every other
/// event — agent/task status, results — rides the unbounded queue
/// directly and is never dropped under back-pressure.
fn enqueue(
    important_tx: &mpsc::UnboundedSender<Outbound>,
    output_tx: &mpsc::Sender<Outbound>,
    truncated: &mut HashSet<String>,
    event: ControllerEvent,
) -> Result<(), ()> {
    if let ControllerEvent::TaskOutput { ref task_id, .. } = event {
        let task_id = task_id.clone();
        return match output_tx.try_send(Outbound::Event(event)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                if truncated.insert(task_id.clone()) {
                    tracing::warn!(task_id, "output queue full for subscriber, signalling truncation");
                    important_tx
                        .send(Outbound::Event(ControllerEvent::TaskOutputTruncated { task_id }))
                        .map_err(|_| ())
                } else {
                    Ok(())
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(()),
        };
    }
    important_tx.send(Outbound::Event(event)).map_err(|_| ())
}

async fn send_event(
    sink: &mut futures::stream::SplitSink<WebSocket, Message>,
    event: &ControllerEvent,
) -> Result<(), axum::Error> {
    let payload = serde_json::to_string(event).unwrap_or_default();
    sink.send(Message::Text(payload.into())).await
}

async fn send_pong(sink: &mut futures::stream::SplitSink<WebSocket, Message>) -> Result<(), axum::Error> {
    let payload = serde_json::to_string(&ServerControlMessage::Pong).unwrap_or_default();
    sink.send(Message::Text(payload.into())).await
}
