//! Drives the server's realtime stream into a [`Realtime`] hub.

use std::sync::Arc;

use futures_util::StreamExt;
use reqwest::header;
use tracing::{debug, info, trace, warn};

use hearth_sync::SyncError;
use hearth_sync::config::SyncConfig;
use hearth_sync::realtime::Realtime;
use hearth_types::events::{ConnectFrame, RealtimeEvent, RecordEvent, topic_collection};

use crate::http::{HttpBackend, error_from_response, network};
use crate::sse::{SseDecoder, SseFrame};

const CONNECT_EVENT: &str = "PB_CONNECT";

/// Keep the realtime stream open forever, reconnecting on the configured
/// backoff schedule. Abort the task to stop it.
pub async fn run_realtime(backend: Arc<HttpBackend>, realtime: Realtime, config: SyncConfig) {
    let mut attempt = 0usize;
    loop {
        let mut connected = false;
        match stream_once(&backend, &realtime, &mut connected).await {
            Ok(()) => info!("Realtime stream closed by server"),
            Err(e) => warn!("Realtime stream failed: {}", e),
        }

        if connected {
            realtime.publish(RealtimeEvent::Disconnected);
            attempt = 0;
        }

        let delay = config.reconnect_delay(attempt);
        attempt += 1;
        debug!("Reconnecting realtime in {:?} (attempt {})", delay, attempt);
        tokio::time::sleep(delay).await;
    }
}

async fn stream_once(
    backend: &HttpBackend,
    realtime: &Realtime,
    connected: &mut bool,
) -> Result<(), SyncError> {
    let resp = backend
        .authorized(backend.client().get(backend.url("/api/realtime")))
        .header(header::ACCEPT, "text/event-stream")
        .send()
        .await
        .map_err(network)?;
    if !resp.status().is_success() {
        return Err(error_from_response(resp).await);
    }

    let mut stream = resp.bytes_stream();
    let mut decoder = SseDecoder::new();
    let mut topics_rx = realtime.topics();
    let mut client_id: Option<String> = None;

    loop {
        tokio::select! {
            chunk = stream.next() => {
                let Some(chunk) = chunk else {
                    return Ok(());
                };
                let chunk = chunk.map_err(network)?;
                for frame in decoder.push(&chunk) {
                    if frame.event == CONNECT_EVENT {
                        let connect: ConnectFrame = serde_json::from_str(&frame.data)
                            .map_err(|e| SyncError::Decode(e.to_string()))?;

                        // Topics must be registered before anyone refetches.
                        let topics = topics_rx.borrow_and_update().clone();
                        backend.set_realtime_topics(&connect.client_id, topics).await?;

                        *connected = true;
                        client_id = Some(connect.client_id.clone());
                        realtime.publish(RealtimeEvent::Connected { client_id: connect.client_id });
                    } else {
                        forward_record(realtime, frame);
                    }
                }
            }

            changed = topics_rx.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                let topics = topics_rx.borrow_and_update().clone();
                if let Some(id) = &client_id {
                    backend.set_realtime_topics(id, topics).await?;
                }
            }
        }
    }
}

fn forward_record(realtime: &Realtime, frame: SseFrame) {
    match serde_json::from_str::<RecordEvent>(&frame.data) {
        Ok(event) => {
            trace!("{:?} on {}: {}", event.action, frame.event, event.record.id);
            realtime.publish(RealtimeEvent::Record {
                collection: topic_collection(&frame.event).to_string(),
                event,
            });
        }
        Err(e) => debug!("Skipping realtime frame '{}': {}", frame.event, e),
    }
}
