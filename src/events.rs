//! Queue event observer.
//!
//! Every lifecycle transition writes an entry to the capped `events` stream.
//! `QueueEvents` tails that stream from a cursor on a dedicated connection,
//! independent of any worker, and re-emits typed events to subscription
//! handles the caller owns.

use std::collections::HashMap;

use redis::aio::MultiplexedConnection;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Value};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::connection::{RedisLink, ReconnectBackoff};
use crate::error::Result;
use crate::keys::{KeySpace, DEFAULT_PREFIX};

/// Typed view of one entry on the events stream.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    Added { job_id: String, name: String },
    Waiting { job_id: String, prev: Option<String> },
    Active { job_id: String, prev: Option<String> },
    Stalled { job_id: String },
    Progress { job_id: String, data: serde_json::Value },
    Log { job_id: String },
    Completed { job_id: String, return_value: Option<serde_json::Value>, prev: Option<String> },
    Failed { job_id: String, failed_reason: String, prev: Option<String> },
    Delayed { job_id: String, delay: i64 },
    Removed { job_id: String },
    Cleaned { count: u64 },
    Drained,
    Duplicated { job_id: String },
    Paused,
    Resumed,
}

impl QueueEvent {
    /// Parse one stream entry's field map; unknown kinds yield `None`.
    pub fn parse(fields: &HashMap<String, String>) -> Option<Self> {
        let kind = fields.get("event")?.as_str();
        let job_id = || fields.get("jobId").cloned().unwrap_or_default();
        let prev = || fields.get("prev").cloned();
        Some(match kind {
            "added" => QueueEvent::Added {
                job_id: job_id(),
                name: fields.get("name").cloned().unwrap_or_default(),
            },
            "waiting" => QueueEvent::Waiting {
                job_id: job_id(),
                prev: prev(),
            },
            "active" => QueueEvent::Active {
                job_id: job_id(),
                prev: prev(),
            },
            "stalled" => QueueEvent::Stalled { job_id: job_id() },
            "progress" => QueueEvent::Progress {
                job_id: job_id(),
                data: fields
                    .get("data")
                    .and_then(|raw| serde_json::from_str(raw).ok())
                    .unwrap_or(serde_json::Value::Null),
            },
            "log" => QueueEvent::Log { job_id: job_id() },
            "completed" => QueueEvent::Completed {
                job_id: job_id(),
                return_value: fields
                    .get("returnvalue")
                    .and_then(|raw| serde_json::from_str(raw).ok()),
                prev: prev(),
            },
            "failed" => QueueEvent::Failed {
                job_id: job_id(),
                failed_reason: fields.get("failedReason").cloned().unwrap_or_default(),
                prev: prev(),
            },
            "delayed" => QueueEvent::Delayed {
                job_id: job_id(),
                delay: fields
                    .get("delay")
                    .and_then(|raw| raw.parse().ok())
                    .unwrap_or(0),
            },
            "removed" => QueueEvent::Removed { job_id: job_id() },
            "cleaned" => QueueEvent::Cleaned {
                count: fields
                    .get("count")
                    .and_then(|raw| raw.parse().ok())
                    .unwrap_or(0),
            },
            "drained" => QueueEvent::Drained,
            "duplicated" => QueueEvent::Duplicated { job_id: job_id() },
            "paused" => QueueEvent::Paused,
            "resumed" => QueueEvent::Resumed,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone)]
pub struct QueueEventsOptions {
    pub prefix: String,
    /// Stream cursor to resume from; `None` starts at the tip.
    pub last_event_id: Option<String>,
}

impl Default for QueueEventsOptions {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
            last_event_id: None,
        }
    }
}

/// A caller-owned subscription handle.
pub struct EventSubscription {
    rx: broadcast::Receiver<(String, QueueEvent)>,
}

impl EventSubscription {
    /// Next `(stream_id, event)` pair. Returns `None` once the observer is
    /// closed. A slow subscriber skips over dropped entries rather than
    /// stalling the observer.
    pub async fn next(&mut self) -> Option<(String, QueueEvent)> {
        loop {
            match self.rx.recv().await {
                Ok(entry) => return Some(entry),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

pub struct QueueEvents {
    sender: broadcast::Sender<(String, QueueEvent)>,
    shutdown: CancellationToken,
    reader: Option<JoinHandle<()>>,
}

impl QueueEvents {
    pub async fn new(url: &str, queue_name: &str, opts: QueueEventsOptions) -> Result<Self> {
        let link = RedisLink::connect(url).await?;
        Self::with_link(link, queue_name, opts).await
    }

    pub async fn with_link(
        link: RedisLink,
        queue_name: &str,
        opts: QueueEventsOptions,
    ) -> Result<Self> {
        let keys = KeySpace::new(&opts.prefix, queue_name);
        let (sender, _) = broadcast::channel(1024);
        let shutdown = CancellationToken::new();

        let reader = tokio::spawn(read_loop(
            link,
            keys,
            opts.last_event_id.unwrap_or_else(|| "$".to_string()),
            sender.clone(),
            shutdown.clone(),
        ));

        Ok(Self {
            sender,
            shutdown,
            reader: Some(reader),
        })
    }

    pub fn subscribe(&self) -> EventSubscription {
        EventSubscription {
            rx: self.sender.subscribe(),
        }
    }

    pub async fn close(mut self) {
        self.shutdown.cancel();
        if let Some(reader) = self.reader.take() {
            let _ = reader.await;
        }
    }
}

async fn read_loop(
    link: RedisLink,
    keys: KeySpace,
    mut cursor: String,
    sender: broadcast::Sender<(String, QueueEvent)>,
    shutdown: CancellationToken,
) {
    let events_key = keys.events();
    let mut backoff = ReconnectBackoff::default();
    let mut conn: Option<MultiplexedConnection> = None;

    loop {
        if shutdown.is_cancelled() {
            break;
        }

        if conn.is_none() {
            match link.blocking_connection().await {
                Ok(c) => {
                    backoff.reset();
                    conn = Some(c);
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    tracing::warn!(
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "Event stream reconnect failed"
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    continue;
                }
            }
        }
        let connection = conn.as_mut().expect("connection just established");

        let options = StreamReadOptions::default().block(5_000).count(128);
        let keys = [&events_key];
        let cursor_str = cursor.as_str();
        let ids = [cursor_str];
        let read = tokio::select! {
            _ = shutdown.cancelled() => break,
            r = connection.xread_options::<_, _, StreamReadReply>(
                &keys,
                &ids,
                &options,
            ) => r,
        };

        match read {
            Ok(reply) => {
                for stream in reply.keys {
                    for entry in stream.ids {
                        cursor = entry.id.clone();
                        let fields: HashMap<String, String> = entry
                            .map
                            .iter()
                            .filter_map(|(k, v)| {
                                stream_value_as_string(v).map(|s| (k.clone(), s))
                            })
                            .collect();
                        if let Some(event) = QueueEvent::parse(&fields) {
                            // no receivers is fine, entries just fall through
                            let _ = sender.send((entry.id.clone(), event));
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Event stream read failed, reconnecting");
                conn = None;
                let delay = backoff.next_delay();
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        // yield so a pending close gets a look-in under a hot stream
        tokio::task::yield_now().await;
    }
}

fn stream_value_as_string(v: &Value) -> Option<String> {
    match v {
        Value::BulkString(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        Value::SimpleString(s) => Some(s.clone()),
        Value::Int(i) => Some(i.to_string()),
        _ => None,
    }
}
