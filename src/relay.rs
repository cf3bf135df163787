//! Spoke relay
//!
//! One relay mirrors one radar's spoke WebSocket on the backend to the host's
//! stream sink. Frames are opaque: every binary message is handed over
//! unmodified, as soon as it is read, and never buffered.
//!
//! ```text
//!   Idle ──start()──► Connecting ──ok──► Open ──close/error──► ReconnectPending
//!                         ▲   │                                     │
//!                         │   └──────────fail───────────────────────┤
//!                         └──────────── after reconnect delay ──────┘
//!
//!   any state ──stop()──► Stopped (terminal)
//! ```
//!
//! The relay runs as a single tokio task, so there is never more than one
//! pending reconnect. `stop()` marks the relay `Stopped` under the same lock
//! the forwarding path holds while emitting, so once `stop()` returns no
//! frame is forwarded any more, even if the socket still delivers one.

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use strum::Display;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tokio_util::sync::CancellationToken;

use crate::error::BridgeError;
use crate::host::{stream_key, StreamSink};

/// Deadline for the WebSocket handshake
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RelayState {
    Idle,
    Connecting,
    Open,
    ReconnectPending,
    Stopped,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayStats {
    pub connected: bool,
    pub frames_forwarded: u64,
    pub connect_attempts: u64,
}

/// A per-device relay as seen by the fleet.
pub trait Relay: Send {
    /// Begin connecting. No-op once started or stopped.
    fn start(&mut self);

    /// Stop for good. Safe to call any number of times.
    fn stop(&mut self);

    fn is_connected(&self) -> bool;

    fn stats(&self) -> RelayStats {
        RelayStats {
            connected: self.is_connected(),
            ..RelayStats::default()
        }
    }
}

/// Creates the relay for a newly discovered device.
pub trait RelayFactory: Send + Sync {
    fn create(&self, device_id: &str, stream_url: String) -> Box<dyn Relay>;
}

struct RelayShared {
    stream_key: String,
    state: RwLock<RelayState>,
    sink: Arc<dyn StreamSink>,
    frames_forwarded: AtomicU64,
    connect_attempts: AtomicU64,
}

impl RelayShared {
    fn state(&self) -> RelayState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move to `next` unless stopped. Returns false when stopped.
    fn transition(&self, next: RelayState) -> bool {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if *state == RelayState::Stopped {
            return false;
        }
        *state = next;
        true
    }

    fn forward(&self, frame: &[u8]) -> bool {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        if *state != RelayState::Open {
            return false;
        }
        self.frames_forwarded.fetch_add(1, Ordering::Relaxed);
        log::trace!("{}: forwarding {} bytes", self.stream_key, frame.len());
        self.sink.emit_frame(&self.stream_key, frame)
    }
}

pub struct SpokeRelay {
    device_id: String,
    url: String,
    reconnect_interval: Duration,
    shared: Arc<RelayShared>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl SpokeRelay {
    pub fn new(
        device_id: &str,
        url: String,
        reconnect_interval: Duration,
        sink: Arc<dyn StreamSink>,
    ) -> Self {
        Self {
            device_id: device_id.to_string(),
            url,
            reconnect_interval,
            shared: Arc::new(RelayShared {
                stream_key: stream_key(device_id),
                state: RwLock::new(RelayState::Idle),
                sink,
                frames_forwarded: AtomicU64::new(0),
                connect_attempts: AtomicU64::new(0),
            }),
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> RelayState {
        self.shared.state()
    }
}

impl Relay for SpokeRelay {
    fn start(&mut self) {
        if self.task.is_some() {
            return;
        }
        if !self.shared.transition(RelayState::Connecting) {
            log::debug!("{}: start() on stopped relay ignored", self.device_id);
            return;
        }
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => {
                log::error!("{}: cannot start relay outside a runtime: {}", self.device_id, e);
                self.shared.transition(RelayState::Idle);
                return;
            }
        };

        log::info!("{}: starting spoke relay from {}", self.device_id, self.url);
        self.task = Some(runtime.spawn(run(
            self.shared.clone(),
            self.url.clone(),
            self.reconnect_interval,
            self.cancel.clone(),
        )));
    }

    fn stop(&mut self) {
        {
            let mut state = self.shared.state.write().unwrap_or_else(PoisonError::into_inner);
            if *state == RelayState::Stopped {
                return;
            }
            *state = RelayState::Stopped;
        }
        self.cancel.cancel();
        log::info!("{}: spoke relay stopped", self.device_id);
    }

    fn is_connected(&self) -> bool {
        self.shared.state() == RelayState::Open
    }

    fn stats(&self) -> RelayStats {
        RelayStats {
            connected: self.is_connected(),
            frames_forwarded: self.shared.frames_forwarded.load(Ordering::Relaxed),
            connect_attempts: self.shared.connect_attempts.load(Ordering::Relaxed),
        }
    }
}

impl Drop for SpokeRelay {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run(
    shared: Arc<RelayShared>,
    url: String,
    reconnect_interval: Duration,
    cancel: CancellationToken,
) {
    let key = shared.stream_key.clone();

    loop {
        if !shared.transition(RelayState::Connecting) {
            break;
        }
        shared.connect_attempts.fetch_add(1, Ordering::Relaxed);
        log::debug!("{}: connecting to {}", key, url);

        let connected = tokio::select! {
            _ = cancel.cancelled() => break,
            r = timeout(CONNECT_TIMEOUT, connect_async(url.as_str())) => r,
        };

        match connected {
            Ok(Ok((ws_stream, _))) => {
                let (mut write, mut read) = ws_stream.split();
                if !shared.transition(RelayState::Open) {
                    let _ = write.close().await;
                    break;
                }
                log::info!("{}: connected to {}", key, url);

                let stopped = loop {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            let _ = write.close().await;
                            break true;
                        }
                        msg = read.next() => match msg {
                            Some(Ok(Message::Binary(data))) => {
                                shared.forward(&data);
                            }
                            Some(Ok(Message::Close(frame))) => {
                                log::info!("{}: closed by backend: {:?}", key, frame);
                                break false;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                log::warn!("{}: {}", key, BridgeError::from(e));
                                break false;
                            }
                            None => {
                                log::info!("{}: stream ended", key);
                                break false;
                            }
                        }
                    }
                };
                if stopped {
                    break;
                }
            }
            Ok(Err(e)) => {
                log::warn!("{}: cannot connect: {}", key, BridgeError::from(e));
            }
            Err(_) => {
                log::warn!(
                    "{}: {}",
                    key,
                    BridgeError::Timeout(CONNECT_TIMEOUT.as_millis() as u64)
                );
            }
        }

        if !shared.transition(RelayState::ReconnectPending) {
            break;
        }
        log::info!(
            "{}: reconnecting in {} ms",
            key,
            reconnect_interval.as_millis()
        );
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleep(reconnect_interval) => {}
        }
    }

    log::debug!("{}: relay task finished", key);
}

/// Builds [`SpokeRelay`]s that all share one sink and reconnect delay.
pub struct SpokeRelayFactory {
    sink: Arc<dyn StreamSink>,
    reconnect_interval: Duration,
}

impl SpokeRelayFactory {
    pub fn new(sink: Arc<dyn StreamSink>, reconnect_interval: Duration) -> Self {
        Self {
            sink,
            reconnect_interval,
        }
    }
}

impl RelayFactory for SpokeRelayFactory {
    fn create(&self, device_id: &str, stream_url: String) -> Box<dyn Relay> {
        Box::new(SpokeRelay::new(
            device_id,
            stream_url,
            self.reconnect_interval,
            self.sink.clone(),
        ))
    }
}
