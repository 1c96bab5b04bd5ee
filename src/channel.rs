//! Per-call session state shared by the reader task and the interpreter.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Local};
use parking_lot::Mutex;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::{
    connection::EventDispatcher,
    constants::{PARAM_ANI, PARAM_CALL_ID, PARAM_CONN_ID, PARAM_DNIS},
    event::{EslEvent, EslEventType},
};

/// Error returned when parsing an unknown session state string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseSessionStateError(pub String);

impl fmt::Display for ParseSessionStateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown session state: {}", self.0)
    }
}

impl std::error::Error for ParseSessionStateError {}

define_header_enum! {
    error_type: ParseSessionStateError,
    /// Lifecycle of a call session.
    pub enum SessionState {
        /// Connected, not yet answered.
        Init => "Init",
        /// `CHANNEL_ANSWER` seen.
        Service => "Service",
        /// Call ended; no node may run.
        Hangup => "Hangup",
    }
}

#[derive(Debug)]
struct SessionInner {
    id: String,
    state: SessionState,
    active_node: String,
    no_input_count: u32,
    no_match_count: u32,
    params: HashMap<String, String>,
    collected: Option<String>,
}

/// One call.
///
/// The reader task writes through [`EventDispatcher::on_event`]; the
/// interpreter reads signals and updates the active node, counters and
/// collected digits. Plain fields sit behind a short-lived lock that is
/// never held across an await.
pub struct CallSession {
    name: String,
    created_at: DateTime<Local>,
    inner: Mutex<SessionInner>,
    dtmf_tx: mpsc::Sender<String>,
    dtmf_rx: AsyncMutex<mpsc::Receiver<String>>,
    playback_tx: mpsc::Sender<()>,
    playback_rx: AsyncMutex<mpsc::Receiver<()>>,
    hangup: CancellationToken,
    engine_stop: CancellationToken,
}

impl fmt::Debug for CallSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self
            .inner
            .lock();
        f.debug_struct("CallSession")
            .field("name", &self.name)
            .field("id", &inner.id)
            .field("state", &inner.state)
            .field("active_node", &inner.active_node)
            .finish()
    }
}

impl CallSession {
    /// New session in `Init` with an empty id and a DTMF queue of `dtmf_capacity`.
    pub fn new(name: impl Into<String>, dtmf_capacity: usize) -> Self {
        let (dtmf_tx, dtmf_rx) = mpsc::channel(dtmf_capacity.max(1));
        let (playback_tx, playback_rx) = mpsc::channel(1);
        Self {
            name: name.into(),
            created_at: Local::now(),
            inner: Mutex::new(SessionInner {
                id: String::new(),
                state: SessionState::Init,
                active_node: String::new(),
                no_input_count: 0,
                no_match_count: 0,
                params: HashMap::new(),
                collected: None,
            }),
            dtmf_tx,
            dtmf_rx: AsyncMutex::new(dtmf_rx),
            playback_tx,
            playback_rx: AsyncMutex::new(playback_rx),
            hangup: CancellationToken::new(),
            engine_stop: CancellationToken::new(),
        }
    }

    /// Transport-derived name (the peer address).
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn created_at(&self) -> DateTime<Local> {
        self.created_at
    }

    /// Channel id events are matched against.
    pub fn id(&self) -> String {
        self.inner
            .lock()
            .id
            .clone()
    }

    /// Set the id; used for the provisional id from the `connect` reply.
    pub fn set_id(&self, id: impl Into<String>) {
        self.inner
            .lock()
            .id = id.into();
    }

    pub fn state(&self) -> SessionState {
        self.inner
            .lock()
            .state
    }

    pub fn active_node(&self) -> String {
        self.inner
            .lock()
            .active_node
            .clone()
    }

    pub fn set_active_node(&self, node: impl Into<String>) {
        self.inner
            .lock()
            .active_node = node.into();
    }

    pub fn no_input_count(&self) -> u32 {
        self.inner
            .lock()
            .no_input_count
    }

    pub fn no_match_count(&self) -> u32 {
        self.inner
            .lock()
            .no_match_count
    }

    /// Bump the no-input counter, returning the new value.
    pub fn record_no_input(&self) -> u32 {
        let mut inner = self
            .inner
            .lock();
        inner.no_input_count += 1;
        inner.no_input_count
    }

    /// Bump the no-match counter, returning the new value.
    pub fn record_no_match(&self) -> u32 {
        let mut inner = self
            .inner
            .lock();
        inner.no_match_count += 1;
        inner.no_match_count
    }

    /// Call metadata value (`ANI`, `DNIS`, `callId`, `connId`).
    pub fn param(&self, key: &str) -> Option<String> {
        self.inner
            .lock()
            .params
            .get(key)
            .cloned()
    }

    /// Copy of all call metadata.
    pub fn params(&self) -> HashMap<String, String> {
        self.inner
            .lock()
            .params
            .clone()
    }

    /// Last digit string accepted by a collect node.
    pub fn collected_value(&self) -> Option<String> {
        self.inner
            .lock()
            .collected
            .clone()
    }

    pub fn set_collected_value(&self, value: impl Into<String>) {
        self.inner
            .lock()
            .collected = Some(value.into());
    }

    /// Token the engine stops on; cancelled when the call hangs up.
    pub fn engine_stop(&self) -> CancellationToken {
        self.engine_stop
            .clone()
    }

    /// Whether the hangup signal has fired.
    pub fn is_hung_up(&self) -> bool {
        self.hangup
            .is_cancelled()
    }

    /// Completes once the call hangs up.
    pub async fn hung_up(&self) {
        self.hangup
            .cancelled()
            .await
    }

    /// Next queued DTMF digit, waiting if none is queued.
    pub async fn next_digit(&self) -> Option<String> {
        self.dtmf_rx
            .lock()
            .await
            .recv()
            .await
    }

    /// Discard every queued DTMF digit, returning how many were dropped.
    pub async fn drain_dtmf(&self) -> usize {
        let mut rx = self
            .dtmf_rx
            .lock()
            .await;
        let mut drained = 0;
        while rx
            .try_recv()
            .is_ok()
        {
            drained += 1;
        }
        if drained > 0 {
            debug!("[{}] Discarded {} stale DTMF digit(s)", self.name, drained);
        }
        drained
    }

    /// Forget a playback-finished signal left over from an earlier prompt.
    pub async fn clear_playback_finished(&self) {
        let mut rx = self
            .playback_rx
            .lock()
            .await;
        while rx
            .try_recv()
            .is_ok()
        {}
    }

    /// Wait for the next `PLAYBACK_STOP`.
    pub async fn wait_playback_finished(&self) {
        // The sender lives as long as the session, so recv never yields None.
        let _ = self
            .playback_rx
            .lock()
            .await
            .recv()
            .await;
    }

    fn on_answer(&self, event: &EslEvent) {
        let uuid = event
            .channel_call_uuid()
            .unwrap_or_default()
            .to_string();
        let mut inner = self
            .inner
            .lock();
        inner.state = SessionState::Service;
        for (key, value) in [
            (PARAM_ANI, event.ani()),
            (PARAM_DNIS, event.dnis()),
            (PARAM_CALL_ID, event.channel_call_uuid()),
            (PARAM_CONN_ID, event.unique_id()),
        ] {
            inner
                .params
                .insert(key.to_string(), value.unwrap_or_default().to_string());
        }
        if inner.id != uuid {
            debug!("[{}] Channel id {} -> {}", self.name, inner.id, uuid);
        }
        inner.id = uuid;
        info!(
            "[{}] Call answered ani={} dnis={} callId={}",
            self.name,
            inner.params[PARAM_ANI],
            inner.params[PARAM_DNIS],
            inner.params[PARAM_CALL_ID]
        );
    }

    fn on_hangup(&self) {
        self.engine_stop
            .cancel();
        self.inner
            .lock()
            .state = SessionState::Hangup;
        self.hangup
            .cancel();
        info!("[{}] Call hung up", self.name);
    }
}

#[async_trait]
impl EventDispatcher for CallSession {
    async fn on_event(&self, event: EslEvent) {
        let event_type = event.event_type();
        trace!(
            "[{}] Event {:?} callId={:?}",
            self.name,
            event.event_name(),
            event.channel_call_uuid()
        );

        let id = self.id();
        if !id.is_empty() && event.channel_call_uuid() == Some(id.as_str()) {
            match event_type {
                Some(EslEventType::Dtmf) => match event.dtmf_digit() {
                    Some(digit) => {
                        trace!("[{}] DTMF {}", self.name, digit);
                        // Blocks the reader while the queue is full.
                        if self
                            .dtmf_tx
                            .send(digit.to_string())
                            .await
                            .is_err()
                        {
                            warn!("[{}] DTMF queue closed, dropping digit", self.name);
                        }
                    }
                    None => warn!("[{}] DTMF event without DTMF-Digit", self.name),
                },
                Some(EslEventType::PlaybackStop) => {
                    let _ = self
                        .playback_tx
                        .try_send(());
                }
                Some(EslEventType::ChannelAnswer) => self.on_answer(&event),
                _ => {}
            }
        }

        if event_type == Some(EslEventType::Hangup) {
            self.on_hangup();
        }
    }
}
