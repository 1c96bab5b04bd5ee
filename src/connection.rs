//! Protocol engine for one outbound event socket connection

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{oneshot, watch, Mutex};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::{
    command::{EslCommand, EslResponse},
    constants::{
        DEFAULT_COMMAND_TIMEOUT_MS, DEFAULT_SOUND_ROOT, DTMF_QUEUE_CAPACITY, SOCKET_BUF_SIZE,
        SUBSCRIBED_EVENTS,
    },
    error::{EslError, EslResult},
    event::EslEvent,
    protocol::{classify, EslParser, Inbound},
};

/// Receiver of decoded events.
///
/// Called on the reader task, one event at a time; the next frame is not read
/// until `on_event` returns. A dispatcher that blocks stalls event delivery
/// for its connection.
#[async_trait]
pub trait EventDispatcher: Send + Sync {
    /// Handle one event.
    async fn on_event(&self, event: EslEvent);
}

/// Connection status
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConnectionStatus {
    /// Reader task is running.
    Connected,
    /// Reader task has ended.
    Disconnected(DisconnectReason),
}

/// Reason the reader task ended
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DisconnectReason {
    /// Switch sent a text/disconnect-notice
    ServerNotice,
    /// Malformed frame or undecodable event
    ProtocolError(String),
    /// Socket error (io::Error is not Clone, so we store the message)
    IoError(String),
    /// Clean EOF on the stream
    ConnectionClosed,
    /// Engine stopped locally
    ClientRequested,
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisconnectReason::ServerNotice => write!(f, "server sent disconnect notice"),
            DisconnectReason::ProtocolError(msg) => write!(f, "protocol error: {}", msg),
            DisconnectReason::IoError(msg) => write!(f, "I/O error: {}", msg),
            DisconnectReason::ConnectionClosed => write!(f, "connection closed"),
            DisconnectReason::ClientRequested => write!(f, "engine stopped"),
        }
    }
}

/// Options fixed at connection time.
#[derive(Debug, Clone)]
pub struct EslConnectOptions {
    /// How long a command waits for its reply. Default: 3000 ms.
    pub command_timeout: Duration,
    /// Directory announcement files resolve under. Default: `/opt/Dev/IVR/sound/`.
    pub sound_root: String,
    /// Capacity of the per-call pending DTMF queue. Default: 20.
    pub dtmf_queue_capacity: usize,
}

impl Default for EslConnectOptions {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_millis(DEFAULT_COMMAND_TIMEOUT_MS),
            sound_root: DEFAULT_SOUND_ROOT.to_string(),
            dtmf_queue_capacity: DTMF_QUEUE_CAPACITY,
        }
    }
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Shared state between EslConnection and the reader task
struct SharedState {
    pending_reply: Mutex<Option<oneshot::Sender<EslResult<EslResponse>>>>,
}

/// Handle to one event socket connection.
///
/// Commands are serialized through the writer mutex, which is held from
/// write until the reply arrives, so at most one command is in flight. The
/// reader task routes replies to the pending oneshot channel and events to
/// the [`EventDispatcher`].
#[derive(Clone)]
pub struct EslConnection {
    writer: Arc<Mutex<BoxedWriter>>,
    shared: Arc<SharedState>,
    status_rx: watch::Receiver<ConnectionStatus>,
    shutdown: CancellationToken,
    options: EslConnectOptions,
}

impl std::fmt::Debug for EslConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EslConnection")
            .field("connected", &self.is_connected())
            .finish()
    }
}

async fn reader_loop<R>(
    reader: R,
    shared: Arc<SharedState>,
    dispatcher: Arc<dyn EventDispatcher>,
    shutdown: CancellationToken,
    status_tx: watch::Sender<ConnectionStatus>,
) where
    R: AsyncRead + Unpin + Send,
{
    let result = std::panic::AssertUnwindSafe(reader_loop_inner(
        reader,
        shared.clone(),
        dispatcher,
        shutdown,
    ));
    let reason = match futures_util::FutureExt::catch_unwind(result).await {
        Ok(reason) => reason,
        Err(_) => {
            tracing::error!("reader task panicked");
            DisconnectReason::IoError("reader task panicked".to_string())
        }
    };

    info!("Reader stopped: {}", reason);
    let _ = status_tx.send(ConnectionStatus::Disconnected(reason));

    // Dropping the sender fails a pending command with ConnectionClosed.
    shared
        .pending_reply
        .lock()
        .await
        .take();
}

async fn reader_loop_inner<R>(
    mut reader: R,
    shared: Arc<SharedState>,
    dispatcher: Arc<dyn EventDispatcher>,
    shutdown: CancellationToken,
) -> DisconnectReason
where
    R: AsyncRead + Unpin + Send,
{
    let mut parser = EslParser::new();
    let mut read_buffer = vec![0u8; SOCKET_BUF_SIZE];

    loop {
        // Drain complete messages before reading more
        match parser.parse_message() {
            Ok(Some(message)) => {
                trace!("[RECV] {:?} {:?}", message.message_type, message.headers);
                match classify(message) {
                    Ok(Inbound::Reply(result)) => {
                        let mut pending = shared
                            .pending_reply
                            .lock()
                            .await;
                        if let Some(tx) = pending.take() {
                            let _ = tx.send(result);
                        } else {
                            warn!("Received command reply but no command is pending");
                        }
                    }
                    Ok(Inbound::Event(event)) => {
                        tokio::select! {
                            _ = dispatcher.on_event(event) => {}
                            _ = shutdown.cancelled() => return DisconnectReason::ClientRequested,
                        }
                    }
                    Ok(Inbound::Disconnect(event)) => {
                        info!("Received disconnect notice from server");
                        tokio::select! {
                            _ = dispatcher.on_event(event) => {}
                            _ = shutdown.cancelled() => {}
                        }
                        return DisconnectReason::ServerNotice;
                    }
                    Ok(Inbound::Ignored(message_type)) => {
                        debug!("Ignoring message: {:?}", message_type);
                    }
                    Err(e) => {
                        warn!("Failed to decode message: {}", e);
                        return DisconnectReason::ProtocolError(e.to_string());
                    }
                }
                continue;
            }
            Ok(None) => {}
            Err(e) => {
                warn!("Parser error: {}", e);
                return DisconnectReason::ProtocolError(e.to_string());
            }
        }

        let read_result = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return DisconnectReason::ClientRequested,
            r = reader.read(&mut read_buffer) => r,
        };

        match read_result {
            Ok(0) => {
                info!("Connection closed (EOF)");
                return DisconnectReason::ConnectionClosed;
            }
            Ok(n) => {
                if let Err(e) = parser.add_data(&read_buffer[..n]) {
                    warn!("Buffer error: {}", e);
                    return DisconnectReason::ProtocolError(e.to_string());
                }
            }
            Err(e) => {
                warn!("Read error: {}", e);
                return DisconnectReason::IoError(e.to_string());
            }
        }
    }
}

impl EslConnection {
    /// Split `stream` and start the reader task.
    ///
    /// Events go to `dispatcher`. Cancelling `shutdown` stops the reader and
    /// makes every later command fail with [`EslError::NotConnected`].
    pub fn spawn<S>(
        stream: S,
        dispatcher: Arc<dyn EventDispatcher>,
        shutdown: CancellationToken,
        options: EslConnectOptions,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);

        let shared = Arc::new(SharedState {
            pending_reply: Mutex::new(None),
        });
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Connected);

        tokio::spawn(reader_loop(
            read_half,
            shared.clone(),
            dispatcher,
            shutdown.clone(),
            status_tx,
        ));

        Self {
            writer: Arc::new(Mutex::new(Box::new(write_half))),
            shared,
            status_rx,
            shutdown,
            options,
        }
    }

    /// Send a command and wait for its reply.
    ///
    /// The writer lock is held through the entire send-and-receive cycle so
    /// a second command cannot overwrite the pending reply slot. A reply
    /// carrying the error marker fails with [`EslError::CommandRejected`].
    pub async fn send_command(&self, command: EslCommand) -> EslResult<EslResponse> {
        if self
            .shutdown
            .is_cancelled()
            || !self.is_connected()
        {
            return Err(EslError::NotConnected);
        }

        let command_str = command.to_wire_format()?;
        debug!("Sending command: {}", command.summary());
        trace!("[SEND] {:?}", command_str);

        let mut writer = self
            .writer
            .lock()
            .await;

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self
                .shared
                .pending_reply
                .lock()
                .await;
            *pending = Some(tx);
        }

        let written = async {
            writer
                .write_all(command_str.as_bytes())
                .await?;
            writer
                .flush()
                .await
        }
        .await;
        if let Err(e) = written {
            self.shared
                .pending_reply
                .lock()
                .await
                .take();
            return Err(EslError::Io(e));
        }

        let timeout_ms = self
            .options
            .command_timeout
            .as_millis() as u64;
        let result = match timeout(self.options.command_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(EslError::ConnectionClosed),
            Err(_) => {
                self.shared
                    .pending_reply
                    .lock()
                    .await
                    .take();
                warn!(
                    "Command '{}' got no reply within {}ms",
                    command.summary(),
                    timeout_ms
                );
                Err(EslError::CommandTimeout {
                    command: command.summary(),
                    timeout_ms,
                })
            }
        };
        drop(writer);

        match &result {
            Ok(response) => debug!("Received reply: {:?}", response.reply_text()),
            Err(e) => debug!("Command '{}' failed: {}", command.summary(), e),
        }
        result
    }

    /// Send a raw command line; resolves to the reply's channel id or reply text.
    pub async fn send_raw(&self, command: &str) -> EslResult<String> {
        self.send_command(EslCommand::Raw(command.to_string()))
            .await
            .map(|r| r.value())
    }

    /// Execute a dialplan application on the attached channel.
    ///
    /// Resolves to the reply's channel id or reply text.
    pub async fn execute(&self, app: &str, arg: Option<&str>) -> EslResult<String> {
        self.send_command(EslCommand::Execute {
            app: app.to_string(),
            args: arg.map(str::to_string),
        })
        .await
        .map(|r| r.value())
    }

    /// Attach to the session and subscribe to the events the IVR consumes.
    ///
    /// Returns the value of the `connect` reply: the channel id the switch
    /// reported for this connection.
    pub async fn connect_and_subscribe(&self) -> EslResult<String> {
        let channel_id = self
            .send_command(EslCommand::Connect)
            .await?
            .value();
        self.send_command(EslCommand::Events {
            format: "json".to_string(),
            events: SUBSCRIBED_EVENTS.to_string(),
        })
        .await?;
        Ok(channel_id)
    }

    /// Answer the call.
    pub async fn answer(&self) -> EslResult<String> {
        self.execute("answer", None)
            .await
    }

    /// Hang up the call.
    pub async fn hangup(&self) -> EslResult<String> {
        self.execute("hangup", None)
            .await
    }

    /// Pause the channel for `ms` milliseconds.
    pub async fn sleep(&self, ms: u64) -> EslResult<String> {
        self.execute("sleep", Some(&ms.to_string()))
            .await
    }

    /// Play `file` from the sound root with two channel variables attached.
    pub async fn play_announcement(&self, file: &str, var1: &str, var2: &str) -> EslResult<String> {
        let arg = format!(
            "{{var1={},var2={}}}{}{}",
            var1, var2, self.options.sound_root, file
        );
        self.execute("playback", Some(&arg))
            .await
    }

    /// Allow (`true`) or forbid DTMF from interrupting playback.
    pub async fn set_barge_in(&self, enabled: bool) -> EslResult<String> {
        let arg = if enabled {
            "playback_terminators=any"
        } else {
            "playback_terminators=none"
        };
        self.execute("set", Some(arg))
            .await
    }

    /// Enable in-band DTMF detection.
    pub async fn start_dtmf(&self) -> EslResult<String> {
        self.execute("start_dtmf", None)
            .await
    }

    /// Disable in-band DTMF detection.
    pub async fn stop_dtmf(&self) -> EslResult<String> {
        self.execute("stop_dtmf", None)
            .await
    }

    /// Whether the reader task is still running.
    pub fn is_connected(&self) -> bool {
        matches!(
            *self
                .status_rx
                .borrow(),
            ConnectionStatus::Connected
        )
    }

    /// Current connection status snapshot.
    pub fn status(&self) -> ConnectionStatus {
        self.status_rx
            .borrow()
            .clone()
    }

    /// Wait until the reader task has ended and return why.
    pub async fn disconnected(&self) -> DisconnectReason {
        let mut rx = self
            .status_rx
            .clone();
        let status = rx
            .wait_for(|s| matches!(s, ConnectionStatus::Disconnected(_)))
            .await
            .map(|s| (*s).clone());
        match status {
            Ok(ConnectionStatus::Disconnected(reason)) => reason,
            _ => DisconnectReason::ConnectionClosed,
        }
    }

    /// Stop the engine and shut down the write half.
    ///
    /// Safe to call while a command is in flight: stopping the reader fails
    /// that command with [`EslError::ConnectionClosed`] and releases the writer.
    pub async fn close(&self) -> EslResult<()> {
        if !self
            .shutdown
            .is_cancelled()
        {
            info!("Closing connection");
        }
        self.shutdown
            .cancel();
        let mut writer = self
            .writer
            .lock()
            .await;
        writer
            .shutdown()
            .await
            .map_err(EslError::Io)
    }
}
