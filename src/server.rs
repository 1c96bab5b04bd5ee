//! Outbound socket server: one engine, session and interpreter run per call.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    callflow::CallFlowStore,
    channel::CallSession,
    connection::{EslConnectOptions, EslConnection},
    constants::DEFAULT_LISTEN_PORT,
    error::{IvrError, IvrResult},
    ivr::{Interpreter, InterpreterOptions},
    persist::Persistor,
};

/// Server settings.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Default: `0.0.0.0:8084`.
    pub listen_addr: SocketAddr,
    /// Call-flow definition file.
    pub callflow_path: PathBuf,
    /// How often the call-flow file is checked for changes. Default: 5 s.
    pub reload_interval: Duration,
    pub connect: EslConnectOptions,
    pub interpreter: InterpreterOptions,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_LISTEN_PORT)),
            callflow_path: PathBuf::from("callflow.xml"),
            reload_interval: Duration::from_secs(5),
            connect: EslConnectOptions::default(),
            interpreter: InterpreterOptions::default(),
        }
    }
}

/// Live sessions keyed by connection name.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<CallSession>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, session: Arc<CallSession>) {
        let name = session
            .name()
            .to_string();
        if self
            .sessions
            .lock()
            .insert(name.clone(), session)
            .is_some()
        {
            warn!("[{}] Replaced an existing session with the same name", name);
        }
    }

    fn remove(&self, name: &str) -> Option<Arc<CallSession>> {
        self.sessions
            .lock()
            .remove(name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<CallSession>> {
        self.sessions
            .lock()
            .get(name)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.sessions
            .lock()
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions
            .lock()
            .is_empty()
    }

    /// Names of every live session, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .sessions
            .lock()
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

/// Accepts outbound connections from the switch and runs the call-flow on each.
#[derive(Clone)]
pub struct IvrServer {
    store: Arc<CallFlowStore>,
    interpreter: Arc<Interpreter>,
    registry: Arc<SessionRegistry>,
    options: ServerOptions,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for IvrServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IvrServer")
            .field("listen_addr", &self.options.listen_addr)
            .field("sessions", &self.registry.len())
            .finish()
    }
}

impl IvrServer {
    pub fn new(
        store: Arc<CallFlowStore>,
        persistor: Arc<dyn Persistor>,
        options: ServerOptions,
    ) -> Self {
        let interpreter = Arc::new(Interpreter::new(
            store.clone(),
            persistor,
            options
                .interpreter
                .clone(),
        ));
        Self {
            store,
            interpreter,
            registry: Arc::new(SessionRegistry::new()),
            options,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn options(&self) -> &ServerOptions {
        &self.options
    }

    pub fn store(&self) -> &Arc<CallFlowStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Token that stops [`serve`](Self::serve) when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown
            .clone()
    }

    /// Stop accepting connections. Calls in progress run to completion.
    pub fn shutdown(&self) {
        self.shutdown
            .cancel();
    }

    /// Accept connections until shut down, one task per call.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        info!("Listening for outbound connections on {}", listener.local_addr()?);
        loop {
            let accepted = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("[{}] Cannot set TCP_NODELAY: {}", peer, e);
                    }
                    let server = self.clone();
                    tokio::spawn(async move {
                        let _ = server
                            .handle_connection(stream, peer.to_string())
                            .await;
                    });
                }
                Err(e) => error!("Accept failed: {}", e),
            }
        }
        info!("Server stopped accepting connections");
        Ok(())
    }

    /// Run one call on `stream` from handshake to close.
    ///
    /// The session is registered under `name` while the call-flow runs. A
    /// connection that drops mid-call ends the call as a hangup.
    pub async fn handle_connection<S>(&self, stream: S, name: String) -> IvrResult<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let session = Arc::new(CallSession::new(
            name.clone(),
            self.options
                .connect
                .dtmf_queue_capacity,
        ));
        let conn = EslConnection::spawn(
            stream,
            session.clone(),
            session.engine_stop(),
            self.options
                .connect
                .clone(),
        );

        let channel_id = match conn
            .connect_and_subscribe()
            .await
        {
            Ok(id) => id,
            Err(e) => {
                warn!("[{}] Handshake failed: {}", name, e);
                close(&name, &conn).await;
                return Err(e.into());
            }
        };
        session.set_id(channel_id);
        info!("[{}] New call, channel {}", name, session.id());

        self.registry
            .insert(session.clone());
        let result = tokio::select! {
            biased;
            result = self.interpreter.run(&session, &conn) => result,
            reason = conn.disconnected() => {
                info!("[{}] Connection ended mid-call: {}", name, reason);
                Err(IvrError::ChannelHangup)
            }
        };
        close(&name, &conn).await;
        self.registry
            .remove(&name);

        info!(
            "[{}] Call finished after {}s",
            name,
            (chrono::Local::now() - session.created_at()).num_seconds()
        );
        result
    }
}

async fn close(name: &str, conn: &EslConnection) {
    if let Err(e) = conn
        .close()
        .await
    {
        debug!("[{}] Close: {}", name, e);
    }
}
