//! Audit trail of visited nodes.

use std::path::{Path, PathBuf};

use chrono::Local;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::channel::CallSession;

const VISIT_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// One node execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeVisit {
    /// Fresh random id for the record.
    pub id: String,
    pub active_node: String,
    /// Local time, millisecond precision.
    pub timestamp: String,
    pub session_id: String,
}

impl NodeVisit {
    /// Record the session's current position.
    pub fn capture(session: &CallSession) -> Self {
        Self {
            id: uuid::Uuid::new_v4()
                .simple()
                .to_string(),
            active_node: session.active_node(),
            timestamp: Local::now()
                .format(VISIT_TIMESTAMP_FORMAT)
                .to_string(),
            session_id: session.id(),
        }
    }
}

/// Receiver of node visits.
///
/// Fire-and-forget: implementations must not block the call and report
/// their own failures.
pub trait Persistor: Send + Sync {
    fn persist(&self, visit: NodeVisit);
}

/// Logs each visit at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogPersistor;

impl Persistor for LogPersistor {
    fn persist(&self, visit: NodeVisit) {
        debug!(
            "Visit {} node={} session={} at {}",
            visit.id, visit.active_node, visit.session_id, visit.timestamp
        );
    }
}

/// Appends each visit as one JSON object per line.
///
/// Writes happen on a background task; `persist` only queues.
#[derive(Debug, Clone)]
pub struct JsonLinesPersistor {
    tx: mpsc::UnboundedSender<NodeVisit>,
    path: PathBuf,
}

impl JsonLinesPersistor {
    /// Start the writer task. Must be called inside a tokio runtime.
    ///
    /// The task ends once every handle is dropped and the queue is flushed.
    pub fn spawn(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_visits(path.clone(), rx));
        Self { tx, path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Persistor for JsonLinesPersistor {
    fn persist(&self, visit: NodeVisit) {
        if self
            .tx
            .send(visit)
            .is_err()
        {
            warn!("Visit writer for {} has stopped", self.path.display());
        }
    }
}

async fn write_visits(path: PathBuf, mut rx: mpsc::UnboundedReceiver<NodeVisit>) {
    let mut file = match tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await
    {
        Ok(file) => file,
        Err(e) => {
            warn!("Cannot open visit log {}: {}", path.display(), e);
            // Keep draining so senders never see a closed queue.
            while rx
                .recv()
                .await
                .is_some()
            {}
            return;
        }
    };
    info!("Writing node visits to {}", path.display());

    while let Some(visit) = rx
        .recv()
        .await
    {
        let mut line = match serde_json::to_string(&visit) {
            Ok(line) => line,
            Err(e) => {
                warn!("Cannot encode visit {}: {}", visit.id, e);
                continue;
            }
        };
        line.push('\n');
        let written = async {
            file.write_all(line.as_bytes())
                .await?;
            file.flush()
                .await
        }
        .await;
        if let Err(e) = written {
            warn!("Cannot write visit {}: {}", visit.id, e);
        }
    }
}
