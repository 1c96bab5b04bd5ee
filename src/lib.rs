//! FreeSWITCH outbound event socket IVR server
//!
//! The switch connects to this server once per call (the `socket` dialplan
//! application). Each connection gets its own protocol engine, call session
//! and call-flow interpreter.
//!
//! # Architecture
//!
//! - [`EslConnection`] (Clone + Send) sends commands one at a time and waits
//!   for each reply; a background reader task decodes replies and events.
//! - [`CallSession`] receives events through [`EventDispatcher`] and exposes
//!   the DTMF, playback-finished and hangup signals nodes wait on.
//! - [`Interpreter`] walks the [`CallFlow`] graph node by node.
//! - [`IvrServer`] accepts connections and ties the three together.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use freeswitch_ivr_tokio::{
//!     CallFlowLoader, CallFlowStore, IvrServer, LogPersistor, ServerOptions,
//! };
//! use tokio::net::TcpListener;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let options = ServerOptions::default();
//!     let flow = CallFlowLoader::new(&options.callflow_path)
//!         .load()
//!         .await?;
//!
//!     let server = IvrServer::new(
//!         Arc::new(CallFlowStore::new(flow)),
//!         Arc::new(LogPersistor),
//!         options.clone(),
//!     );
//!     server
//!         .serve(TcpListener::bind(options.listen_addr).await?)
//!         .await?;
//!     Ok(())
//! }
//! ```
//!
//! Configure FreeSWITCH to connect to the server:
//! ```xml
//! <action application="socket" data="127.0.0.1:8084 async full"/>
//! ```

#[macro_use]
mod macros;

pub mod callflow;
pub mod channel;
pub mod connection;
pub mod error;
pub mod event;
pub mod grammar;
pub mod headers;
pub mod ivr;
pub mod loader;
pub mod persist;
pub mod server;
pub mod timer;

pub(crate) mod buffer;
pub(crate) mod command;
pub mod constants;
pub(crate) mod protocol;

pub use callflow::{CallFlow, CallFlowStore, Choice, Node, Prompt};
pub use channel::{CallSession, ParseSessionStateError, SessionState};
pub use command::{CommandBuilder, EslResponse};
pub use connection::{
    ConnectionStatus, DisconnectReason, EslConnectOptions, EslConnection, EventDispatcher,
};
pub use constants::DEFAULT_LISTEN_PORT;
pub use error::{ConfigError, EslError, EslResult, IvrError, IvrResult};
pub use event::{EslEvent, EslEventType, ParseEventTypeError};
pub use grammar::Grammar;
pub use headers::{EventHeader, ParseEventHeaderError};
pub use ivr::{Interpreter, InterpreterOptions};
pub use loader::{spawn_reload_task, CallFlowLoader};
pub use persist::{JsonLinesPersistor, LogPersistor, NodeVisit, Persistor};
pub use server::{IvrServer, ServerOptions, SessionRegistry};
pub use timer::Deadline;
