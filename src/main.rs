use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use freeswitch_ivr_tokio::{
    spawn_reload_task, CallFlowLoader, CallFlowStore, EslConnectOptions, InterpreterOptions,
    IvrServer, JsonLinesPersistor, LogPersistor, Persistor, ServerOptions,
};

#[derive(Debug, Parser)]
#[command(name = "fs-ivr", about = "FreeSWITCH outbound socket IVR server")]
struct Args {
    /// Address FreeSWITCH connects to (the `socket` dialplan target).
    #[arg(long, env = "IVR_LISTEN", default_value = "0.0.0.0:8084")]
    listen: SocketAddr,

    /// Call-flow XML definition.
    #[arg(long, env = "IVR_CALLFLOW", default_value = "callflow.xml")]
    callflow: PathBuf,

    /// Seconds between call-flow file change checks.
    #[arg(long, env = "IVR_RELOAD_SECS", default_value_t = 5)]
    reload_secs: u64,

    /// Directory prompt phrases are played from.
    #[arg(long, env = "IVR_SOUND_ROOT", default_value = "/opt/Dev/IVR/sound/")]
    sound_root: String,

    /// Command reply timeout in milliseconds.
    #[arg(long, env = "IVR_COMMAND_TIMEOUT_MS", default_value_t = 3000)]
    command_timeout_ms: u64,

    /// Node each call starts on.
    #[arg(long, default_value = "root")]
    start_node: String,

    /// Append node visits to this JSON-lines file instead of logging them.
    #[arg(long, env = "IVR_VISITS")]
    visits: Option<PathBuf>,
}

impl Args {
    fn server_options(&self) -> ServerOptions {
        ServerOptions {
            listen_addr: self.listen,
            callflow_path: self
                .callflow
                .clone(),
            reload_interval: Duration::from_secs(self.reload_secs.max(1)),
            connect: EslConnectOptions {
                command_timeout: Duration::from_millis(self.command_timeout_ms),
                sound_root: self
                    .sound_root
                    .clone(),
                ..Default::default()
            },
            interpreter: InterpreterOptions {
                start_node: self
                    .start_node
                    .clone(),
                ..Default::default()
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "freeswitch_ivr_tokio=info,fs_ivr=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let options = args.server_options();

    let mut loader = CallFlowLoader::new(&options.callflow_path);
    let flow = loader
        .load()
        .await?;
    let store = Arc::new(CallFlowStore::new(flow));

    let persistor: Arc<dyn Persistor> = match &args.visits {
        Some(path) => Arc::new(JsonLinesPersistor::spawn(path)),
        None => Arc::new(LogPersistor),
    };

    let server = IvrServer::new(store.clone(), persistor, options.clone());
    let reload = spawn_reload_task(
        loader,
        store,
        options.reload_interval,
        server.shutdown_token(),
    );

    let listener = TcpListener::bind(options.listen_addr).await?;
    let serving = {
        let server = server.clone();
        tokio::spawn(async move { server.serve(listener).await })
    };

    tokio::signal::ctrl_c().await?;
    info!("Interrupted, shutting down");
    server.shutdown();

    match serving.await {
        Ok(Err(e)) => error!("Server failed: {}", e),
        Err(e) => error!("Server task failed: {}", e),
        Ok(Ok(())) => {}
    }
    let _ = reload.await;
    Ok(())
}
