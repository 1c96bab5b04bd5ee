//! End-to-end calls against a scripted switch.
//!
//! Each test plays the switch side of one outbound connection over an
//! in-memory duplex stream (or a loopback TCP socket), answering commands in
//! the order the call-flow issues them.

use std::sync::Arc;
use std::time::Duration;

use freeswitch_ivr_tokio::{
    CallFlow, CallFlowStore, EslConnectOptions, EslError, InterpreterOptions, IvrError,
    IvrServer, NodeVisit, Persistor, ServerOptions,
};
use parking_lot::Mutex;
use serde_json::json;
use tokio::io::{duplex, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const CALL_ID: &str = "call-1";

const CALL_FLOW: &str = r##"
<callflow>
  <prompts>
    <prompt name="welcome"><phrase>welcome.wav</phrase></prompt>
    <prompt name="menu" barge-in="true"><phrase>menu.wav</phrase></prompt>
  </prompts>
  <grammars>
    <grammar name="pin" max-length="4" terminator="#" timeout-ms="500" pattern="^\d{4}$"/>
  </grammars>
  <nodes>
    <root name="root" next="welcome"/>
    <announcement name="welcome" next="main"><prompt>welcome</prompt></announcement>
    <menu name="main" timeout-ms="200">
      <prompt>menu</prompt>
      <choice digit="1" next="pin"/>
      <choice digit="9" next="exit"/>
    </menu>
    <prompt-collect name="pin" grammar="pin" next="exit"/>
    <goto name="NoInput" next="exit" max-no-input="2"/>
    <goto name="NoMatch" next="exit" max-no-match="2"/>
    <exit name="exit"/>
  </nodes>
</callflow>
"##;

#[derive(Default)]
struct Visits(Mutex<Vec<NodeVisit>>);

impl Persistor for Visits {
    fn persist(&self, visit: NodeVisit) {
        self.0
            .lock()
            .push(visit);
    }
}

impl Visits {
    fn nodes(&self) -> Vec<String> {
        self.0
            .lock()
            .iter()
            .map(|v| v.active_node.clone())
            .collect()
    }
}

fn server(visits: Arc<Visits>) -> IvrServer {
    let flow = CallFlow::from_xml(CALL_FLOW).expect("call-flow should parse");
    IvrServer::new(
        Arc::new(CallFlowStore::new(flow)),
        visits,
        ServerOptions {
            connect: EslConnectOptions {
                command_timeout: Duration::from_secs(2),
                sound_root: "/snd/".to_string(),
                ..Default::default()
            },
            interpreter: InterpreterOptions {
                settle_delay: Duration::from_millis(10),
                ..Default::default()
            },
            ..Default::default()
        },
    )
}

/// Switch side of one connection.
struct Switch<S> {
    stream: S,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Switch<S> {
    async fn command(&mut self) -> String {
        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        let read = async {
            while !buf.ends_with(b"\n\n") {
                let n = self
                    .stream
                    .read(&mut byte)
                    .await
                    .expect("read failed");
                assert_eq!(n, 1, "connection closed while waiting for a command");
                buf.push(byte[0]);
            }
        };
        tokio::time::timeout(Duration::from_secs(3), read)
            .await
            .expect("timed out waiting for a command");

        let text = String::from_utf8(buf).unwrap();
        let header = |name: &str| {
            text.lines()
                .find_map(|l| l.strip_prefix(name))
                .map(str::to_string)
        };
        match header("execute-app-name: ") {
            Some(app) => {
                assert!(text.starts_with("sendmsg\ncall-command: execute\n"));
                assert!(text.contains("event-lock: true\n"));
                match header("execute-app-arg: ") {
                    Some(arg) => format!("{} {}", app, arg),
                    None => app,
                }
            }
            None => text
                .trim_end()
                .to_string(),
        }
    }

    async fn send(&mut self, data: &str) {
        self.stream
            .write_all(data.as_bytes())
            .await
            .unwrap();
    }

    async fn reply(&mut self, text: &str) {
        self.send(&format!("Content-Type: command/reply\nReply-Text: {}\n\n", text))
            .await;
    }

    async fn event(&mut self, event: serde_json::Value) {
        let body = event.to_string();
        self.send(&format!(
            "Content-Type: text/event-json\nContent-Length: {}\n\n{}",
            body.len(),
            body
        ))
        .await;
    }

    async fn call_event(&mut self, name: &str) {
        self.event(json!({"Event-Name": name, "Channel-Call-UUID": CALL_ID}))
            .await;
    }

    async fn dtmf(&mut self, digits: &str) {
        for d in digits.chars() {
            self.event(json!({
                "Event-Name": "DTMF",
                "Channel-Call-UUID": CALL_ID,
                "DTMF-Digit": d.to_string(),
            }))
            .await;
        }
    }

    async fn disconnect(&mut self) {
        let body = "Disconnected, goodbye.\n";
        self.send(&format!(
            "Content-Type: text/disconnect-notice\nControlled-Session-UUID: {}\nContent-Length: {}\n\n{}",
            CALL_ID,
            body.len(),
            body
        ))
        .await;
    }

    async fn expect(&mut self, expected: &str) {
        assert_eq!(self.command().await, expected);
        self.reply("+OK")
            .await;
    }

    async fn handshake(&mut self) {
        assert_eq!(self.command().await, "connect");
        self.send(&format!(
            "Content-Type: command/reply\nReply-Text: +OK\nChannel-Unique-ID: {}\n\n",
            CALL_ID
        ))
        .await;
        self.expect("event json PLAYBACK_START PLAYBACK_STOP DTMF CHANNEL_ANSWER")
            .await;
    }

    async fn answer(&mut self) {
        self.expect("answer")
            .await;
        self.event(json!({
            "Event-Name": "CHANNEL_ANSWER",
            "Channel-Call-UUID": CALL_ID,
            "Unique-ID": "leg-a",
            "Caller-Orig-Caller-ID-Number": "5551000",
            "Caller-Destination-Number": "8000",
        }))
        .await;
    }

    async fn play(&mut self, prompt: &str, barge_in: bool) {
        let terminators = if barge_in { "any" } else { "none" };
        self.expect(&format!("set playback_terminators={}", terminators))
            .await;
        self.expect(&format!(
            "playback {{var1={},var2={}}}/snd/{}.wav",
            prompt, CALL_ID, prompt
        ))
        .await;
        self.call_event("PLAYBACK_STOP")
            .await;
    }

    async fn enter_menu(&mut self) {
        self.play("menu", true)
            .await;
        self.expect("start_dtmf")
            .await;
    }
}

async fn run_call(
    server: &IvrServer,
    script: impl std::future::Future<Output = ()> + Send + 'static,
    local: tokio::io::DuplexStream,
) -> Result<(), IvrError> {
    let switch = tokio::spawn(script);
    let result = server
        .handle_connection(local, "10.0.0.5:40000".to_string())
        .await;
    switch
        .await
        .expect("switch script failed");
    result
}

#[tokio::test]
async fn menu_then_pin_entry() {
    let visits = Arc::new(Visits::default());
    let server = server(visits.clone());
    let (local, peer) = duplex(64 * 1024);
    let registry = server
        .registry()
        .clone();

    let script = async move {
        let mut sw = Switch { stream: peer };
        sw.handshake()
            .await;
        sw.answer()
            .await;
        sw.play("welcome", false)
            .await;

        let session = registry
            .get("10.0.0.5:40000")
            .expect("session registered");
        assert_eq!(session.param("ANI").as_deref(), Some("5551000"));
        assert_eq!(session.param("DNIS").as_deref(), Some("8000"));

        sw.enter_menu()
            .await;
        sw.dtmf("1")
            .await;
        sw.expect("stop_dtmf")
            .await;

        sw.expect("start_dtmf")
            .await;
        sw.dtmf("1234")
            .await;
        sw.expect("stop_dtmf")
            .await;
        sw.expect("hangup")
            .await;
        assert_eq!(session.collected_value().as_deref(), Some("1234"));
        sw.disconnect()
            .await;
    };

    run_call(&server, script, local)
        .await
        .unwrap();
    assert_eq!(
        visits.nodes(),
        vec!["root", "welcome", "main", "pin", "exit"]
    );
    assert!(visits
        .0
        .lock()
        .iter()
        .all(|v| v.session_id == CALL_ID));
    assert!(server
        .registry()
        .is_empty());
}

#[tokio::test]
async fn silent_caller_retries_menu_then_exits() {
    let visits = Arc::new(Visits::default());
    let server = server(visits.clone());
    let (local, peer) = duplex(64 * 1024);

    let script = async move {
        let mut sw = Switch { stream: peer };
        sw.handshake()
            .await;
        sw.answer()
            .await;
        sw.play("welcome", false)
            .await;
        for _ in 0..2 {
            sw.enter_menu()
                .await;
            // Menu times out on its own.
            sw.expect("stop_dtmf")
                .await;
        }
        sw.expect("hangup")
            .await;
    };

    run_call(&server, script, local)
        .await
        .unwrap();
    assert_eq!(
        visits.nodes(),
        // The goto node does not become active, so its visits show the menu.
        vec!["root", "welcome", "main", "main", "main", "main", "exit"]
    );
}

#[tokio::test]
async fn wrong_pin_goes_to_no_match() {
    let visits = Arc::new(Visits::default());
    let server = server(visits.clone());
    let (local, peer) = duplex(64 * 1024);

    let script = async move {
        let mut sw = Switch { stream: peer };
        sw.handshake()
            .await;
        sw.answer()
            .await;
        sw.play("welcome", false)
            .await;
        sw.enter_menu()
            .await;
        sw.dtmf("1")
            .await;
        sw.expect("stop_dtmf")
            .await;

        // "12#" fails the grammar; the goto retries the pin node.
        sw.expect("start_dtmf")
            .await;
        sw.dtmf("12#")
            .await;
        sw.expect("stop_dtmf")
            .await;
        sw.expect("start_dtmf")
            .await;
        sw.dtmf("9#")
            .await;
        sw.expect("stop_dtmf")
            .await;
        sw.expect("hangup")
            .await;
    };

    run_call(&server, script, local)
        .await
        .unwrap();
    assert_eq!(
        visits.nodes(),
        vec!["root", "welcome", "main", "pin", "pin", "pin", "pin", "exit"]
    );
}

#[tokio::test]
async fn hangup_during_menu_ends_call() {
    let visits = Arc::new(Visits::default());
    let server = server(visits.clone());
    let (local, peer) = duplex(64 * 1024);

    let script = async move {
        let mut sw = Switch { stream: peer };
        sw.handshake()
            .await;
        sw.answer()
            .await;
        sw.play("welcome", false)
            .await;
        sw.enter_menu()
            .await;
        sw.disconnect()
            .await;
    };

    let result = run_call(&server, script, local).await;
    assert!(matches!(result, Err(IvrError::ChannelHangup)));
    assert_eq!(visits.nodes(), vec!["root", "welcome", "main"]);
    assert!(server
        .registry()
        .is_empty());
}

#[tokio::test]
async fn dropped_connection_ends_call() {
    let visits = Arc::new(Visits::default());
    let server = server(visits.clone());
    let (local, peer) = duplex(64 * 1024);

    let script = async move {
        let mut sw = Switch { stream: peer };
        sw.handshake()
            .await;
        sw.answer()
            .await;
        sw.play("welcome", false)
            .await;
        sw.enter_menu()
            .await;
        drop(sw);
    };

    let result = run_call(&server, script, local).await;
    assert!(matches!(result, Err(IvrError::ChannelHangup)));
    assert!(server
        .registry()
        .is_empty());
}

#[tokio::test]
async fn rejected_answer_halts_call() {
    let visits = Arc::new(Visits::default());
    let server = server(visits.clone());
    let (local, peer) = duplex(64 * 1024);

    let script = async move {
        let mut sw = Switch { stream: peer };
        sw.handshake()
            .await;
        assert_eq!(sw.command().await, "answer");
        sw.reply("-ERR no such channel")
            .await;
    };

    let result = run_call(&server, script, local).await;
    match result {
        Err(IvrError::Esl(EslError::CommandRejected { reply_text })) => {
            assert_eq!(reply_text, "-ERR no such channel");
        }
        other => panic!("expected rejected command, got {:?}", other),
    }
    assert_eq!(visits.nodes(), vec!["root"]);
}

#[tokio::test]
async fn serves_calls_over_tcp() {
    let visits = Arc::new(Visits::default());
    let server = server(visits.clone());
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap();
    let addr = listener
        .local_addr()
        .unwrap();
    let serving = {
        let server = server.clone();
        tokio::spawn(async move { server.serve(listener).await })
    };

    let mut sw = Switch {
        stream: TcpStream::connect(addr)
            .await
            .unwrap(),
    };
    sw.handshake()
        .await;
    sw.answer()
        .await;
    sw.play("welcome", false)
        .await;
    sw.enter_menu()
        .await;
    sw.dtmf("9")
        .await;
    sw.expect("stop_dtmf")
        .await;
    sw.expect("hangup")
        .await;
    sw.disconnect()
        .await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while visits
        .nodes()
        .len()
        < 4
        && tokio::time::Instant::now() < deadline
    {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(visits.nodes(), vec!["root", "welcome", "main", "exit"]);

    server.shutdown();
    tokio::time::timeout(Duration::from_secs(2), serving)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}
