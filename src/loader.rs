//! Declarative call-flow documents and hot reload.
//!
//! ```xml
//! <callflow>
//!   <prompts>
//!     <prompt name="welcome" barge-in="true"><phrase>welcome.wav</phrase></prompt>
//!   </prompts>
//!   <grammars>
//!     <grammar name="pin" max-length="4" terminator="#" timeout-ms="5000" pattern="^\d{4}$"/>
//!   </grammars>
//!   <nodes>
//!     <root name="root" next="welcome"/>
//!     <announcement name="welcome" next="exit"><prompt>welcome</prompt></announcement>
//!     <exit name="exit"/>
//!   </nodes>
//! </callflow>
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    callflow::{CallFlow, CallFlowStore, Choice, Node, Prompt},
    constants::{MIN_RELOAD_INTERVAL_MS, NO_INPUT_NODE, NO_MATCH_NODE},
    error::ConfigError,
    grammar::Grammar,
};

#[derive(Debug, Deserialize)]
struct CallFlowDoc {
    #[serde(default)]
    prompts: PromptsDoc,
    #[serde(default)]
    grammars: GrammarsDoc,
    #[serde(default)]
    nodes: NodesDoc,
}

#[derive(Debug, Default, Deserialize)]
struct PromptsDoc {
    #[serde(rename = "prompt", default)]
    items: Vec<PromptDoc>,
}

#[derive(Debug, Deserialize)]
struct PromptDoc {
    #[serde(rename = "@name")]
    name: String,
    #[serde(rename = "@barge-in", default)]
    barge_in: bool,
    #[serde(rename = "phrase", default)]
    phrases: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct GrammarsDoc {
    #[serde(rename = "grammar", default)]
    items: Vec<GrammarDoc>,
}

#[derive(Debug, Deserialize)]
struct GrammarDoc {
    #[serde(rename = "@name")]
    name: String,
    #[serde(rename = "@max-length", default)]
    max_length: usize,
    #[serde(rename = "@terminator", default)]
    terminator: Option<String>,
    #[serde(rename = "@timeout-ms")]
    timeout_ms: u64,
    #[serde(rename = "@pattern")]
    pattern: String,
}

#[derive(Debug, Default, Deserialize)]
struct NodesDoc {
    #[serde(rename = "$value", default)]
    items: Vec<NodeDoc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum NodeDoc {
    Root(RootDoc),
    Announcement(AnnouncementDoc),
    Menu(MenuDoc),
    Goto(GotoDoc),
    PromptCollect(PromptCollectDoc),
    Exit(ExitDoc),
}

#[derive(Debug, Deserialize)]
struct RootDoc {
    #[serde(rename = "@name")]
    name: String,
    #[serde(rename = "@next", default)]
    next: String,
}

#[derive(Debug, Deserialize)]
struct AnnouncementDoc {
    #[serde(rename = "@name")]
    name: String,
    #[serde(rename = "@next", default)]
    next: String,
    #[serde(rename = "prompt", default)]
    prompts: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ChoiceDoc {
    #[serde(rename = "@digit")]
    digit: String,
    #[serde(rename = "@next", default)]
    next: String,
}

#[derive(Debug, Deserialize)]
struct MenuDoc {
    #[serde(rename = "@name")]
    name: String,
    #[serde(rename = "@timeout-ms")]
    timeout_ms: u64,
    #[serde(rename = "@no-input", default)]
    no_input: Option<String>,
    #[serde(rename = "@no-match", default)]
    no_match: Option<String>,
    #[serde(rename = "prompt", default)]
    prompts: Vec<String>,
    #[serde(rename = "choice", default)]
    choices: Vec<ChoiceDoc>,
}

#[derive(Debug, Deserialize)]
struct GotoDoc {
    #[serde(rename = "@name")]
    name: String,
    #[serde(rename = "@next", default)]
    next: String,
    #[serde(rename = "@max-no-input", default)]
    max_no_input: Option<u32>,
    #[serde(rename = "@max-no-match", default)]
    max_no_match: Option<u32>,
    #[serde(rename = "prompt", default)]
    prompts: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct PromptCollectDoc {
    #[serde(rename = "@name")]
    name: String,
    #[serde(rename = "@grammar")]
    grammar: String,
    #[serde(rename = "@next", default)]
    next: String,
    #[serde(rename = "@no-input", default)]
    no_input: Option<String>,
    #[serde(rename = "@no-match", default)]
    no_match: Option<String>,
    #[serde(rename = "prompt", default)]
    prompts: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ExitDoc {
    #[serde(rename = "@name")]
    name: String,
}

fn or_reserved(target: Option<String>, reserved: &str) -> String {
    target
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| reserved.to_string())
}

impl From<NodeDoc> for Node {
    fn from(doc: NodeDoc) -> Self {
        match doc {
            NodeDoc::Root(RootDoc { name, next }) => Node::Root { name, next },
            NodeDoc::Announcement(AnnouncementDoc {
                name,
                next,
                prompts,
            }) => Node::Announcement {
                name,
                prompts,
                next,
            },
            NodeDoc::Menu(m) => Node::Menu {
                name: m.name,
                prompts: m.prompts,
                choices: m
                    .choices
                    .into_iter()
                    .map(|c| Choice {
                        digit: c.digit,
                        next: c.next,
                    })
                    .collect(),
                timeout_ms: m.timeout_ms,
                no_input: or_reserved(m.no_input, NO_INPUT_NODE),
                no_match: or_reserved(m.no_match, NO_MATCH_NODE),
            },
            NodeDoc::Goto(g) => Node::Goto {
                name: g.name,
                prompts: g.prompts,
                next: g.next,
                max_no_input: g.max_no_input,
                max_no_match: g.max_no_match,
            },
            NodeDoc::PromptCollect(p) => Node::PromptCollect {
                name: p.name,
                prompts: p.prompts,
                grammar: p.grammar,
                next: p.next,
                no_input: or_reserved(p.no_input, NO_INPUT_NODE),
                no_match: or_reserved(p.no_match, NO_MATCH_NODE),
            },
            NodeDoc::Exit(ExitDoc { name }) => Node::Exit { name },
        }
    }
}

impl CallFlow {
    /// Parse a call-flow document.
    ///
    /// Every grammar pattern is compiled here; one bad pattern rejects the
    /// whole document. Dangling references are only logged.
    pub fn from_xml(xml: &str) -> Result<CallFlow, ConfigError> {
        let doc: CallFlowDoc = quick_xml::de::from_str(xml)?;

        let mut flow = CallFlow::new();
        for p in doc
            .prompts
            .items
        {
            if p.phrases
                .is_empty()
            {
                warn!("Prompt '{}' has no phrase", p.name);
            }
            flow = flow.with_prompt(Prompt {
                name: p.name,
                barge_in: p.barge_in,
                phrases: p.phrases,
            });
        }

        for g in doc
            .grammars
            .items
        {
            let grammar = Grammar::new(
                g.name
                    .as_str(),
                g.max_length,
                g.terminator
                    .as_deref(),
                Duration::from_millis(g.timeout_ms),
                &g.pattern,
            )
            .map_err(|source| ConfigError::InvalidPattern {
                grammar: g
                    .name
                    .clone(),
                source,
            })?;
            flow = flow.with_grammar(grammar);
        }

        for doc in doc
            .nodes
            .items
        {
            let node = Node::from(doc);
            if flow
                .node(node.name())
                .is_some()
            {
                warn!("Node '{}' defined twice, keeping the last", node.name());
            }
            flow = flow.with_node(node);
        }

        if !flow
            .nodes()
            .any(|n| matches!(n, Node::Root { .. }))
        {
            warn!("Call-flow has no root node");
        }
        for problem in flow.dangling_references() {
            warn!("Call-flow: {}", problem);
        }

        Ok(flow)
    }
}

/// Loads a call-flow file and reloads it when its modification time advances.
#[derive(Debug)]
pub struct CallFlowLoader {
    path: PathBuf,
    last_loaded: Option<SystemTime>,
}

impl CallFlowLoader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last_loaded: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn modified(&self) -> Result<SystemTime, ConfigError> {
        tokio::fs::metadata(&self.path)
            .await
            .and_then(|m| m.modified())
            .map_err(|source| ConfigError::Io {
                path: self
                    .path
                    .clone(),
                source,
            })
    }

    /// Read and parse the file regardless of its modification time.
    pub async fn load(&mut self) -> Result<CallFlow, ConfigError> {
        let modified = self
            .modified()
            .await?;
        // A document that fails to parse is not retried until it changes again.
        self.last_loaded = Some(modified);

        let xml = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| ConfigError::Io {
                path: self
                    .path
                    .clone(),
                source,
            })?;
        let flow = CallFlow::from_xml(&xml)?;
        info!(
            "Loaded call-flow from {} ({} nodes)",
            self.path
                .display(),
            flow.node_count()
        );
        Ok(flow)
    }

    /// Re-parse into `store` if the file changed since the last load.
    ///
    /// Returns `Ok(true)` when a new snapshot was swapped in. On error the
    /// current snapshot stays.
    pub async fn reload_if_changed(&mut self, store: &CallFlowStore) -> Result<bool, ConfigError> {
        let modified = self
            .modified()
            .await?;
        if let Some(last) = self.last_loaded {
            if modified <= last {
                return Ok(false);
            }
        }
        debug!(
            "Call-flow file {} changed, reloading",
            self.path
                .display()
        );
        let flow = self
            .load()
            .await?;
        store.replace(flow);
        Ok(true)
    }
}

/// Poll the call-flow file every `interval` until `shutdown` is cancelled.
///
/// Intervals shorter than 100 ms are raised to 100 ms.
pub fn spawn_reload_task(
    mut loader: CallFlowLoader,
    store: Arc<CallFlowStore>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    let interval = interval.max(Duration::from_millis(MIN_RELOAD_INTERVAL_MS));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match loader
                .reload_if_changed(&store)
                .await
            {
                Ok(true) => info!("Call-flow reloaded"),
                Ok(false) => {}
                Err(e) => error!("Call-flow reload failed, keeping current: {}", e),
            }
        }
        debug!("Call-flow reload task stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r##"
<callflow>
  <prompts>
    <prompt name="welcome" barge-in="true"><phrase>welcome.wav</phrase><phrase>alt.wav</phrase></prompt>
    <prompt name="menu"><phrase>menu.wav</phrase></prompt>
  </prompts>
  <grammars>
    <grammar name="pin" max-length="4" terminator="#" timeout-ms="5000" pattern="^\d{4}$"/>
  </grammars>
  <nodes>
    <root name="root" next="welcome"/>
    <announcement name="welcome" next="main"><prompt>welcome</prompt></announcement>
    <menu name="main" timeout-ms="2000">
      <prompt>menu</prompt>
      <choice digit="1" next="pin"/>
      <choice digit="2" next="exit"/>
    </menu>
    <prompt-collect name="pin" grammar="pin" next="exit" no-match="retry"/>
    <goto name="NoInput" next="exit" max-no-input="3"><prompt>menu</prompt></goto>
    <goto name="retry" next="exit" max-no-match="2"/>
    <exit name="exit"/>
  </nodes>
</callflow>
"##;

    fn write_file(dir: &tempfile::TempDir, contents: &str) -> PathBuf {
        let path = dir
            .path()
            .join("callflow.xml");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes())
            .unwrap();
        path
    }

    fn bump_mtime(path: &Path, secs: u64) {
        let file = std::fs::OpenOptions::new()
            .write(true)
            .open(path)
            .unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(secs))
            .unwrap();
    }

    #[test]
    fn parses_every_node_kind() {
        let flow = CallFlow::from_xml(SAMPLE).unwrap();
        assert_eq!(flow.node_count(), 7);

        assert_eq!(
            flow.node("root"),
            Some(&Node::Root {
                name: "root".into(),
                next: "welcome".into()
            })
        );
        match flow.node("main") {
            Some(Node::Menu {
                prompts,
                choices,
                timeout_ms,
                no_input,
                no_match,
                ..
            }) => {
                assert_eq!(prompts, &vec!["menu".to_string()]);
                assert_eq!(choices.len(), 2);
                assert_eq!(choices[0].digit, "1");
                assert_eq!(choices[0].next, "pin");
                assert_eq!(*timeout_ms, 2000);
                assert_eq!(no_input, "NoInput");
                assert_eq!(no_match, "NoMatch");
            }
            other => panic!("unexpected node {:?}", other),
        }
        match flow.node("pin") {
            Some(Node::PromptCollect {
                grammar,
                no_input,
                no_match,
                prompts,
                ..
            }) => {
                assert_eq!(grammar, "pin");
                assert_eq!(no_input, "NoInput");
                assert_eq!(no_match, "retry");
                assert!(prompts.is_empty());
            }
            other => panic!("unexpected node {:?}", other),
        }
        assert_eq!(
            flow.node("NoInput"),
            Some(&Node::Goto {
                name: "NoInput".into(),
                prompts: vec!["menu".into()],
                next: "exit".into(),
                max_no_input: Some(3),
                max_no_match: None,
            })
        );
        assert_eq!(
            flow.node("exit"),
            Some(&Node::Exit {
                name: "exit".into()
            })
        );
    }

    #[test]
    fn parses_prompts_and_grammars() {
        let flow = CallFlow::from_xml(SAMPLE).unwrap();

        let welcome = flow
            .prompt("welcome")
            .unwrap();
        assert!(welcome.barge_in);
        assert_eq!(welcome.phrases, vec!["welcome.wav", "alt.wav"]);
        assert!(
            !flow
                .prompt("menu")
                .unwrap()
                .barge_in
        );

        let pin = flow
            .grammar("pin")
            .unwrap();
        assert_eq!(pin.max_length, 4);
        assert_eq!(pin.terminator.as_deref(), Some("#"));
        assert_eq!(pin.timeout, Duration::from_millis(5000));
        assert!(pin.validate("1234"));
    }

    #[test]
    fn invalid_pattern_rejects_document() {
        let xml = r#"<callflow><grammars>
            <grammar name="bad" max-length="2" timeout-ms="100" pattern="(["/>
        </grammars></callflow>"#;
        match CallFlow::from_xml(xml) {
            Err(ConfigError::InvalidPattern { grammar, .. }) => assert_eq!(grammar, "bad"),
            other => panic!("expected invalid pattern, got {:?}", other),
        }
    }

    #[test]
    fn malformed_document_is_rejected() {
        assert!(matches!(
            CallFlow::from_xml("<callflow><nodes><menu name=\"m\"/></nodes></callflow>"),
            Err(ConfigError::Xml(_))
        ));
    }

    #[test]
    fn empty_document_is_empty_flow() {
        let flow = CallFlow::from_xml("<callflow/>").unwrap();
        assert_eq!(flow.node_count(), 0);
    }

    #[tokio::test]
    async fn reload_only_when_modified() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, SAMPLE);

        let mut loader = CallFlowLoader::new(&path);
        let store = CallFlowStore::new(
            loader
                .load()
                .await
                .unwrap(),
        );
        assert_eq!(
            store
                .snapshot()
                .node_count(),
            7
        );
        assert!(!loader
            .reload_if_changed(&store)
            .await
            .unwrap());

        write_file(
            &dir,
            r#"<callflow><nodes><root name="root" next=""/></nodes></callflow>"#,
        );
        bump_mtime(&path, 10);

        assert!(loader
            .reload_if_changed(&store)
            .await
            .unwrap());
        assert_eq!(
            store
                .snapshot()
                .node_count(),
            1
        );
    }

    #[tokio::test]
    async fn failed_reload_keeps_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, SAMPLE);

        let mut loader = CallFlowLoader::new(&path);
        let store = CallFlowStore::new(
            loader
                .load()
                .await
                .unwrap(),
        );

        write_file(&dir, "<callflow><grammars><grammar name=\"g\" timeout-ms=\"1\" pattern=\"(\"/></grammars></callflow>");
        bump_mtime(&path, 10);

        assert!(loader
            .reload_if_changed(&store)
            .await
            .is_err());
        assert_eq!(
            store
                .snapshot()
                .node_count(),
            7
        );
        // Not retried until the file changes again.
        assert!(!loader
            .reload_if_changed(&store)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn reload_task_accepts_zero_interval() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, SAMPLE);

        let mut loader = CallFlowLoader::new(&path);
        let store = Arc::new(CallFlowStore::new(
            loader
                .load()
                .await
                .unwrap(),
        ));
        let shutdown = CancellationToken::new();
        let task = spawn_reload_task(loader, store.clone(), Duration::ZERO, shutdown.clone());

        write_file(
            &dir,
            r#"<callflow><nodes><root name="root" next=""/></nodes></callflow>"#,
        );
        bump_mtime(&path, 10);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        while store
            .snapshot()
            .node_count()
            != 1
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(
            store
                .snapshot()
                .node_count(),
            1
        );

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut loader = CallFlowLoader::new(
            dir.path()
                .join("absent.xml"),
        );
        assert!(matches!(
            loader
                .load()
                .await,
            Err(ConfigError::Io { .. })
        ));
    }
}
