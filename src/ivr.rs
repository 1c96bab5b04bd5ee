//! Call-flow interpreter

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::{
    callflow::{CallFlow, CallFlowStore, Choice, Node},
    channel::{CallSession, SessionState},
    connection::EslConnection,
    constants::{DEFAULT_SETTLE_DELAY_MS, DEFAULT_START_NODE},
    error::{IvrError, IvrResult},
    grammar::Grammar,
    persist::{NodeVisit, Persistor},
    timer::Deadline,
};

/// Interpreter settings.
#[derive(Debug, Clone)]
pub struct InterpreterOptions {
    /// Node a new call starts on. Default: `root`.
    pub start_node: String,
    /// Pause after answering. Default: 1000 ms.
    pub settle_delay: Duration,
    /// Give up waiting for `PLAYBACK_STOP` after this long. Default: wait forever.
    pub playback_timeout: Option<Duration>,
}

impl Default for InterpreterOptions {
    fn default() -> Self {
        Self {
            start_node: DEFAULT_START_NODE.to_string(),
            settle_delay: Duration::from_millis(DEFAULT_SETTLE_DELAY_MS),
            playback_timeout: None,
        }
    }
}

/// Runs call-flows against sessions.
///
/// One interpreter serves every call; each node reads the snapshot current
/// when it starts, so a reload takes effect at the next node.
pub struct Interpreter {
    store: Arc<CallFlowStore>,
    persistor: Arc<dyn Persistor>,
    options: InterpreterOptions,
}

impl Interpreter {
    pub fn new(
        store: Arc<CallFlowStore>,
        persistor: Arc<dyn Persistor>,
        options: InterpreterOptions,
    ) -> Self {
        Self {
            store,
            persistor,
            options,
        }
    }

    pub fn options(&self) -> &InterpreterOptions {
        &self.options
    }

    /// Run the call-flow from the configured start node.
    pub async fn run(&self, session: &CallSession, conn: &EslConnection) -> IvrResult<()> {
        self.run_from(&self.options.start_node, session, conn)
            .await
    }

    /// Run nodes until one returns no next node or fails.
    ///
    /// A visit is persisted after every node execution, failed ones included.
    pub async fn run_from(
        &self,
        start: &str,
        session: &CallSession,
        conn: &EslConnection,
    ) -> IvrResult<()> {
        let mut current = start.to_string();
        loop {
            let flow = self
                .store
                .snapshot();
            let Some(node) = flow.node(&current) else {
                error!("[{}] Node '{}' not found", session.name(), current);
                return Err(IvrError::NodeNotFound(current));
            };

            debug!(
                "[{}] Executing {} node '{}'",
                session.name(),
                node.kind(),
                current
            );
            let result = self
                .execute_node(node, &flow, session, conn)
                .await;
            self.persistor
                .persist(NodeVisit::capture(session));

            match result {
                Ok(next) if next.is_empty() => {
                    info!("[{}] Call-flow end at '{}'", session.name(), current);
                    return Ok(());
                }
                Ok(next) => current = next,
                Err(IvrError::ChannelHangup) => {
                    info!("[{}] Call hung up in node '{}'", session.name(), current);
                    return Err(IvrError::ChannelHangup);
                }
                Err(e) => {
                    error!("[{}] Node '{}' failed: {}", session.name(), current, e);
                    return Err(e);
                }
            }
        }
    }

    /// Execute one node and return the name of the next one ("" to stop).
    ///
    /// A command that fails because the call hung up mid-command reports
    /// [`IvrError::ChannelHangup`], not the engine error.
    pub async fn execute_node(
        &self,
        node: &Node,
        flow: &CallFlow,
        session: &CallSession,
        conn: &EslConnection,
    ) -> IvrResult<String> {
        if session.state() == SessionState::Hangup {
            return Err(IvrError::ChannelHangup);
        }

        match self
            .run_node(node, flow, session, conn)
            .await
        {
            Err(IvrError::Esl(e)) if session.is_hung_up() => {
                debug!("[{}] Command cut short by hangup: {}", session.name(), e);
                Err(IvrError::ChannelHangup)
            }
            other => other,
        }
    }

    async fn run_node(
        &self,
        node: &Node,
        flow: &CallFlow,
        session: &CallSession,
        conn: &EslConnection,
    ) -> IvrResult<String> {
        match node {
            Node::Root { name, next } => {
                session.set_active_node(name);
                conn.answer()
                    .await?;
                tokio::select! {
                    _ = tokio::time::sleep(self.options.settle_delay) => {}
                    _ = session.hung_up() => return Err(IvrError::ChannelHangup),
                }
                Ok(next.clone())
            }
            Node::Announcement {
                name,
                prompts,
                next,
            } => {
                session.set_active_node(name);
                session
                    .drain_dtmf()
                    .await;
                self.play_prompts(flow, prompts, session, conn)
                    .await?;
                Ok(next.clone())
            }
            Node::Menu {
                name,
                prompts,
                choices,
                timeout_ms,
                no_input,
                no_match,
            } => {
                session.set_active_node(name);
                session
                    .drain_dtmf()
                    .await;
                self.play_prompts(flow, prompts, session, conn)
                    .await?;

                conn.start_dtmf()
                    .await?;
                let outcome = wait_menu_choice(
                    session,
                    choices,
                    *timeout_ms,
                    no_input,
                    no_match,
                )
                .await;
                stop_dtmf(session, conn).await;
                outcome
            }
            Node::Goto {
                name,
                prompts,
                next,
                max_no_input,
                max_no_match,
            } => {
                session
                    .drain_dtmf()
                    .await;
                self.play_prompts(flow, prompts, session, conn)
                    .await?;

                let no_input = session.no_input_count();
                let no_match = session.no_match_count();
                if max_no_input.is_some_and(|max| no_input >= max)
                    || max_no_match.is_some_and(|max| no_match >= max)
                {
                    info!(
                        "[{}] Goto '{}' gives up after no-input={} no-match={}",
                        session.name(),
                        name,
                        no_input,
                        no_match
                    );
                    return Ok(next.clone());
                }
                // Retry whatever node sent us here.
                Ok(session.active_node())
            }
            Node::PromptCollect {
                name,
                prompts,
                grammar,
                next,
                no_input,
                no_match,
            } => {
                let Some(grammar) = flow.grammar(grammar) else {
                    return Err(IvrError::GrammarNotFound {
                        grammar: grammar.clone(),
                        node: name.clone(),
                    });
                };
                session.set_active_node(name);
                session
                    .drain_dtmf()
                    .await;
                self.play_prompts(flow, prompts, session, conn)
                    .await?;

                conn.start_dtmf()
                    .await?;
                let collected = collect_digits(session, grammar).await;
                stop_dtmf(session, conn).await;
                let digits = collected?;

                if digits.is_empty() {
                    let count = session.record_no_input();
                    info!("[{}] No input in '{}' ({})", session.name(), name, count);
                    return Ok(no_input.clone());
                }
                if grammar.validate(&digits) {
                    debug!("[{}] Collected '{}' in '{}'", session.name(), digits, name);
                    session.set_collected_value(digits);
                    Ok(next.clone())
                } else {
                    let count = session.record_no_match();
                    info!(
                        "[{}] '{}' does not match grammar '{}' ({})",
                        session.name(),
                        digits,
                        grammar.name,
                        count
                    );
                    Ok(no_match.clone())
                }
            }
            Node::Exit { name } => {
                session.set_active_node(name);
                conn.hangup()
                    .await?;
                Ok(String::new())
            }
        }
    }

    /// Play each prompt in order, waiting for each to finish.
    async fn play_prompts(
        &self,
        flow: &CallFlow,
        prompts: &[String],
        session: &CallSession,
        conn: &EslConnection,
    ) -> IvrResult<()> {
        for prompt_name in prompts {
            let Some(prompt) = flow.prompt(prompt_name) else {
                warn!("[{}] Prompt '{}' not found", session.name(), prompt_name);
                continue;
            };
            let Some(phrase) = prompt
                .phrases
                .first()
            else {
                warn!("[{}] Prompt '{}' has no phrase", session.name(), prompt_name);
                continue;
            };

            if let Err(e) = conn
                .set_barge_in(prompt.barge_in)
                .await
            {
                if session.is_hung_up() {
                    return Err(IvrError::ChannelHangup);
                }
                warn!(
                    "[{}] Cannot set barge-in for '{}', playing anyway: {}",
                    session.name(),
                    prompt_name,
                    e
                );
            }
            session
                .clear_playback_finished()
                .await;
            conn.play_announcement(phrase, &prompt.name, &session.id())
                .await?;
            self.wait_playback(session, prompt_name)
                .await?;
        }
        Ok(())
    }

    async fn wait_playback(&self, session: &CallSession, prompt_name: &str) -> IvrResult<()> {
        let finished = async {
            match self
                .options
                .playback_timeout
            {
                Some(limit) => {
                    if tokio::time::timeout(limit, session.wait_playback_finished())
                        .await
                        .is_err()
                    {
                        warn!(
                            "[{}] No PLAYBACK_STOP for '{}' within {:?}, continuing",
                            session.name(),
                            prompt_name,
                            limit
                        );
                    }
                }
                None => {
                    session
                        .wait_playback_finished()
                        .await
                }
            }
        };
        tokio::select! {
            _ = finished => Ok(()),
            _ = session.hung_up() => Err(IvrError::ChannelHangup),
        }
    }
}

async fn stop_dtmf(session: &CallSession, conn: &EslConnection) {
    if let Err(e) = conn
        .stop_dtmf()
        .await
    {
        if session.is_hung_up() {
            debug!("[{}] stop_dtmf after hangup: {}", session.name(), e);
        } else {
            warn!("[{}] stop_dtmf failed: {}", session.name(), e);
        }
    }
}

/// Wait for one digit and route it through the choice table.
async fn wait_menu_choice(
    session: &CallSession,
    choices: &[Choice],
    timeout_ms: u64,
    no_input: &str,
    no_match: &str,
) -> IvrResult<String> {
    let mut deadline = Deadline::after_millis(timeout_ms);
    let digit = tokio::select! {
        biased;
        _ = session.hung_up() => return Err(IvrError::ChannelHangup),
        digit = session.next_digit() => digit.ok_or(IvrError::ChannelHangup)?,
        _ = &mut deadline => {
            let count = session.record_no_input();
            info!("[{}] Menu timed out ({})", session.name(), count);
            return Ok(no_input.to_string());
        }
    };

    match choices
        .iter()
        .find(|c| c.digit == digit)
    {
        Some(choice) => {
            debug!("[{}] Menu choice {} -> '{}'", session.name(), digit, choice.next);
            Ok(choice
                .next
                .clone())
        }
        None => {
            let count = session.record_no_match();
            info!("[{}] No menu choice for {} ({})", session.name(), digit, count);
            Ok(no_match.to_string())
        }
    }
}

/// Accumulate digits until the terminator, the length limit, or a quiet
/// period of `grammar.timeout`.
async fn collect_digits(session: &CallSession, grammar: &Grammar) -> IvrResult<String> {
    let mut digits = String::new();
    loop {
        let mut deadline = Deadline::after(grammar.timeout);
        tokio::select! {
            biased;
            _ = session.hung_up() => return Err(IvrError::ChannelHangup),
            digit = session.next_digit() => {
                let digit = digit.ok_or(IvrError::ChannelHangup)?;
                if grammar.is_terminator(&digit) {
                    break;
                }
                digits.push_str(&digit);
                if grammar.is_complete(digits.len()) {
                    break;
                }
            }
            _ = &mut deadline => {
                debug!("[{}] Digit timeout with '{}'", session.name(), digits);
                break;
            }
        }
    }
    Ok(digits)
}
