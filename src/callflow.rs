//! Call-flow graph: nodes, prompts and grammars, swapped as one snapshot.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::grammar::Grammar;

/// A recorded announcement.
///
/// Only the first phrase is played.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub name: String,
    pub barge_in: bool,
    pub phrases: Vec<String>,
}

/// One menu entry: an exact digit and where it leads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Choice {
    pub digit: String,
    pub next: String,
}

/// One step of a conversation.
///
/// `next`, `no_input` and `no_match` hold node names; an empty `next` ends
/// the call-flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    /// Answer the call, then continue.
    Root { name: String, next: String },
    /// Play prompts in order.
    Announcement {
        name: String,
        prompts: Vec<String>,
        next: String,
    },
    /// Play prompts, then branch on one digit.
    Menu {
        name: String,
        prompts: Vec<String>,
        choices: Vec<Choice>,
        timeout_ms: u64,
        no_input: String,
        no_match: String,
    },
    /// Retry the active node until a failure counter reaches its limit.
    ///
    /// A `None` limit never triggers.
    Goto {
        name: String,
        prompts: Vec<String>,
        next: String,
        max_no_input: Option<u32>,
        max_no_match: Option<u32>,
    },
    /// Play prompts, then collect digits under a grammar.
    PromptCollect {
        name: String,
        prompts: Vec<String>,
        grammar: String,
        next: String,
        no_input: String,
        no_match: String,
    },
    /// Hang up.
    Exit { name: String },
}

impl Node {
    pub fn name(&self) -> &str {
        match self {
            Node::Root { name, .. }
            | Node::Announcement { name, .. }
            | Node::Menu { name, .. }
            | Node::Goto { name, .. }
            | Node::PromptCollect { name, .. }
            | Node::Exit { name } => name,
        }
    }

    /// Short kind name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Node::Root { .. } => "root",
            Node::Announcement { .. } => "announcement",
            Node::Menu { .. } => "menu",
            Node::Goto { .. } => "goto",
            Node::PromptCollect { .. } => "prompt-collect",
            Node::Exit { .. } => "exit",
        }
    }

    /// Prompt names played on entry.
    pub fn prompts(&self) -> &[String] {
        match self {
            Node::Announcement { prompts, .. }
            | Node::Menu { prompts, .. }
            | Node::Goto { prompts, .. }
            | Node::PromptCollect { prompts, .. } => prompts,
            Node::Root { .. } | Node::Exit { .. } => &[],
        }
    }

    /// Every node name this node can hand over to.
    pub fn targets(&self) -> Vec<&str> {
        let targets: Vec<&str> = match self {
            Node::Root { next, .. } | Node::Announcement { next, .. } => vec![next.as_str()],
            Node::Menu {
                choices,
                no_input,
                no_match,
                ..
            } => choices
                .iter()
                .map(|c| c.next.as_str())
                .chain([no_input.as_str(), no_match.as_str()])
                .collect(),
            Node::Goto { next, .. } => vec![next.as_str()],
            Node::PromptCollect {
                next,
                no_input,
                no_match,
                ..
            } => vec![next.as_str(), no_input.as_str(), no_match.as_str()],
            Node::Exit { .. } => vec![],
        };
        targets
            .into_iter()
            .filter(|t| !t.is_empty())
            .collect()
    }
}

/// Immutable call-flow definition.
#[derive(Debug, Clone, Default)]
pub struct CallFlow {
    nodes: HashMap<String, Node>,
    prompts: HashMap<String, Prompt>,
    grammars: HashMap<String, Grammar>,
}

impl CallFlow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node, replacing any node of the same name.
    pub fn with_node(mut self, node: Node) -> Self {
        self.nodes
            .insert(node.name().to_string(), node);
        self
    }

    pub fn with_prompt(mut self, prompt: Prompt) -> Self {
        self.prompts
            .insert(prompt.name.clone(), prompt);
        self
    }

    pub fn with_grammar(mut self, grammar: Grammar) -> Self {
        self.grammars
            .insert(grammar.name.clone(), grammar);
        self
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes
            .get(name)
    }

    pub fn prompt(&self, name: &str) -> Option<&Prompt> {
        self.prompts
            .get(name)
    }

    pub fn grammar(&self, name: &str) -> Option<&Grammar> {
        self.grammars
            .get(name)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes
            .values()
    }

    pub fn node_count(&self) -> usize {
        self.nodes
            .len()
    }

    /// References to nodes, prompts or grammars that do not exist.
    ///
    /// Each entry is a readable description. Sorted for stable output.
    pub fn dangling_references(&self) -> Vec<String> {
        let mut problems = Vec::new();
        for node in self
            .nodes
            .values()
        {
            for target in node.targets() {
                if !self
                    .nodes
                    .contains_key(target)
                {
                    problems.push(format!(
                        "node '{}' leads to unknown node '{}'",
                        node.name(),
                        target
                    ));
                }
            }
            for prompt in node.prompts() {
                if !self
                    .prompts
                    .contains_key(prompt)
                {
                    problems.push(format!(
                        "node '{}' plays unknown prompt '{}'",
                        node.name(),
                        prompt
                    ));
                }
            }
            if let Node::PromptCollect { grammar, .. } = node {
                if !self
                    .grammars
                    .contains_key(grammar)
                {
                    problems.push(format!(
                        "node '{}' uses unknown grammar '{}'",
                        node.name(),
                        grammar
                    ));
                }
            }
        }
        problems.sort();
        problems
    }
}

/// Holder of the current call-flow snapshot.
///
/// Readers take an `Arc` and keep using it while a reload swaps in a new one.
#[derive(Debug, Default)]
pub struct CallFlowStore {
    current: RwLock<Arc<CallFlow>>,
}

impl CallFlowStore {
    pub fn new(flow: CallFlow) -> Self {
        Self {
            current: RwLock::new(Arc::new(flow)),
        }
    }

    /// The snapshot in effect right now.
    pub fn snapshot(&self) -> Arc<CallFlow> {
        self.current
            .read()
            .clone()
    }

    /// Swap in a new snapshot as a whole.
    pub fn replace(&self, flow: CallFlow) {
        *self
            .current
            .write() = Arc::new(flow);
    }
}
