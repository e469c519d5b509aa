//! Name → `Node` lookup table consulted by the DSL parser.
//!
//! A registry is an explicit value shared as `Arc<Registry>`, so independent
//! flows (and tests) never see each other's nodes.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use tracing::debug;

use crate::{DefinitionError, Node};

#[derive(Debug, Default)]
pub struct Registry {
    nodes: RwLock<HashMap<String, Arc<Node>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `node` under its name.
    ///
    /// # Errors
    /// - [`DefinitionError::InvalidName`] if the name is not a DSL identifier.
    /// - [`DefinitionError::ZeroTimeout`] if the node has a zero timeout.
    /// - [`DefinitionError::DuplicateName`] if the name is already taken; the
    ///   existing node is kept.
    pub fn register(&self, node: Node) -> Result<Arc<Node>, DefinitionError> {
        if !is_identifier(node.name()) {
            return Err(DefinitionError::InvalidName(node.name().to_owned()));
        }
        if node.timeout().is_some_and(|t| t.is_zero()) {
            return Err(DefinitionError::ZeroTimeout(node.name().to_owned()));
        }

        let mut nodes = self.nodes.write();
        if nodes.contains_key(node.name()) {
            return Err(DefinitionError::DuplicateName(node.name().to_owned()));
        }

        debug!("registered node '{}'", node.name());
        let node = Arc::new(node);
        nodes.insert(node.name().to_owned(), Arc::clone(&node));
        Ok(node)
    }

    pub fn resolve(&self, name: &str) -> Option<Arc<Node>> {
        self.nodes
            .read()
            .get(name)
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes
            .read()
            .contains_key(name)
    }

    /// All registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .nodes
            .read()
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// `[A-Za-z_][A-Za-z0-9_]*`
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
