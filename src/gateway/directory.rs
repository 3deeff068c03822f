//! Node directory and point discovery.
//!
//! The directory maps a point's leaf name to its node handle. It is built
//! from scratch on every successful connect and thrown away on every
//! reconnect, so handles never outlive the session that produced them.
//!
//! Storage follows the slot layout used elsewhere in the gateway: a `Vec` of
//! entries in discovery order plus a `name -> index` map built alongside it.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::core::error::Result;
use crate::core::traits::{NodeHandle, NodeRef, PlcSession};

/// Name-keyed point directory for one session.
#[derive(Debug, Clone, Default)]
pub struct NodeDirectory {
    entries: Vec<(String, NodeHandle)>,
    index: HashMap<String, usize>,
}

impl NodeDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a point. A repeated name keeps its original
    /// position and takes the newest handle.
    pub fn insert(&mut self, name: impl Into<String>, handle: NodeHandle) {
        let name = name.into();
        match self.index.get(&name) {
            Some(&idx) => self.entries[idx].1 = handle,
            None => {
                self.index.insert(name.clone(), self.entries.len());
                self.entries.push((name, handle));
            }
        }
    }

    /// Handle for a point name.
    pub fn get(&self, name: &str) -> Option<&NodeHandle> {
        self.index.get(name).map(|&idx| &self.entries[idx].1)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
    }

    /// Point names in discovery order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    /// Handles in discovery order.
    pub fn handles(&self) -> Vec<NodeHandle> {
        self.entries.iter().map(|(_, h)| h.clone()).collect()
    }

    /// Iterate `(name, handle)` pairs in discovery order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &NodeHandle)> {
        self.entries.iter().map(|(n, h)| (n.as_str(), h))
    }
}

/// Outcome of a discovery walk.
#[derive(Debug, Default)]
pub struct Discovery {
    /// Every readable variable found under the root.
    pub directory: NodeDirectory,
    /// Branches whose children could not be listed: `(node, error)`.
    pub soft_errors: Vec<(NodeHandle, String)>,
}

/// Walk the hierarchy under `root` depth-first and collect every variable.
///
/// Only a failure to resolve the root itself aborts the walk. A branch whose
/// children cannot be listed is recorded in `soft_errors` and skipped.
pub async fn discover(session: Arc<dyn PlcSession>, root: NodeHandle) -> Result<Discovery> {
    let root = session.describe(&root).await?;
    let mut result = Discovery::default();

    // Children are pushed in reverse so they pop in browse order.
    let mut stack: Vec<NodeRef> = vec![root];
    while let Some(node) = stack.pop() {
        if node.is_variable() {
            result.directory.insert(node.browse_name.clone(), node.handle.clone());
        }

        match session.children(&node.handle).await {
            Ok(children) => stack.extend(children.into_iter().rev()),
            Err(e) => {
                debug!(node = %node.handle, error = %e, "skipping unbrowsable branch");
                result.soft_errors.push((node.handle, e.to_string()));
            }
        }
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::core::data::{Value, VariantType};
    use crate::core::traits::PlcConnector;
    use crate::protocols::virtual_plc::{VirtualConnector, VirtualPlc};

    fn plant() -> VirtualPlc {
        let plc = VirtualPlc::new("Sim", "root");
        plc.add_object("root", "a", "AreaA");
        plc.add_object("root", "b", "AreaB");
        plc.add_variable("a", "a.temp", "Temp", VariantType::Double, Value::Float(20.0));
        plc.add_variable("a", "a.run", "Running", VariantType::Boolean, Value::Bool(true));
        plc.add_variable("b", "b.level", "Level", VariantType::Float, Value::Float(3.0));
        plc
    }

    async fn session(plc: &VirtualPlc) -> Arc<dyn PlcSession> {
        let connector = VirtualConnector::new();
        connector.register("sim", plc.clone());
        connector.connect("sim").await.unwrap()
    }

    #[test]
    fn test_directory_last_write_wins() {
        let mut dir = NodeDirectory::new();
        dir.insert("Temp", NodeHandle::from("a.temp"));
        dir.insert("Level", NodeHandle::from("b.level"));
        dir.insert("Temp", NodeHandle::from("c.temp"));

        assert_eq!(dir.len(), 2);
        assert_eq!(dir.get("Temp"), Some(&NodeHandle::from("c.temp")));
        let names: Vec<&str> = dir.names().collect();
        assert_eq!(names, vec!["Temp", "Level"]);
    }

    #[tokio::test]
    async fn test_discover_collects_variables_depth_first() {
        let plc = plant();
        let found = discover(session(&plc).await, NodeHandle::from("root"))
            .await
            .unwrap();

        let names: Vec<&str> = found.directory.names().collect();
        assert_eq!(names, vec!["Temp", "Running", "Level"]);
        assert!(!found.directory.contains("AreaA"));
        assert!(found.soft_errors.is_empty());
    }

    #[tokio::test]
    async fn test_discover_skips_broken_branch() {
        let plc = plant();
        plc.break_branch("a");

        let found = discover(session(&plc).await, NodeHandle::from("root"))
            .await
            .unwrap();

        let names: Vec<&str> = found.directory.names().collect();
        assert_eq!(names, vec!["Level"]);
        assert_eq!(found.soft_errors.len(), 1);
        assert_eq!(found.soft_errors[0].0, NodeHandle::from("a"));
    }

    #[tokio::test]
    async fn test_discover_fails_on_missing_root() {
        let plc = plant();
        let err = discover(session(&plc).await, NodeHandle::from("nope")).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_discover_includes_array_children() {
        let plc = VirtualPlc::new("Sim", "root");
        plc.add_bit_array("root", "cut", "CMD_Instant_Cutoff", 2);

        let found = discover(session(&plc).await, NodeHandle::from("root"))
            .await
            .unwrap();
        let names: Vec<&str> = found.directory.names().collect();
        assert_eq!(names, vec!["CMD_Instant_Cutoff", "[0]", "[1]"]);
    }
}
