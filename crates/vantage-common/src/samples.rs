use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub const ROOT_METHOD: &str = "ROOT";

/// Message of the log record that carries a flushed request's sample tree.
pub const PROFILE_DETAIL: &str = "profileDetail";

/// Call-path tree of sample counts. A node's count includes its children.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SampleNode {
    pub count: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub children: BTreeMap<String, SampleNode>,
}

/// Flattened form of a [`SampleNode`], as carried on log records.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StackSampleElement {
    pub id: u32,
    pub parent_id: Option<u32>,
    pub count: u64,
    pub method: String,
}

impl SampleNode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Adds `count` samples along `path`, creating missing nodes.
    pub fn add_path<S: AsRef<str>>(&mut self, path: &[S], count: u64) {
        self.count = self.count.saturating_add(count);
        let mut node = self;
        for segment in path {
            node = node.children.entry(segment.as_ref().to_string()).or_default();
            node.count = node.count.saturating_add(count);
        }
    }

    pub fn merge(&mut self, other: SampleNode) {
        self.count = self.count.saturating_add(other.count);
        for (method, child) in other.children {
            self.children.entry(method).or_default().merge(child);
        }
    }

    pub fn aggregate(a: Option<SampleNode>, b: Option<SampleNode>) -> Option<SampleNode> {
        match (a, b) {
            (Some(mut a), Some(b)) => {
                a.merge(b);
                Some(a)
            }
            (a, None) => a,
            (None, b) => b,
        }
    }

    /// Pre-order flattening; the root gets id 0 and no parent.
    pub fn flatten(&self) -> Vec<StackSampleElement> {
        let mut out = Vec::new();
        fn walk(
            node: &SampleNode,
            method: &str,
            parent_id: Option<u32>,
            out: &mut Vec<StackSampleElement>,
        ) {
            let id = out.len() as u32;
            out.push(StackSampleElement {
                id,
                parent_id,
                count: node.count,
                method: method.to_string(),
            });
            for (child_method, child) in &node.children {
                walk(child, child_method, Some(id), out);
            }
        }
        walk(self, ROOT_METHOD, None, &mut out);
        out
    }

    /// Rebuilds a tree from its flattened form. Elements must be in pre-order
    /// (parents before children); orphans are dropped.
    pub fn from_elements(elements: &[StackSampleElement]) -> Option<SampleNode> {
        let root = elements.first()?;
        if root.parent_id.is_some() {
            return None;
        }
        let mut paths: BTreeMap<u32, Vec<String>> = BTreeMap::new();
        paths.insert(root.id, Vec::new());
        let mut tree = SampleNode {
            count: root.count,
            children: BTreeMap::new(),
        };
        for el in &elements[1..] {
            let Some(parent_path) = el.parent_id.and_then(|p| paths.get(&p)).cloned() else {
                continue;
            };
            let mut path = parent_path;
            path.push(el.method.clone());
            let mut node = &mut tree;
            for segment in &path {
                node = node.children.entry(segment.clone()).or_default();
            }
            node.count = el.count;
            paths.insert(el.id, path);
        }
        Some(tree)
    }
}
