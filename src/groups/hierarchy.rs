//! Group hierarchy traversal.
//!
//! An arena of group nodes indexed by id. Every walk carries a visited set
//! and a depth cap, so a corrupted `parent_id` chain (an accidental cycle)
//! can never hang a traversal.

use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use super::types::Group;

/// Maximum parent-chain length any walk will follow.
const MAX_DEPTH: usize = 64;

/// Arena node for one group.
#[derive(Debug, Clone)]
struct Node {
    parent_id: Option<Uuid>,
    visible: bool,
}

/// Arena of group nodes supporting ancestor/descendant walks.
#[derive(Debug, Default)]
pub struct GroupForest {
    nodes: HashMap<Uuid, Node>,
    children: HashMap<Uuid, Vec<Uuid>>,
    roots: Vec<Uuid>,
}

impl GroupForest {
    /// Build a forest from a flat group list.
    pub fn from_groups(groups: &[Group]) -> Self {
        let mut forest = Self::default();

        for g in groups {
            forest.nodes.insert(
                g.id,
                Node {
                    parent_id: g.parent_id,
                    visible: g.visible,
                },
            );
        }

        for g in groups {
            match g.parent_id {
                // A parent reference to an unknown group is treated as top-level.
                Some(parent) if forest.nodes.contains_key(&parent) => {
                    forest.children.entry(parent).or_default().push(g.id);
                }
                _ => forest.roots.push(g.id),
            }
        }

        forest
    }

    /// Whether the forest knows this group.
    pub fn contains(&self, id: Uuid) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Whether the group is visible. Unknown groups are not.
    pub fn is_visible(&self, id: Uuid) -> bool {
        self.nodes.get(&id).map(|n| n.visible).unwrap_or(false)
    }

    /// Whether the group has no (known) parent.
    pub fn is_top_level(&self, id: Uuid) -> bool {
        self.roots.contains(&id)
    }

    /// Top-level group ids.
    pub fn roots(&self) -> &[Uuid] {
        &self.roots
    }

    /// Ancestors of a group, nearest first. The group itself is excluded.
    ///
    /// Stops at an unknown parent, at a repeated node (cycle), or at
    /// `MAX_DEPTH` steps.
    pub fn ancestors(&self, id: Uuid) -> Vec<Uuid> {
        let mut out = Vec::new();
        let mut visited = HashSet::new();
        visited.insert(id);

        let mut current = id;
        for _ in 0..MAX_DEPTH {
            let parent = match self.nodes.get(&current).and_then(|n| n.parent_id) {
                Some(p) if self.nodes.contains_key(&p) => p,
                _ => break,
            };
            if !visited.insert(parent) {
                tracing::warn!(group_id = %id, "cycle detected in group hierarchy");
                break;
            }
            out.push(parent);
            current = parent;
        }

        out
    }

    /// All descendants of a group (children, grandchildren, ...), excluding
    /// the group itself. Cycle-safe via a visited set.
    pub fn descendants(&self, id: Uuid) -> Vec<Uuid> {
        let mut out = Vec::new();
        let mut visited = HashSet::new();
        visited.insert(id);

        let mut queue = vec![id];
        while let Some(current) = queue.pop() {
            if let Some(children) = self.children.get(&current) {
                for &child in children {
                    if visited.insert(child) {
                        out.push(child);
                        queue.push(child);
                    }
                }
            }
        }

        out
    }
}
