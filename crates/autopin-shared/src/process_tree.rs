use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// A set of process or thread ids.
pub type TaskSet = BTreeSet<i32>;

/// A point-in-time view of the processes and threads below some root process.
pub trait ProcessSource {
    type Error: std::fmt::Display;

    /// All thread ids of `pid`, including `pid` itself.
    fn threads(&self, pid: i32) -> Result<TaskSet, Self::Error>;

    /// The direct children of `pid`.
    fn children(&self, pid: i32) -> Result<TaskSet, Self::Error>;
}

/// Snapshot of the process hierarchy rooted at the observed process.
///
/// A tree is never modified after [`ProcessTree::build`] returns it. Every process listed in
/// `tasks` is reachable from `root` through `children`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessTree {
    root: i32,
    /// Map of parent pid to its child pids
    children: BTreeMap<i32, TaskSet>,
    /// Map of pid to its thread ids
    tasks: BTreeMap<i32, TaskSet>,
}

impl ProcessTree {
    /// Walks `source` breadth-first starting at `root`.
    ///
    /// Any failure of `source` aborts the walk: a partially built tree is never returned.
    pub fn build<S: ProcessSource>(source: &S, root: i32) -> Result<Self, S::Error> {
        let mut tree = Self {
            root,
            children: BTreeMap::new(),
            tasks: BTreeMap::new(),
        };

        tree.tasks.insert(root, source.threads(root)?);

        let mut worklist: VecDeque<(i32, i32)> = source
            .children(root)?
            .into_iter()
            .map(|child| (root, child))
            .collect();

        while let Some((parent, child)) = worklist.pop_front() {
            // A pid that was re-parented during the walk may show up twice
            if tree.tasks.contains_key(&child) {
                continue;
            }

            tree.children.entry(parent).or_default().insert(child);
            tree.tasks.insert(child, source.threads(child)?);

            worklist.extend(
                source
                    .children(child)?
                    .into_iter()
                    .map(|grandchild| (child, grandchild)),
            );
        }

        Ok(tree)
    }

    pub fn root(&self) -> i32 {
        self.root
    }

    /// The direct children of `pid`, empty if `pid` has none or is not part of the tree.
    pub fn children(&self, pid: i32) -> impl Iterator<Item = i32> + '_ {
        self.children.get(&pid).into_iter().flatten().copied()
    }

    /// The threads of `pid`, if `pid` is part of the tree.
    pub fn tasks(&self, pid: i32) -> Option<&TaskSet> {
        self.tasks.get(&pid)
    }

    /// All processes of the tree, in ascending pid order.
    pub fn processes(&self) -> impl Iterator<Item = i32> + '_ {
        self.tasks.keys().copied()
    }

    /// Every thread of every process of the tree.
    pub fn all_tasks(&self) -> TaskSet {
        self.tasks.values().flatten().copied().collect()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
