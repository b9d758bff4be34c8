pub mod control;
pub mod process_tree;

pub use process_tree::{ProcessSource, ProcessTree, TaskSet};
