use crate::observed_process::{ObservedProcess, ProcessEvent};
use crate::os::proc_fs::ProcEnumerator;
use crate::prelude::*;
use itertools::Itertools;

/// Pins every task of the observed process round-robin onto a fixed list of cores.
///
/// Tasks are ordered by start time, so the n-th created task always lands on the same core.
pub struct StaticPinning {
    cores: Vec<usize>,
}

/// Pairs each task with a core, cycling through `cores`.
pub fn assign_cores(tasks: &[i32], cores: &[usize]) -> Vec<(i32, usize)> {
    tasks.iter().copied().zip(cores.iter().copied().cycle()).collect()
}

impl StaticPinning {
    pub fn new(cores: Option<Vec<usize>>) -> Self {
        Self {
            cores: cores.unwrap_or_default(),
        }
    }

    pub fn handle_event(
        &self,
        event: &ProcessEvent,
        process: &ObservedProcess,
        enumerator: &ProcEnumerator,
    ) {
        match event {
            ProcessEvent::TaskCreated(_) if !self.cores.is_empty() => {
                let pinned = self.repin(process, enumerator);
                debug!("Pinned {pinned} tasks");
            }
            event => debug!("Pinning ignores {event:?}"),
        }
    }

    /// Returns the number of tasks successfully pinned.
    fn repin(&self, process: &ObservedProcess, enumerator: &ProcEnumerator) -> usize {
        let Some(tree) = process.process_tree(enumerator) else {
            warn!("Could not determine the tasks of process {}", process.pid());
            return 0;
        };

        let tasks = tree
            .all_tasks()
            .into_iter()
            .filter_map(|tid| enumerator.task_sort_id(tid).ok().map(|id| (id, tid)))
            .sorted()
            .map(|(_, tid)| tid)
            .collect_vec();

        assign_cores(&tasks, &self.cores)
            .into_iter()
            .filter(|(tid, cpu)| match enumerator.set_affinity(*tid, *cpu) {
                Ok(()) => true,
                Err(e) => {
                    warn!("{e}");
                    false
                }
            })
            .count()
    }
}
