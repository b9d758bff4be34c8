//! Queries against the process pseudo-filesystem.

use crate::prelude::*;
use autopin_shared::{ProcessSource, TaskSet};
use nix::sched::{CpuSet, sched_setaffinity};
use nix::unistd::Pid;
use procfs::process::{Process, all_processes};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Index of the parent pid in `/proc/<pid>/stat`
const STAT_PPID: usize = 3;
/// Index of the command name in `/proc/<pid>/stat`
const STAT_COMM: usize = 1;
/// Index of the start time (in clock ticks after boot) in `/proc/<pid>/stat`
const STAT_START_TIME: usize = 21;

/// Returns the field at `index` of a raw `/proc/<pid>/stat` record.
///
/// Fields are separated by spaces, except for the command name (field 1) which is enclosed in
/// parentheses and may itself contain spaces or parentheses.
pub fn parse_stat_field(record: &str, index: usize) -> Option<&str> {
    let record = record.trim_end_matches('\n');
    let open = record.find('(')?;
    let close = record.rfind(')')?;
    if close < open {
        return None;
    }

    match index {
        0 => Some(record[..open].trim_end()),
        1 => Some(&record[open + 1..close]),
        _ => record[close + 1..].split_whitespace().nth(index - 2),
    }
}

fn read_stat_field(pid: i32, index: usize) -> Option<String> {
    let record = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    parse_stat_field(&record, index).map(str::to_owned)
}

/// Stateless view of the processes and threads of the system.
///
/// Every query is serialized through an internal lock.
#[derive(Default)]
pub struct ProcEnumerator {
    lock: Mutex<()>,
}

impl ProcEnumerator {
    pub fn new() -> Self {
        Self::default()
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// All thread ids of `pid`, including the main thread.
    pub fn list_threads(&self, pid: i32) -> Result<TaskSet> {
        let _guard = self.guard();

        let tasks = Process::new(pid).and_then(|process| process.tasks()).map_err(|e| {
            Error::system(
                "get_threads",
                format!("Could not get threads of process {pid}: {e}"),
            )
        })?;

        // Threads exiting while the directory is read are simply not part of the result
        Ok(tasks.flatten().map(|task| task.tid).collect())
    }

    /// The direct children of `pid`.
    ///
    /// If the status record of any process cannot be read the whole call fails, partial results
    /// are never returned.
    pub fn list_children(&self, pid: i32) -> Result<TaskSet> {
        let _guard = self.guard();

        let processes = all_processes().map_err(|e| {
            Error::system(
                "access_proc",
                format!("Could not access the proc filesystem: {e}"),
            )
        })?;

        let mut children = TaskSet::new();
        for process in processes {
            let candidate = process
                .ok()
                .and_then(|process| {
                    let ppid = read_stat_field(process.pid(), STAT_PPID)?;
                    Some((process.pid(), ppid.parse::<i32>().ok()?))
                })
                .ok_or_else(|| {
                    Error::system(
                        "get_children",
                        format!("Could not get all children of process {pid}"),
                    )
                })?;

            if candidate.1 == pid {
                children.insert(candidate.0);
            }
        }

        Ok(children)
    }

    /// Reads the field at `index` of the status record of `pid`.
    ///
    /// In lenient mode an unreadable record or an out-of-range index yields `Ok(None)`; in strict
    /// mode both are reported as a `SYSTEM` error.
    pub fn stat_field(&self, pid: i32, index: usize, strict: bool) -> Result<Option<String>> {
        let _guard = self.guard();

        match read_stat_field(pid, index) {
            Some(field) => Ok(Some(field)),
            None if strict => Err(Error::system(
                "access_proc",
                format!("Could not get field {index} of the status information for process {pid}"),
            )),
            None => Ok(None),
        }
    }

    /// Whether `/proc` has an entry for `pid`.
    pub fn exists(&self, pid: i32) -> bool {
        let _guard = self.guard();
        Process::new(pid).is_ok()
    }

    /// Command line of `pid` with its arguments joined by single spaces, empty if unreadable.
    pub fn command_line(&self, pid: i32) -> String {
        let _guard = self.guard();

        Process::new(pid)
            .and_then(|process| process.cmdline())
            .map(|args| args.join(" "))
            .unwrap_or_default()
    }

    /// All processes whose command name is exactly `name`.
    pub fn find_by_name(&self, name: &str) -> Result<TaskSet> {
        let _guard = self.guard();

        let processes = all_processes().map_err(|e| {
            Error::system(
                "access_proc",
                format!("Could not access the proc filesystem: {e}"),
            )
        })?;

        Ok(processes
            .flatten()
            .map(|process| process.pid())
            .filter(|pid| read_stat_field(*pid, STAT_COMM).as_deref() == Some(name))
            .collect())
    }

    /// Start time of a task, used to order tasks by creation.
    pub fn task_sort_id(&self, tid: i32) -> Result<u64> {
        let start_time = self
            .stat_field(tid, STAT_START_TIME, true)?
            .unwrap_or_default();

        start_time.parse().map_err(|_| {
            Error::system(
                "access_proc",
                format!("Invalid start time {start_time:?} for task {tid}"),
            )
        })
    }

    /// Restricts `tid` to exactly one core.
    pub fn set_affinity(&self, tid: i32, cpu: usize) -> Result<()> {
        let pin_error = |e: nix::Error| {
            Error::system(
                "set_affinity",
                format!("Could not pin thread {tid} to cpu {cpu}"),
            )
            .with_source(e)
        };

        let mut cores = CpuSet::new();
        cores.set(cpu).map_err(pin_error)?;
        sched_setaffinity(Pid::from_raw(tid), &cores).map_err(pin_error)?;

        debug!("Pinned task {tid} to cpu {cpu}");
        Ok(())
    }
}

impl ProcessSource for ProcEnumerator {
    type Error = Error;

    fn threads(&self, pid: i32) -> Result<TaskSet> {
        self.list_threads(pid)
    }

    fn children(&self, pid: i32) -> Result<TaskSet> {
        self.list_children(pid)
    }
}
