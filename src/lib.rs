//! autopin: observes an application and pins its threads to CPU cores

#[cfg(not(target_os = "linux"))]
compile_error!("autopin relies on ptrace and /proc and only supports Linux");

pub mod config;
pub mod data_logger;
mod error;
pub mod monitor;
mod observed_process;
pub mod os;
pub mod pinning;
mod prelude;

pub use autopin_shared::{ProcessSource, ProcessTree, TaskSet};
pub use error::{Error, ErrorKind, Result};
pub use observed_process::{ObservedProcess, ProcessEvent, ProcessState};
pub use pinning::StaticPinning;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
