use crate::prelude::*;
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use nix::unistd::{ForkResult, fork};
use std::ffi::CString;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Set in the child once the tracer has attached and sent `SIGUSR1`.
static SUBJECT_RELEASED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_subject_released(_signal: libc::c_int) {
    SUBJECT_RELEASED.store(true, Ordering::SeqCst);
}

/// Splits a command line on spaces.
///
/// A backslash makes the next character literal, so `\ ` keeps a space inside an argument and
/// `\\` yields a single backslash. A trailing backslash is kept as is. Runs of spaces never
/// produce empty arguments.
pub fn split_command_line(command: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_arg = false;

    let mut chars = command.chars();
    while let Some(c) = chars.next() {
        match c {
            ' ' => {
                if in_arg {
                    args.push(std::mem::take(&mut current));
                    in_arg = false;
                }
            }
            '\\' => {
                in_arg = true;
                current.push(chars.next().unwrap_or('\\'));
            }
            c => {
                in_arg = true;
                current.push(c);
            }
        }
    }

    if in_arg {
        args.push(current);
    }
    args
}

/// Forks and executes `command_line`, returning the pid of the new process.
///
/// With `wait_for_attach` the child idles until it receives `SIGUSR1` and only then calls exec,
/// giving the tracer a chance to attach before the first instruction of the program runs. A
/// failing exec is not reported here: the child prints the reason and exits with status 127.
pub fn spawn(command_line: &str, wait_for_attach: bool) -> Result<i32> {
    let args = split_command_line(command_line)
        .into_iter()
        .map(CString::new)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| {
            Error::process(
                "create",
                format!("The command line contains a NUL byte: {command_line:?}"),
            )
        })?;
    let Some(program) = args.first() else {
        return Err(Error::process("create", "The command line is empty"));
    };
    let mut argv: Vec<*const libc::c_char> = args.iter().map(|arg| arg.as_ptr()).collect();
    argv.push(std::ptr::null());

    // Formatted before fork, the child may only use async-signal-safe calls
    let exec_failure = format!("autopin: could not execute {command_line:?}\n");

    let previous = if wait_for_attach {
        SUBJECT_RELEASED.store(false, Ordering::SeqCst);
        let action = SigAction::new(
            SigHandler::Handler(on_subject_released),
            SaFlags::empty(),
            SigSet::empty(),
        );
        // SAFETY: the handler only stores to an atomic
        let previous = unsafe { sigaction(Signal::SIGUSR1, &action) }.map_err(|e| {
            Error::system("sigset", "Could not install the handler for SIGUSR1").with_source(e)
        })?;
        Some(previous)
    } else {
        None
    };

    // SAFETY: the child branch below only calls async-signal-safe functions before exec
    let forked = unsafe { fork() };

    match forked {
        Ok(ForkResult::Child) => {
            if let Some(previous) = previous {
                while !SUBJECT_RELEASED.load(Ordering::SeqCst) {
                    std::thread::sleep(Duration::from_millis(1));
                }
                // SAFETY: restores the disposition inherited from the parent
                let _ = unsafe { sigaction(Signal::SIGUSR1, &previous) };
            }

            // SAFETY: `argv` is NUL terminated and points into `args`, both outlive the call
            unsafe {
                libc::execvp(program.as_ptr(), argv.as_ptr());
                libc::write(
                    libc::STDERR_FILENO,
                    exec_failure.as_ptr().cast(),
                    exec_failure.len(),
                );
                libc::_exit(127)
            }
        }
        Ok(ForkResult::Parent { child }) => {
            if let Some(previous) = previous {
                // SAFETY: restores the handler saved above
                unsafe { sigaction(Signal::SIGUSR1, &previous) }.map_err(|e| {
                    Error::system("sigset", "Could not restore the handler for SIGUSR1")
                        .with_source(e)
                })?;
            }

            debug!("Spawned process {child} for {command_line:?}");
            Ok(child.as_raw())
        }
        Err(e) => {
            if let Some(previous) = previous {
                // SAFETY: restores the handler saved above
                let _ = unsafe { sigaction(Signal::SIGUSR1, &previous) };
            }
            Err(Error::process("create", "Could not create a new process").with_source(e))
        }
    }
}
