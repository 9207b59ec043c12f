//! Child-status collection. The SIGCHLD handler does nothing but raise a
//! flag; the real work happens on the control thread, inside
//! [`Registry::poll`] and the blocking waits. Handlers are installed without
//! SA_RESTART on purpose: a termination must be able to interrupt a blocking
//! read or wait so the interrupted loop can reap before retrying.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Once;

use log::*;
use nix::errno::Errno;
use nix::libc::c_int;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::wait::{self, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use crate::command::{run_exit_hook, State};
use crate::registry::Registry;

static CHILD_PENDING: AtomicBool = AtomicBool::new(false);
static INSTALL: Once = Once::new();

extern "C" fn note_child(_: c_int) {
    CHILD_PENDING.store(true, Ordering::Relaxed);
}

/// Install the parent-side handlers, once per process: SIGCHLD raises the
/// pending flag, SIGPIPE is ignored so a consumer dying mid-pipeline surfaces
/// as a write error instead of killing us.
pub(crate) fn install_parent_handlers() {
    INSTALL.call_once(|| {
        let on_child = SigAction::new(
            SigHandler::Handler(note_child),
            SaFlags::empty(),
            SigSet::empty(),
        );
        if let Err(err) = unsafe { signal::sigaction(Signal::SIGCHLD, &on_child) } {
            warn!("sigaction(SIGCHLD): {}", err);
        }
        let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
        if let Err(err) = unsafe { signal::sigaction(Signal::SIGPIPE, &ignore) } {
            warn!("sigaction(SIGPIPE): {}", err);
        }
    });
}

const CHILD_RESET: &[Signal] = &[
    Signal::SIGHUP,
    Signal::SIGINT,
    Signal::SIGQUIT,
    Signal::SIGILL,
    Signal::SIGTRAP,
    Signal::SIGABRT,
    Signal::SIGFPE,
    Signal::SIGUSR1,
    Signal::SIGUSR2,
    Signal::SIGPIPE,
    Signal::SIGALRM,
    Signal::SIGTERM,
    Signal::SIGCHLD,
    Signal::SIGCONT,
    Signal::SIGTSTP,
    Signal::SIGTTIN,
    Signal::SIGTTOU,
    Signal::SIGWINCH,
];

/// Put every catchable signal back to its default disposition in a freshly
/// forked child, before exec or the callback runs.
pub(crate) fn reset_child_signals() {
    let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    for sig in CHILD_RESET {
        let _ = unsafe { signal::sigaction(*sig, &default) };
    }
}

/// Run `f` with SIGTTOU ignored. Moving the terminal's foreground group from
/// a background process raises SIGTTOU, which would stop us.
pub(crate) fn with_sigttou_ignored<F: FnOnce()>(f: F) {
    let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
    let previous = unsafe { signal::sigaction(Signal::SIGTTOU, &ignore) }.ok();
    f();
    if let Some(previous) = previous {
        let _ = unsafe { signal::sigaction(Signal::SIGTTOU, &previous) };
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum WaitTarget {
    Any,
    Pid(Pid),
    Pgid(Pid),
}

impl WaitTarget {
    fn waitpid_arg(self) -> Pid {
        match self {
            WaitTarget::Any => Pid::from_raw(-1),
            WaitTarget::Pid(pid) => pid,
            WaitTarget::Pgid(pgid) => Pid::from_raw(-pgid.as_raw()),
        }
    }
}

/// Collect pending child statuses if the termination signal fired since the
/// last call. Two passes: a non-blocking sweep over all children, then a
/// per-command recheck so a status that raced the sweep is still picked up.
pub(crate) fn poll(registry: &Registry) {
    if !CHILD_PENDING.swap(false, Ordering::Relaxed) {
        return;
    }
    trace!("collecting child statuses");
    while reap_target(registry, WaitTarget::Any, false) {}
    for core in registry.live_cores() {
        let (pid, state) = {
            let core = core.borrow();
            (core.pid, core.state)
        };
        let Some(pid) = pid else { continue };
        if matches!(state, State::Running | State::Stopped) {
            reap_target(registry, WaitTarget::Pid(pid), false);
        }
    }
}

/// One waitpid call against `target`, applying whatever status comes back.
/// Returns true when a status was applied (so non-blocking sweeps know to
/// keep going).
pub(crate) fn reap_target(registry: &Registry, target: WaitTarget, blocking: bool) -> bool {
    let mut flags = WaitPidFlag::WUNTRACED | WaitPidFlag::WCONTINUED;
    if !blocking {
        flags |= WaitPidFlag::WNOHANG;
    }
    match wait::waitpid(target.waitpid_arg(), Some(flags)) {
        Ok(WaitStatus::StillAlive) => false,
        Ok(status) => apply(registry, status),
        Err(Errno::EINTR) => {
            // interrupted by SIGCHLD itself; the caller's loop polls again
            false
        }
        Err(Errno::ECHILD) => {
            // no such child, yet we may still carry a command for it: some
            // other code path (or a stray wait) got its status first
            if let WaitTarget::Pid(pid) = target {
                force_exit(registry, pid);
            }
            false
        }
        Err(err) => {
            warn!("waitpid: {}", err);
            false
        }
    }
}

fn apply(registry: &Registry, status: WaitStatus) -> bool {
    match status {
        WaitStatus::Exited(pid, code) => {
            debug!("[{}] exited with code {}", pid, code);
            finish(registry, pid, State::Exited, Some(code), None);
            true
        }
        WaitStatus::Signaled(pid, sig, _) => {
            debug!("[{}] killed by signal {}", pid, sig);
            finish(registry, pid, State::Signalled, None, Some(sig as i32));
            true
        }
        WaitStatus::Stopped(pid, sig) => {
            debug!("[{}] stopped by signal {}", pid, sig);
            if let Some(core) = registry.core_by_pid(pid) {
                let mut core = core.borrow_mut();
                core.signal_num = Some(sig as i32);
                core.set_state(State::Stopped);
            }
            true
        }
        WaitStatus::Continued(pid) => {
            debug!("[{}] continued", pid);
            if let Some(core) = registry.core_by_pid(pid) {
                core.borrow_mut().set_state(State::Running);
            }
            true
        }
        other => {
            trace!("unhandled wait status {:?}", other);
            true
        }
    }
}

fn force_exit(registry: &Registry, pid: Pid) {
    let known = registry
        .core_by_pid(pid)
        .map(|core| core.borrow().state == State::Running || core.borrow().state == State::Stopped)
        .unwrap_or(false);
    if known {
        warn!("[{}] lost child status, forcing exit", pid);
        finish(registry, pid, State::Exited, Some(-1), None);
    }
}

/// Record a terminal status on the owning command, release its redirections
/// and fire the exit hook.
fn finish(registry: &Registry, pid: Pid, state: State, code: Option<i32>, sig: Option<i32>) {
    let Some(core) = registry.core_by_pid(pid) else {
        trace!("[{}] no command for reaped process", pid);
        return;
    };
    {
        let mut core = core.borrow_mut();
        core.return_code = code;
        core.signal_num = sig;
        core.set_state(state);
        core.term_redirections(registry);
    }
    run_exit_hook(&core);
}
