use std::cell::RefCell;
use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::rc::Rc;

use log::*;
use nix::sys::signal::{self, Signal};
use nix::unistd::{self, ForkResult, Pid};

use crate::dest::{Dest, OutputBuffer};
use crate::error::{CommandError, Result};
use crate::fdutil::RedirCtx;
use crate::reaper;
use crate::registry::{CommandId, Registry};
use crate::source::Source;

/// Lifecycle of a command. Transitions out of Running happen only when the
/// reaper observes the corresponding child status; stop/tstop merely send a
/// signal and leave the state alone until then.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    None,
    Idle,
    Running,
    Exited,
    Signalled,
    Stopped,
}

pub(crate) type Callback = Box<dyn FnMut(&[String])>;

pub(crate) struct CommandCore {
    pub(crate) name: String,
    pub(crate) path: Option<PathBuf>,
    pub(crate) args: Vec<String>,
    pub(crate) id: CommandId,
    pub(crate) forked: bool,
    pub(crate) callback: Option<Callback>,
    pub(crate) pid: Option<Pid>,
    pub(crate) pgid: Option<Pid>,
    pub(crate) group_leader: bool,
    pub(crate) group_with: Option<CommandId>,
    pub(crate) in_child: bool,
    pub(crate) state: State,
    pub(crate) return_code: Option<i32>,
    pub(crate) signal_num: Option<i32>,
    pub(crate) srcs: Vec<Source>,
    pub(crate) dests: Vec<Dest>,
    pub(crate) exit_hook: Option<Box<dyn FnMut()>>,
}

impl CommandCore {
    /// Idempotent; repeated reports of the same state make no noise.
    pub(crate) fn set_state(&mut self, state: State) {
        if self.state == state {
            return;
        }
        debug!("[{}] {} {:?} -> {:?}", self.id, self.name, self.state, state);
        self.state = state;
    }

    pub(crate) fn redir_ctx(&self) -> RedirCtx {
        RedirCtx { forked: self.forked, id: self.id }
    }

    /// Release all redirections, sources before destinations.
    pub(crate) fn term_redirections(&mut self, registry: &Registry) {
        let cx = self.redir_ctx();
        for src in self.srcs.iter_mut() {
            src.term(registry, &cx);
        }
        for dest in self.dests.iter_mut() {
            dest.term(registry, &cx);
        }
    }
}

/// Run the command's post-termination hook, if any, without holding the core
/// borrow (the hook is user code and may call back into the command).
pub(crate) fn run_exit_hook(core: &Rc<RefCell<CommandCore>>) {
    let hook = core.borrow_mut().exit_hook.take();
    if let Some(mut hook) = hook {
        hook();
        core.borrow_mut().exit_hook = Some(hook);
    }
}

/// One managed unit of execution: an external program or an in-process
/// callback, with its redirections and state machine. Registered in its
/// [`Registry`] for its whole lifetime; dropping the handle force-stops a
/// still-live process and deregisters.
pub struct Command {
    core: Rc<RefCell<CommandCore>>,
    registry: Registry,
}

impl Command {
    /// External command, run in a forked child.
    pub fn new<N, P, A, S>(registry: &Registry, name: N, path: P, args: A) -> Command
    where
        N: Into<String>,
        P: Into<PathBuf>,
        A: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::build(registry, name.into(), Some(path.into()), None, args, true)
    }

    /// Callback command, run inline (without forking) by default.
    pub fn with_callback<N, A, S, F>(registry: &Registry, name: N, callback: F, args: A) -> Command
    where
        N: Into<String>,
        A: IntoIterator<Item = S>,
        S: Into<String>,
        F: FnMut(&[String]) + 'static,
    {
        Self::build(registry, name.into(), None, Some(Box::new(callback)), args, false)
    }

    fn build<A, S>(
        registry: &Registry,
        name: String,
        path: Option<PathBuf>,
        callback: Option<Callback>,
        args: A,
        forked: bool,
    ) -> Command
    where
        A: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let core = Rc::new(RefCell::new(CommandCore {
            name,
            path,
            args: args.into_iter().map(Into::into).collect(),
            id: 0,
            forked,
            callback,
            pid: None,
            pgid: None,
            group_leader: false,
            group_with: None,
            in_child: false,
            state: State::None,
            return_code: None,
            signal_num: None,
            srcs: Vec::new(),
            dests: Vec::new(),
            exit_hook: None,
        }));
        let id = registry.register(&core);
        {
            let mut c = core.borrow_mut();
            c.id = id;
            c.set_state(State::Idle);
        }
        Command { core, registry: registry.clone() }
    }

    // ---- identity & queries ----

    pub fn id(&self) -> CommandId {
        self.core.borrow().id
    }

    pub fn name(&self) -> String {
        self.core.borrow().name.clone()
    }

    pub fn args(&self) -> Vec<String> {
        self.core.borrow().args.clone()
    }

    pub fn add_arg(&self, arg: impl Into<String>) {
        self.core.borrow_mut().args.push(arg.into());
    }

    /// Display name followed by the arguments, space separated.
    pub fn command_string(&self) -> String {
        let core = self.core.borrow();
        let mut s = core.name.clone();
        for arg in &core.args {
            s.push(' ');
            s.push_str(arg);
        }
        s
    }

    pub fn forked(&self) -> bool {
        self.core.borrow().forked
    }

    /// Choose between spawning a child process and running the callback in
    /// place. Meaningful before `start` only.
    pub fn set_forked(&self, forked: bool) {
        self.core.borrow_mut().forked = forked;
    }

    pub fn state(&self) -> State {
        self.core.borrow().state
    }

    pub fn is_state(&self, state: State) -> bool {
        self.core.borrow().state == state
    }

    /// Exit code recorded by the reaper; valid once the state is Exited.
    pub fn return_code(&self) -> Option<i32> {
        self.core.borrow().return_code
    }

    /// Signal recorded by the reaper; valid in Signalled or Stopped.
    pub fn signal_num(&self) -> Option<i32> {
        self.core.borrow().signal_num
    }

    pub fn pid(&self) -> Option<i32> {
        self.core.borrow().pid.map(Pid::as_raw)
    }

    pub fn pgid(&self) -> Option<i32> {
        self.core.borrow().pgid.map(Pid::as_raw)
    }

    /// Hook run after the command's termination cleanup (both the inline
    /// path and reaper-observed deaths).
    pub fn set_exit_hook(&self, hook: impl FnMut() + 'static) {
        self.core.borrow_mut().exit_hook = Some(Box::new(hook));
    }

    // ---- redirection attachment ----

    pub fn add_file_src(&self, path: impl Into<PathBuf>) {
        self.core.borrow_mut().srcs.push(Source::file(path.into()));
    }

    pub fn add_file_src_handle(&self, file: File) {
        self.core.borrow_mut().srcs.push(Source::file_handle(OwnedFd::from(file)));
    }

    pub fn add_string_src(&self, text: impl Into<String>) {
        self.core
            .borrow_mut()
            .srcs
            .push(Source::string(self.registry.clone(), text.into()));
    }

    /// Attach this command's stdin to the pending pipe destination published
    /// by the previous pipeline stage. Errors if no destination is pending.
    pub fn add_pipe_src(&self) -> Result<()> {
        let Some(producer) = self.registry.take_pending_pipe_dest() else {
            return self.registry.report(CommandError::NoPipeDestination);
        };
        let id = self.id();
        let pipe = match self.registry.new_pipe(Some(producer), Some(id)) {
            Ok(pipe) => pipe,
            Err(err) => return self.registry.report(err),
        };
        if let Some(producer_core) = self.registry.core_by_id(producer) {
            let mut core = producer_core.borrow_mut();
            if let Some(dest) = core.dests.iter_mut().rev().find_map(Dest::as_pipe_mut) {
                dest.set_pipe(pipe);
            }
        }
        trace!("[{}] pipe src linked to command {}", id, producer);
        self.core.borrow_mut().srcs.push(Source::pipe(self.registry.clone(), pipe));
        Ok(())
    }

    pub fn add_file_dest(&self, path: impl Into<PathBuf>, dest_fd: i32) {
        self.core.borrow_mut().dests.push(Dest::file(path.into(), dest_fd));
    }

    pub fn add_file_dest_handle(&self, file: File, dest_fd: i32) {
        self.core
            .borrow_mut()
            .dests
            .push(Dest::file_handle(OwnedFd::from(file), dest_fd));
    }

    /// Publish (or extend) this command's pipe destination and leave it
    /// pending for the next stage's `add_pipe_src`. A second call with
    /// another descriptor reuses the same pipe (`|&` style).
    pub fn add_pipe_dest(&self, dest_fd: i32) {
        let id = self.id();
        if self.registry.pending_pipe_dest() == Some(id) {
            let mut core = self.core.borrow_mut();
            if let Some(dest) = core.dests.iter_mut().rev().find_map(Dest::as_pipe_mut) {
                dest.add_fd(dest_fd);
                return;
            }
        }
        if let Some(other) = self.registry.pending_pipe_dest() {
            warn!("[{}] replacing unlinked pipe destination of command {}", id, other);
        }
        self.core.borrow_mut().dests.push(Dest::pipe(dest_fd));
        self.registry.set_pending_pipe_dest(Some(id));
    }

    /// Capture the stream on `dest_fd` into a string buffer, drained after
    /// the command starts. Keep the returned handle and read it after wait.
    pub fn add_string_dest(&self, dest_fd: i32) -> OutputBuffer {
        let buffer = OutputBuffer::default();
        self.core
            .borrow_mut()
            .dests
            .push(Dest::string(self.registry.clone(), buffer.clone(), dest_fd));
        buffer
    }

    pub fn set_file_dest_overwrite(&self, overwrite: bool, dest_fd: i32) {
        let mut core = self.core.borrow_mut();
        for dest in core.dests.iter_mut() {
            if let Some(file) = dest.as_file_mut(dest_fd) {
                file.set_overwrite(overwrite);
            }
        }
    }

    pub fn set_file_dest_append(&self, append: bool, dest_fd: i32) {
        let mut core = self.core.borrow_mut();
        for dest in core.dests.iter_mut() {
            if let Some(file) = dest.as_file_mut(dest_fd) {
                file.set_append(append);
            }
        }
    }

    // ---- process groups ----

    /// Make this command the leader of its own process group when started.
    pub fn set_process_group_leader(&self) {
        let mut core = self.core.borrow_mut();
        core.group_leader = true;
        core.group_with = None;
        core.pgid = core.pid;
    }

    /// Join the process group of `peer` when started.
    pub fn set_process_group(&self, peer: &Command) {
        let peer_core = peer.core.borrow();
        let mut core = self.core.borrow_mut();
        core.group_leader = false;
        core.group_with = Some(peer_core.id);
        if peer_core.pid.is_some() {
            core.pgid = peer_core.pid;
        }
    }

    fn update_process_group(&self, pid: Pid) {
        let (leader, group_with) = {
            let core = self.core.borrow();
            (core.group_leader, core.group_with)
        };
        if leader {
            self.core.borrow_mut().pgid = Some(pid);
            if let Err(err) = unistd::setpgid(pid, pid) {
                debug!("[{}] setpgid: {}", pid, err);
            }
        } else if let Some(peer_id) = group_with {
            let Some(peer) = self.registry.core_by_id(peer_id) else {
                return;
            };
            let peer_pid = peer.borrow().pid;
            if let Some(pgid) = peer_pid {
                self.core.borrow_mut().pgid = Some(pgid);
                if let Err(err) = unistd::setpgid(pid, pgid) {
                    debug!("[{}] setpgid: {}", pid, err);
                }
            }
        }
    }

    // ---- lifecycle ----

    /// Launch the command. Forked mode returns immediately after the fork;
    /// the child's termination is observed asynchronously (see
    /// [`Registry::poll`] and [`Command::wait`]). Inline mode runs the
    /// callback to completion before returning.
    pub fn start(&self) -> Result<()> {
        debug!("[{}] start command {}", self.id(), self.command_string());
        if self.forked() {
            self.start_forked()
        } else {
            self.start_inline()
        }
    }

    fn start_forked(&self) -> Result<()> {
        // handlers must exist before the child can die
        reaper::install_parent_handlers();
        // destinations first: they may create pipes that sources attach to
        self.init_parent_dests()?;
        self.init_parent_srcs()?;

        match unsafe { unistd::fork() } {
            Err(err) => self.registry.report(CommandError::Fork(err)),
            Ok(ForkResult::Child) => self.run_child(),
            Ok(ForkResult::Parent { child }) => {
                self.core.borrow_mut().pid = Some(child);
                self.update_process_group(child);
                debug!("[{}] forked process {}", self.id(), child);
                self.core.borrow_mut().set_state(State::Running);
                self.process_srcs()?;
                self.process_dests()?;
                Ok(())
            }
        }
    }

    fn start_inline(&self) -> Result<()> {
        assert!(
            self.core.borrow().callback.is_some(),
            "inline commands require a callback"
        );
        self.init_parent_dests()?;
        self.init_parent_srcs()?;
        self.init_child_dests()?;
        self.init_child_srcs()?;
        self.invoke_callback();
        self.process_dests()?;
        self.process_srcs()?;
        self.term_redirections();
        run_exit_hook(&self.core);
        Ok(())
    }

    /// Child side of the fork. Never returns.
    fn run_child(&self) -> ! {
        let pid = unistd::getpid();
        self.core.borrow_mut().pid = Some(pid);
        self.update_process_group(pid);
        reaper::reset_child_signals();
        let id = self.id();
        // close every pipe belonging to some other pipeline branch so
        // upstream readers can still see end-of-file
        self.registry.release_foreign_pipes(id);
        self.core.borrow_mut().in_child = true;
        let _ = self.init_child_dests();
        let _ = self.init_child_srcs();

        let has_callback = self.core.borrow().callback.is_some();
        if has_callback {
            self.invoke_callback();
            self.term_redirections();
            run_exit_hook(&self.core);
            unsafe { libc::_exit(0) }
        } else {
            self.exec_program()
        }
    }

    fn exec_program(&self) -> ! {
        let (name, path, args) = {
            let core = self.core.borrow();
            (core.name.clone(), core.path.clone(), core.args.clone())
        };
        let program = path
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|| name.clone());
        let c_program = CString::new(program.clone()).unwrap_or_default();
        let mut argv = Vec::with_capacity(args.len() + 1);
        argv.push(CString::new(name).unwrap_or_default());
        for arg in args {
            argv.push(CString::new(arg).unwrap_or_default());
        }
        // PATH lookup on purpose; the error below never reaches the parent,
        // which only observes the sentinel exit code
        let err = match unistd::execvp(&c_program, &argv) {
            Ok(never) => match never {},
            Err(err) => err,
        };
        let _ = self.registry.report(CommandError::Exec { program, source: err });
        unsafe { libc::_exit(255) }
    }

    fn invoke_callback(&self) {
        let (mut callback, args) = {
            let mut core = self.core.borrow_mut();
            core.return_code = Some(0);
            (core.callback.take(), core.args.clone())
        };
        if let Some(cb) = callback.as_mut() {
            cb(&args);
        }
        let mut core = self.core.borrow_mut();
        core.callback = callback;
        core.set_state(State::Exited);
    }

    // ---- signal operations ----

    /// SIGSTOP a running command. The Stopped transition is recorded when
    /// the reaper observes it, not here.
    pub fn pause(&self) -> Result<()> {
        if self.is_state(State::Running) {
            self.send_signal(Signal::SIGSTOP)?;
        }
        Ok(())
    }

    /// SIGCONT a stopped command and mark it Running (optimistic; the
    /// continue notification is not waited for).
    pub fn resume(&self) -> Result<()> {
        if self.is_state(State::Stopped) && self.send_signal(Signal::SIGCONT)? {
            self.core.borrow_mut().set_state(State::Running);
        }
        Ok(())
    }

    /// SIGTERM a running or stopped command; the state changes only when
    /// the reaper sees the death.
    pub fn stop(&self) -> Result<()> {
        if self.is_state(State::Running) || self.is_state(State::Stopped) {
            self.send_signal(Signal::SIGTERM)?;
        }
        Ok(())
    }

    /// SIGTSTP (terminal stop) a running command.
    pub fn tstop(&self) -> Result<()> {
        if self.is_state(State::Running) {
            self.send_signal(Signal::SIGTSTP)?;
        }
        Ok(())
    }

    /// Ok(true) when the signal was delivered; delivery failure goes through
    /// the error sink and yields Ok(false) in record-only mode.
    fn send_signal(&self, sig: Signal) -> Result<bool> {
        let Some(pid) = self.core.borrow().pid else {
            return Ok(false);
        };
        if let Err(err) = signal::kill(pid, sig) {
            self.registry
                .report(CommandError::SignalDelivery { pid: pid.as_raw(), source: err })?;
            return Ok(false);
        }
        Ok(true)
    }

    // ---- waiting ----

    /// Block until the command exits or stops. If the command runs in its
    /// own process group, the controlling terminal's foreground group is
    /// handed to it for the duration and restored afterwards.
    pub fn wait(&self) -> Result<()> {
        if !self.forked() {
            assert!(
                self.is_state(State::Exited),
                "inline commands finish inside start"
            );
            return Ok(());
        }
        let Some(pid) = self.core.borrow().pid else {
            warn!("[{}] wait on a command that was never started", self.id());
            return Ok(());
        };

        let tty = OpenOptions::new().read(true).write(true).open("/dev/tty").ok();
        let previous_fg = tty.as_ref().and_then(|t| unistd::tcgetpgrp(t).ok());
        let pgid = self.core.borrow().pgid;
        let transfer = matches!(
            (tty.as_ref(), previous_fg, pgid),
            (Some(_), Some(fg), Some(pg)) if fg != pg
        );
        if transfer {
            if let (Some(tty), Some(pg)) = (tty.as_ref(), pgid) {
                reaper::with_sigttou_ignored(|| {
                    if let Err(err) = unistd::tcsetpgrp(tty, pg) {
                        debug!("[{}] tcsetpgrp: {}", self.id(), err);
                    }
                });
            }
        }

        self.wait_on(reaper::WaitTarget::Pid(pid));

        if transfer {
            if let (Some(tty), Some(fg)) = (tty.as_ref(), previous_fg) {
                reaper::with_sigttou_ignored(|| {
                    if let Err(err) = unistd::tcsetpgrp(tty, fg) {
                        debug!("[{}] tcsetpgrp: {}", self.id(), err);
                    }
                });
            }
        }
        Ok(())
    }

    /// Block on this command's process id alone; no terminal handling.
    pub fn wait_pid(&self) -> Result<()> {
        let Some(pid) = self.core.borrow().pid else {
            warn!("[{}] wait_pid on a command that was never started", self.id());
            return Ok(());
        };
        self.wait_on(reaper::WaitTarget::Pid(pid));
        Ok(())
    }

    /// Block on this command's process group; requires a group to be set.
    pub fn wait_pgid(&self) -> Result<()> {
        let pgid = self.core.borrow().pgid;
        let Some(pgid) = pgid else {
            warn!("[{}] wait_pgid on a command without a process group", self.id());
            return Ok(());
        };
        self.wait_on(reaper::WaitTarget::Pgid(pgid));
        Ok(())
    }

    fn wait_on(&self, target: reaper::WaitTarget) {
        loop {
            // pick up terminations the signal flag announced while we were
            // blocked (or before we got here)
            self.registry.poll();
            match self.state() {
                State::Exited | State::Signalled | State::Stopped => break,
                _ => {}
            }
            reaper::reap_target(&self.registry, target, true);
        }
        // a reap that landed while a process phase had the redirection lists
        // moved out could not release them; the release is idempotent
        if matches!(self.state(), State::Exited | State::Signalled) {
            self.term_redirections();
        }
    }

    // ---- redirection phases ----

    fn init_parent_dests(&self) -> Result<()> {
        let cx = self.core.borrow().redir_ctx();
        let mut core = self.core.borrow_mut();
        let core = &mut *core;
        for dest in core.dests.iter_mut() {
            dest.init_parent(&self.registry, &cx)?;
        }
        Ok(())
    }

    fn init_parent_srcs(&self) -> Result<()> {
        let cx = self.core.borrow().redir_ctx();
        let mut core = self.core.borrow_mut();
        let core = &mut *core;
        for src in core.srcs.iter_mut() {
            src.init_parent(&self.registry, &cx)?;
        }
        Ok(())
    }

    fn init_child_dests(&self) -> Result<()> {
        let cx = self.core.borrow().redir_ctx();
        let mut core = self.core.borrow_mut();
        let core = &mut *core;
        for dest in core.dests.iter_mut() {
            dest.init_child(&self.registry, &cx)?;
        }
        Ok(())
    }

    fn init_child_srcs(&self) -> Result<()> {
        let cx = self.core.borrow().redir_ctx();
        let mut core = self.core.borrow_mut();
        let core = &mut *core;
        for src in core.srcs.iter_mut() {
            src.init_child(&self.registry, &cx)?;
        }
        Ok(())
    }

    // The process phases can block (string payloads, captured output), and
    // a reap may fire for another command while they do; the redirection
    // lists are moved out so no core borrow is held meanwhile.

    fn process_srcs(&self) -> Result<()> {
        let cx = self.core.borrow().redir_ctx();
        let mut srcs = std::mem::take(&mut self.core.borrow_mut().srcs);
        let mut result = Ok(());
        for src in srcs.iter_mut() {
            result = src.process(&self.registry, &cx);
            if result.is_err() {
                break;
            }
        }
        self.core.borrow_mut().srcs = srcs;
        result
    }

    fn process_dests(&self) -> Result<()> {
        let cx = self.core.borrow().redir_ctx();
        let mut dests = std::mem::take(&mut self.core.borrow_mut().dests);
        let mut result = Ok(());
        for dest in dests.iter_mut() {
            result = dest.process(&self.registry, &cx);
            if result.is_err() {
                break;
            }
        }
        self.core.borrow_mut().dests = dests;
        result
    }

    fn term_redirections(&self) {
        self.core.borrow_mut().term_redirections(&self.registry);
    }
}

impl Drop for Command {
    fn drop(&mut self) {
        if self.core.borrow().in_child {
            return;
        }
        // a still-live process must not outlive its handle
        let _ = self.stop();
        let id = self.core.borrow().id;
        self.registry.deregister(id);
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let core = self.core.borrow();
        f.debug_struct("Command")
            .field("id", &core.id)
            .field("name", &core.name)
            .field("state", &core.state)
            .field("pid", &core.pid)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[test]
    fn construction_registers_and_idles() {
        init();
        let registry = Registry::new();
        let cmd = Command::new(&registry, "true", "/bin/true", Vec::<String>::new());
        assert_eq!(cmd.state(), State::Idle);
        assert_eq!(cmd.id(), 1);
        let second = Command::new(&registry, "false", "/bin/false", Vec::<String>::new());
        assert_eq!(second.id(), 2);
        assert_eq!(registry.commands(), vec![1, 2]);
    }

    #[test]
    fn drop_deregisters() {
        init();
        let registry = Registry::new();
        {
            let _cmd = Command::new(&registry, "true", "/bin/true", Vec::<String>::new());
            assert_eq!(registry.commands().len(), 1);
        }
        assert!(registry.commands().is_empty());
    }

    #[test]
    fn signal_ops_are_noops_when_idle() {
        init();
        let registry = Registry::new();
        registry.set_raise_on_error(true);
        let cmd = Command::new(&registry, "true", "/bin/true", Vec::<String>::new());
        cmd.stop().unwrap();
        cmd.pause().unwrap();
        cmd.resume().unwrap();
        cmd.tstop().unwrap();
        assert_eq!(cmd.state(), State::Idle);
        assert_eq!(registry.last_error(), None);
    }

    #[test]
    fn command_string_joins_args() {
        init();
        let registry = Registry::new();
        let cmd = Command::new(&registry, "echo", "/bin/echo", ["-n", "hi"]);
        assert_eq!(cmd.command_string(), "echo -n hi");
    }

    #[test]
    fn pipe_src_without_pending_dest_is_an_error() {
        init();
        let registry = Registry::new();
        registry.set_raise_on_error(true);
        let cmd = Command::new(&registry, "cat", "/bin/cat", Vec::<String>::new());
        assert!(cmd.add_pipe_src().is_err());
        assert!(registry.last_error().is_some());
    }

    #[test]
    fn inline_callback_runs_in_place() {
        init();
        let registry = Registry::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        let cmd = Command::with_callback(
            &registry,
            "collect",
            move |args: &[String]| sink.borrow_mut().extend(args.to_vec()),
            ["a", "b"],
        );
        cmd.start().unwrap();
        assert_eq!(cmd.state(), State::Exited);
        assert_eq!(cmd.return_code(), Some(0));
        assert_eq!(*seen.borrow(), vec!["a".to_string(), "b".to_string()]);
        cmd.wait().unwrap();
    }
}
