use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::os::fd::OwnedFd;
use std::rc::{Rc, Weak};

use log::*;
use nix::unistd::Pid;

use crate::command::{Command, CommandCore, State};
use crate::error::{CommandError, Result};
use crate::pipe::{Pipe, PipeId};
use crate::reaper;

pub type CommandId = u32;

/// Process-wide command table, pipe arena and error sink, threaded explicitly
/// into every [`Command`]. Cloning the handle is cheap and shares state.
/// The registry (like the rest of the crate) assumes a single control thread;
/// the child-termination signal handler itself only sets a flag, and the
/// actual reaping runs inside [`Registry::poll`] and the blocking waits.
#[derive(Clone)]
pub struct Registry {
    inner: Rc<RefCell<RegistryInner>>,
}

struct RegistryInner {
    last_id: CommandId,
    commands: BTreeMap<CommandId, Weak<RefCell<CommandCore>>>,
    last_pipe_id: PipeId,
    pipes: HashMap<PipeId, Pipe>,
    pending_pipe_dest: Option<CommandId>,
    last_error: Option<String>,
    raise_on_error: bool,
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            inner: Rc::new(RefCell::new(RegistryInner {
                last_id: 0,
                commands: BTreeMap::new(),
                last_pipe_id: 0,
                pipes: HashMap::new(),
                pending_pipe_dest: None,
                last_error: None,
                raise_on_error: false,
            })),
        }
    }

    /// When set, reported errors are returned to the caller in addition to
    /// being recorded. Off by default: failures are then only inspectable
    /// through [`Registry::last_error`].
    pub fn set_raise_on_error(&self, raise: bool) {
        self.inner.borrow_mut().raise_on_error = raise;
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.borrow().last_error.clone()
    }

    /// Single funnel for all internal failures: records the message and,
    /// depending on configuration, hands the error back to the caller.
    pub(crate) fn report(&self, err: CommandError) -> Result<()> {
        warn!("{}", err);
        let mut inner = self.inner.borrow_mut();
        inner.last_error = Some(err.to_string());
        if inner.raise_on_error {
            Err(err)
        } else {
            Ok(())
        }
    }

    /// Runs the pending child-status collection if the termination signal
    /// fired since the last call. Blocking waits call this internally; call
    /// it from an event loop to observe background commands finishing.
    pub fn poll(&self) {
        reaper::poll(self);
    }

    /// Splits `line` on whitespace into program + arguments, builds a forked
    /// command and starts it. Returns the command handle so the caller
    /// decides when to wait or drop; `None` for a blank line.
    pub fn exec_command(&self, line: &str) -> Result<Option<Command>> {
        let mut words = line.split_whitespace().map(str::to_owned);
        let Some(program) = words.next() else {
            return Ok(None);
        };
        let command = Command::new(self, program.clone(), program, words);
        command.start()?;
        Ok(Some(command))
    }

    // ---- command table ----

    pub(crate) fn register(&self, core: &Rc<RefCell<CommandCore>>) -> CommandId {
        let mut inner = self.inner.borrow_mut();
        inner.last_id += 1;
        let id = inner.last_id;
        inner.commands.insert(id, Rc::downgrade(core));
        id
    }

    pub(crate) fn deregister(&self, id: CommandId) {
        self.inner.borrow_mut().commands.remove(&id);
    }

    pub(crate) fn core_by_id(&self, id: CommandId) -> Option<Rc<RefCell<CommandCore>>> {
        self.inner.borrow().commands.get(&id).and_then(Weak::upgrade)
    }

    /// Linear scan; process counts are small.
    pub(crate) fn core_by_pid(&self, pid: Pid) -> Option<Rc<RefCell<CommandCore>>> {
        let inner = self.inner.borrow();
        for weak in inner.commands.values() {
            if let Some(core) = weak.upgrade() {
                if core.borrow().pid == Some(pid) {
                    return Some(core);
                }
            }
        }
        None
    }

    /// Snapshot of the live command cores, in registration order. Taken up
    /// front so reap steps never run under the registry borrow.
    pub(crate) fn live_cores(&self) -> Vec<Rc<RefCell<CommandCore>>> {
        self.inner
            .borrow()
            .commands
            .values()
            .filter_map(Weak::upgrade)
            .collect()
    }

    pub fn lookup_pid(&self, pid: i32) -> Option<CommandId> {
        self.core_by_pid(Pid::from_raw(pid)).map(|core| {
            let id = core.borrow().id;
            id
        })
    }

    pub fn commands(&self) -> Vec<CommandId> {
        self.inner.borrow().commands.keys().copied().collect()
    }

    pub fn commands_in_state(&self, state: State) -> Vec<CommandId> {
        self.live_cores()
            .into_iter()
            .filter(|core| core.borrow().state == state)
            .map(|core| {
                let id = core.borrow().id;
                id
            })
            .collect()
    }

    // ---- pending pipe destination ----

    pub(crate) fn pending_pipe_dest(&self) -> Option<CommandId> {
        self.inner.borrow().pending_pipe_dest
    }

    pub(crate) fn set_pending_pipe_dest(&self, command: Option<CommandId>) {
        self.inner.borrow_mut().pending_pipe_dest = command;
    }

    pub(crate) fn take_pending_pipe_dest(&self) -> Option<CommandId> {
        self.inner.borrow_mut().pending_pipe_dest.take()
    }

    // ---- pipe arena ----

    pub(crate) fn new_pipe(
        &self,
        producer: Option<CommandId>,
        consumer: Option<CommandId>,
    ) -> Result<PipeId> {
        let pipe = Pipe::open(producer, consumer)?;
        let mut inner = self.inner.borrow_mut();
        inner.last_pipe_id += 1;
        let id = inner.last_pipe_id;
        inner.pipes.insert(id, pipe);
        Ok(id)
    }

    pub(crate) fn pipe_read_fd(&self, id: PipeId) -> Option<i32> {
        self.inner.borrow().pipes.get(&id).and_then(Pipe::read_fd)
    }

    pub(crate) fn pipe_write_fd(&self, id: PipeId) -> Option<i32> {
        self.inner.borrow().pipes.get(&id).and_then(Pipe::write_fd)
    }

    pub(crate) fn close_pipe_read(&self, id: PipeId) {
        if let Some(pipe) = self.inner.borrow_mut().pipes.get_mut(&id) {
            pipe.close_read();
        }
    }

    pub(crate) fn close_pipe_write(&self, id: PipeId) {
        if let Some(pipe) = self.inner.borrow_mut().pipes.get_mut(&id) {
            pipe.close_write();
        }
    }

    pub(crate) fn take_pipe_write(&self, id: PipeId) -> Option<OwnedFd> {
        self.inner.borrow_mut().pipes.get_mut(&id).and_then(Pipe::take_write)
    }

    pub(crate) fn take_pipe_read(&self, id: PipeId) -> Option<OwnedFd> {
        self.inner.borrow_mut().pipes.get_mut(&id).and_then(Pipe::take_read)
    }

    pub(crate) fn drop_pipe(&self, id: PipeId) {
        self.inner.borrow_mut().pipes.remove(&id);
    }

    /// Close, in a freshly forked child, every pipe that belongs to some
    /// other command's pipeline. Runs before any child-side descriptor
    /// rewiring so unrelated readers can still observe end-of-file.
    pub(crate) fn release_foreign_pipes(&self, id: CommandId) {
        self.inner.borrow_mut().pipes.retain(|_, pipe| pipe.belongs_to(id));
    }

    #[cfg(test)]
    pub(crate) fn pipe_count(&self) -> usize {
        self.inner.borrow().pipes.len()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Registry::new()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Registry")
            .field("commands", &inner.commands.len())
            .field("pipes", &inner.pipes.len())
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
    fn error_sink_records_and_optionally_raises() {
        init();
        let registry = Registry::new();
        assert_eq!(registry.last_error(), None);
        assert!(registry.report(CommandError::NoPipeDestination).is_ok());
        assert!(registry.last_error().unwrap().contains("no pipe destination"));
        registry.set_raise_on_error(true);
        assert!(registry.report(CommandError::NoPipeDestination).is_err());
    }

    #[test]
    fn pipe_arena_ownership() {
        init();
        let registry = Registry::new();
        let own = registry.new_pipe(Some(1), Some(2)).unwrap();
        let foreign = registry.new_pipe(Some(3), None).unwrap();
        let unowned = registry.new_pipe(None, None).unwrap();
        assert_eq!(registry.pipe_count(), 3);
        assert!(registry.pipe_read_fd(own).is_some());
        assert!(registry.pipe_write_fd(own).is_some());

        // a child of command 2 keeps only the pipes of its own chain
        registry.release_foreign_pipes(2);
        assert_eq!(registry.pipe_count(), 1);
        assert!(registry.pipe_read_fd(foreign).is_none());
        assert!(registry.pipe_read_fd(unowned).is_none());
        registry.drop_pipe(own);
        assert_eq!(registry.pipe_count(), 0);
    }

    #[test]
    fn pending_pipe_destination_slot() {
        init();
        let registry = Registry::new();
        assert_eq!(registry.take_pending_pipe_dest(), None);
        registry.set_pending_pipe_dest(Some(4));
        assert_eq!(registry.pending_pipe_dest(), Some(4));
        assert_eq!(registry.take_pending_pipe_dest(), Some(4));
        assert_eq!(registry.pending_pipe_dest(), None);
    }

    #[test]
    fn pipe_close_is_idempotent() {
        init();
        let registry = Registry::new();
        let pipe = registry.new_pipe(None, None).unwrap();
        registry.close_pipe_write(pipe);
        registry.close_pipe_write(pipe);
        assert!(registry.pipe_write_fd(pipe).is_none());
        assert!(registry.take_pipe_read(pipe).is_some());
        assert!(registry.take_pipe_read(pipe).is_none());
        registry.drop_pipe(pipe);
    }
}
