use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use nix::unistd;

use crate::error::Result;
use crate::fdutil::sys;
use crate::registry::CommandId;

pub(crate) type PipeId = u32;

/// Anonymous unidirectional byte channel connecting two pipeline stages.
/// Entries live in the registry's arena; redirection endpoints refer to them
/// by id, and the endpoint that created an entry removes it again. The
/// producer/consumer back-references exist only so a freshly forked child can
/// close every pipe that is not part of its own chain.
#[derive(Debug)]
pub(crate) struct Pipe {
    read: Option<OwnedFd>,
    write: Option<OwnedFd>,
    producer: Option<CommandId>,
    consumer: Option<CommandId>,
}

impl Pipe {
    pub(crate) fn open(producer: Option<CommandId>, consumer: Option<CommandId>) -> Result<Self> {
        let (read, write) = unistd::pipe().map_err(|e| sys("pipe", e))?;
        Ok(Pipe { read: Some(read), write: Some(write), producer, consumer })
    }

    pub(crate) fn read_fd(&self) -> Option<RawFd> {
        self.read.as_ref().map(|fd| fd.as_raw_fd())
    }

    pub(crate) fn write_fd(&self) -> Option<RawFd> {
        self.write.as_ref().map(|fd| fd.as_raw_fd())
    }

    // close_* are idempotent: both ends are independently closable and a
    // term phase may run more than once.
    pub(crate) fn close_read(&mut self) {
        self.read.take();
    }

    pub(crate) fn close_write(&mut self) {
        self.write.take();
    }

    pub(crate) fn take_write(&mut self) -> Option<OwnedFd> {
        self.write.take()
    }

    pub(crate) fn take_read(&mut self) -> Option<OwnedFd> {
        self.read.take()
    }

    /// True when `id` is either side of this pipe; such pipes survive in the
    /// child of `id`, all others are closed right after the fork.
    pub(crate) fn belongs_to(&self, id: CommandId) -> bool {
        self.producer == Some(id) || self.consumer == Some(id)
    }
}
