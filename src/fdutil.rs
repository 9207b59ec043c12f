use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use log::*;
use nix::unistd;

use crate::error::{CommandError, Result};
use crate::registry::CommandId;

pub(crate) fn sys(op: &'static str, source: nix::errno::Errno) -> CommandError {
    CommandError::Sys { op, source }
}

/// Duplicate `fd` onto `target`, replacing whatever `target` referred to.
pub(crate) fn redirect(fd: RawFd, target: RawFd) -> Result<()> {
    unistd::dup2(fd, target).map_err(|e| sys("dup2", e))?;
    Ok(())
}

/// Saved copy of a standard descriptor. Restores the original onto its slot
/// exactly once, on `restore` or on drop, whichever comes first. Only the
/// inline (unforked) execution path needs this; a forked child's descriptor
/// table dies with the child.
#[derive(Debug)]
pub(crate) struct SavedFd {
    saved: Option<OwnedFd>,
    target: RawFd,
}

impl SavedFd {
    pub(crate) fn save(target: RawFd) -> Result<Self> {
        let raw = unistd::dup(target).map_err(|e| sys("dup", e))?;
        let saved = unsafe { OwnedFd::from_raw_fd(raw) };
        Ok(SavedFd { saved: Some(saved), target })
    }

    pub(crate) fn restore(&mut self) {
        if let Some(saved) = self.saved.take() {
            if let Err(err) = unistd::dup2(saved.as_raw_fd(), self.target) {
                warn!("cannot restore fd {}: {}", self.target, err);
            }
        }
    }
}

impl Drop for SavedFd {
    fn drop(&mut self) {
        self.restore();
    }
}

/// Per-phase context handed to every redirection endpoint: whether the owning
/// command forks, and its registry id (for pipe ownership bookkeeping).
#[derive(Debug, Clone, Copy)]
pub(crate) struct RedirCtx {
    pub(crate) forked: bool,
    pub(crate) id: CommandId,
}
