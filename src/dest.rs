use std::cell::RefCell;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read};
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::rc::Rc;

use log::*;
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use crate::error::{CommandError, Result};
use crate::fdutil::{redirect, sys, RedirCtx, SavedFd};
use crate::pipe::PipeId;
use crate::registry::Registry;

/// Where one of a command's output streams goes. Keyed by the target
/// descriptor (conventionally 1 = stdout, 2 = stderr); same four-phase
/// protocol as [`crate::source::Source`].
#[derive(Debug)]
pub(crate) enum Dest {
    File(FileDest),
    Pipe(PipeDest),
    Str(StringDest),
}

impl Dest {
    pub(crate) fn file(path: PathBuf, dest_fd: RawFd) -> Self {
        Dest::File(FileDest {
            path: Some(path),
            dest_fd,
            overwrite: true,
            append: false,
            fd: None,
            saved: None,
        })
    }

    pub(crate) fn file_handle(fd: OwnedFd, dest_fd: RawFd) -> Self {
        Dest::File(FileDest {
            path: None,
            dest_fd,
            overwrite: true,
            append: false,
            fd: Some(fd),
            saved: None,
        })
    }

    pub(crate) fn pipe(dest_fd: RawFd) -> Self {
        Dest::Pipe(PipeDest { pipe: None, dest_fds: vec![dest_fd], saved: Vec::new() })
    }

    pub(crate) fn string(registry: Registry, buffer: OutputBuffer, dest_fd: RawFd) -> Self {
        Dest::Str(StringDest { registry, buffer, dest_fd, pipe: None, saved: None })
    }

    pub(crate) fn as_file_mut(&mut self, dest_fd: RawFd) -> Option<&mut FileDest> {
        match self {
            Dest::File(dest) if dest.dest_fd == dest_fd => Some(dest),
            _ => None,
        }
    }

    pub(crate) fn as_pipe_mut(&mut self) -> Option<&mut PipeDest> {
        match self {
            Dest::Pipe(dest) => Some(dest),
            _ => None,
        }
    }

    pub(crate) fn init_parent(&mut self, registry: &Registry, cx: &RedirCtx) -> Result<()> {
        match self {
            Dest::File(dest) => dest.init_parent(registry),
            Dest::Pipe(dest) => dest.init_parent(registry),
            Dest::Str(dest) => dest.init_parent(registry, cx),
        }
    }

    pub(crate) fn init_child(&mut self, registry: &Registry, cx: &RedirCtx) -> Result<()> {
        match self {
            Dest::File(dest) => dest.init_child(registry, cx),
            Dest::Pipe(dest) => dest.init_child(registry, cx),
            Dest::Str(dest) => dest.init_child(registry, cx),
        }
    }

    pub(crate) fn process(&mut self, registry: &Registry, _cx: &RedirCtx) -> Result<()> {
        match self {
            Dest::Str(dest) => dest.process(registry),
            _ => Ok(()),
        }
    }

    pub(crate) fn term(&mut self, registry: &Registry, _cx: &RedirCtx) {
        match self {
            Dest::File(dest) => dest.term(),
            Dest::Pipe(dest) => dest.term(registry),
            Dest::Str(dest) => dest.term(),
        }
    }
}

/// Output to a named file (or pre-opened handle) with the shell's
/// clobber/append policy. Overwrite and append are independent flags;
/// append without overwrite requires the file to already exist, and
/// no-overwrite without append refuses to touch an existing file.
#[derive(Debug)]
pub(crate) struct FileDest {
    path: Option<PathBuf>,
    dest_fd: RawFd,
    overwrite: bool,
    append: bool,
    fd: Option<OwnedFd>,
    saved: Option<SavedFd>,
}

impl FileDest {
    pub(crate) fn set_overwrite(&mut self, overwrite: bool) {
        self.overwrite = overwrite;
    }

    pub(crate) fn set_append(&mut self, append: bool) {
        self.append = append;
    }

    fn init_parent(&mut self, registry: &Registry) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let exists = path.exists();
        let opened = if self.append {
            if !self.overwrite && !exists {
                return registry.report(CommandError::MissingFile(path.clone()));
            }
            if exists {
                OpenOptions::new().append(true).open(path)
            } else {
                File::create(path)
            }
        } else {
            if !self.overwrite && exists {
                // fail before the file is touched
                return registry.report(CommandError::FileExists(path.clone()));
            }
            File::create(path)
        };
        match opened {
            Ok(file) => self.fd = Some(file.into()),
            Err(err) => {
                registry.report(CommandError::OpenFile { path: path.clone(), source: err })?
            }
        }
        Ok(())
    }

    fn init_child(&mut self, registry: &Registry, cx: &RedirCtx) -> Result<()> {
        let Some(raw) = self.fd.as_ref().map(|fd| fd.as_raw_fd()) else {
            return Ok(());
        };
        if cx.forked {
            if let Err(err) = redirect(raw, self.dest_fd) {
                registry.report(err)?;
            }
            self.fd = None;
        } else {
            match SavedFd::save(self.dest_fd) {
                Ok(saved) => self.saved = Some(saved),
                Err(err) => registry.report(err)?,
            }
            if let Err(err) = redirect(raw, self.dest_fd) {
                registry.report(err)?;
            }
            self.fd = None;
        }
        Ok(())
    }

    fn term(&mut self) {
        self.fd = None;
        if let Some(mut saved) = self.saved.take() {
            saved.restore();
        }
    }
}

/// The producer half of an inter-stage pipe. Created lazily on the first
/// pipe-output request; piping a second stream (e.g. stderr as well as
/// stdout) just adds another target descriptor to the same pipe. The shared
/// arena entry is owned by the consumer side once linked.
#[derive(Debug)]
pub(crate) struct PipeDest {
    pipe: Option<PipeId>,
    dest_fds: Vec<RawFd>,
    saved: Vec<SavedFd>,
}

impl PipeDest {
    pub(crate) fn add_fd(&mut self, dest_fd: RawFd) {
        if !self.dest_fds.contains(&dest_fd) {
            self.dest_fds.push(dest_fd);
        }
    }

    pub(crate) fn set_pipe(&mut self, pipe: PipeId) {
        self.pipe = Some(pipe);
    }

    fn init_parent(&mut self, registry: &Registry) -> Result<()> {
        if self.pipe.is_none() {
            // downstream stage never attached its pipe source
            registry.report(CommandError::UnlinkedPipeDestination)?;
        }
        Ok(())
    }

    fn init_child(&mut self, registry: &Registry, cx: &RedirCtx) -> Result<()> {
        let Some(pipe) = self.pipe else {
            return Ok(());
        };
        if cx.forked {
            if let Some(raw) = registry.pipe_write_fd(pipe) {
                for dest_fd in &self.dest_fds {
                    if let Err(err) = redirect(raw, *dest_fd) {
                        registry.report(err)?;
                    }
                }
            }
            registry.close_pipe_write(pipe);
            // the read end belongs to the downstream stage
            registry.close_pipe_read(pipe);
        } else {
            if let Some(raw) = registry.pipe_write_fd(pipe) {
                for dest_fd in &self.dest_fds {
                    match SavedFd::save(*dest_fd) {
                        Ok(saved) => self.saved.push(saved),
                        Err(err) => registry.report(err)?,
                    }
                    if let Err(err) = redirect(raw, *dest_fd) {
                        registry.report(err)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn term(&mut self, registry: &Registry) {
        // closing the parent's write end is what lets the consumer see EOF
        if let Some(pipe) = self.pipe {
            registry.close_pipe_write(pipe);
        }
        for mut saved in self.saved.drain(..) {
            saved.restore();
        }
    }
}

/// Captured output: the command writes into a private pipe and the parent
/// drains the read end to completion into a shared string buffer. The drain
/// happens in the process phase, right after start — the one redirection
/// operation that blocks outside of wait.
#[derive(Debug)]
pub(crate) struct StringDest {
    registry: Registry,
    buffer: OutputBuffer,
    dest_fd: RawFd,
    pipe: Option<PipeId>,
    saved: Option<SavedFd>,
}

impl StringDest {
    fn init_parent(&mut self, registry: &Registry, cx: &RedirCtx) -> Result<()> {
        match registry.new_pipe(Some(cx.id), None) {
            Ok(pipe) => self.pipe = Some(pipe),
            Err(err) => return registry.report(err),
        }
        Ok(())
    }

    fn init_child(&mut self, registry: &Registry, cx: &RedirCtx) -> Result<()> {
        let Some(pipe) = self.pipe else {
            return Ok(());
        };
        if cx.forked {
            if let Some(raw) = registry.pipe_write_fd(pipe) {
                if let Err(err) = redirect(raw, self.dest_fd) {
                    registry.report(err)?;
                }
            }
            registry.close_pipe_write(pipe);
            registry.close_pipe_read(pipe);
        } else {
            match SavedFd::save(self.dest_fd) {
                Ok(saved) => self.saved = Some(saved),
                Err(err) => registry.report(err)?,
            }
            if let Some(raw) = registry.pipe_write_fd(pipe) {
                if let Err(err) = redirect(raw, self.dest_fd) {
                    registry.report(err)?;
                }
            }
        }
        Ok(())
    }

    fn process(&mut self, registry: &Registry) -> Result<()> {
        // drop every write-capable reference we still hold, then drain
        if let Some(mut saved) = self.saved.take() {
            saved.restore();
        }
        let Some(pipe) = self.pipe else {
            return Ok(());
        };
        registry.close_pipe_write(pipe);
        let Some(read_end) = registry.take_pipe_read(pipe) else {
            return Ok(());
        };
        let mut file = File::from(read_end);
        let mut bytes = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            // Wait for data with a timeout instead of blocking in read:
            // end-of-file on this pipe can depend on an upstream stage being
            // reaped first (reaping closes its write ends), and the reap only
            // runs on this thread.
            let mut fds = [PollFd::new(file.as_fd(), PollFlags::POLLIN)];
            match poll(&mut fds, PollTimeout::from(100u8)) {
                Ok(0) | Err(Errno::EINTR) => {
                    registry.poll();
                    continue;
                }
                Ok(_) => {}
                Err(err) => {
                    registry.report(sys("poll", err))?;
                    break;
                }
            }
            match file.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => bytes.extend_from_slice(&chunk[..n]),
                Err(err) if err.kind() == ErrorKind::Interrupted => registry.poll(),
                Err(err) => {
                    registry.report(CommandError::Read(err))?;
                    break;
                }
            }
        }
        trace!("captured {} bytes on fd {}", bytes.len(), self.dest_fd);
        self.buffer.0.borrow_mut().push_str(&String::from_utf8_lossy(&bytes));
        Ok(())
    }

    fn term(&mut self) {
        if let Some(mut saved) = self.saved.take() {
            saved.restore();
        }
    }
}

impl Drop for StringDest {
    fn drop(&mut self) {
        if let Some(pipe) = self.pipe.take() {
            self.registry.drop_pipe(pipe);
        }
    }
}

/// Shared handle to the text captured by a string destination. Cloned from
/// the handle returned by `add_string_dest`; read it after the command has
/// been waited on.
#[derive(Debug, Clone, Default)]
pub struct OutputBuffer(Rc<RefCell<String>>);

impl OutputBuffer {
    pub fn contents(&self) -> String {
        self.0.borrow().clone()
    }

    pub fn take(&self) -> String {
        std::mem::take(&mut self.0.borrow_mut())
    }

    pub fn is_empty(&self) -> bool {
        self.0.borrow().is_empty()
    }
}
