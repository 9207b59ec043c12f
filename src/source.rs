use std::fs::File;
use std::io::Write;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::PathBuf;

use log::*;

use crate::error::{CommandError, Result};
use crate::fdutil::{redirect, RedirCtx, SavedFd};
use crate::pipe::PipeId;
use crate::registry::Registry;

/// Where a command's standard input comes from. Closed set of variants; each
/// implements the init-parent / init-child / process / term protocol driven
/// by the owning command at the matching points of `start`.
#[derive(Debug)]
pub(crate) enum Source {
    File(FileSource),
    Pipe(PipeSource),
    Str(StringSource),
}

impl Source {
    pub(crate) fn file(path: PathBuf) -> Self {
        Source::File(FileSource { path: Some(path), fd: None, saved: None })
    }

    pub(crate) fn file_handle(fd: OwnedFd) -> Self {
        Source::File(FileSource { path: None, fd: Some(fd), saved: None })
    }

    pub(crate) fn pipe(registry: Registry, pipe: PipeId) -> Self {
        Source::Pipe(PipeSource { registry, pipe: Some(pipe), saved: None })
    }

    pub(crate) fn string(registry: Registry, text: String) -> Self {
        Source::Str(StringSource { registry, text, pipe: None, saved: None })
    }

    pub(crate) fn init_parent(&mut self, registry: &Registry, cx: &RedirCtx) -> Result<()> {
        match self {
            Source::File(src) => src.init_parent(registry),
            Source::Pipe(_) => Ok(()),
            Source::Str(src) => src.init_parent(registry, cx),
        }
    }

    pub(crate) fn init_child(&mut self, registry: &Registry, cx: &RedirCtx) -> Result<()> {
        match self {
            Source::File(src) => src.init_child(registry, cx),
            Source::Pipe(src) => src.init_child(registry, cx),
            Source::Str(_) => Ok(()),
        }
    }

    pub(crate) fn process(&mut self, registry: &Registry, _cx: &RedirCtx) -> Result<()> {
        match self {
            Source::Str(src) => src.process(registry),
            _ => Ok(()),
        }
    }

    pub(crate) fn term(&mut self, registry: &Registry, cx: &RedirCtx) {
        match self {
            Source::File(src) => src.term(),
            Source::Pipe(src) => src.term(registry, cx),
            Source::Str(_) => {}
        }
    }
}

/// Standard input from a named file (opened read-only in the parent) or a
/// pre-opened handle.
#[derive(Debug)]
pub(crate) struct FileSource {
    path: Option<PathBuf>,
    fd: Option<OwnedFd>,
    saved: Option<SavedFd>,
}

impl FileSource {
    fn init_parent(&mut self, registry: &Registry) -> Result<()> {
        if let Some(path) = &self.path {
            match File::open(path) {
                Ok(file) => self.fd = Some(file.into()),
                Err(err) => {
                    registry.report(CommandError::OpenFile { path: path.clone(), source: err })?
                }
            }
        }
        Ok(())
    }

    fn init_child(&mut self, registry: &Registry, cx: &RedirCtx) -> Result<()> {
        let Some(raw) = self.fd.as_ref().map(|fd| fd.as_raw_fd()) else {
            return Ok(());
        };
        if cx.forked {
            if let Err(err) = redirect(raw, 0) {
                registry.report(err)?;
            }
            // the dup is all the child needs
            self.fd = None;
        } else {
            match SavedFd::save(0) {
                Ok(saved) => self.saved = Some(saved),
                Err(err) => registry.report(err)?,
            }
            if let Err(err) = redirect(raw, 0) {
                registry.report(err)?;
            }
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

/// Standard input from the read end of a pipe published by the previous
/// pipeline stage. The source side owns the shared arena entry.
#[derive(Debug)]
pub(crate) struct PipeSource {
    registry: Registry,
    pipe: Option<PipeId>,
    saved: Option<SavedFd>,
}

impl PipeSource {
    fn init_child(&mut self, registry: &Registry, cx: &RedirCtx) -> Result<()> {
        let Some(pipe) = self.pipe else {
            return Ok(());
        };
        if cx.forked {
            if let Some(raw) = registry.pipe_read_fd(pipe) {
                if let Err(err) = redirect(raw, 0) {
                    registry.report(err)?;
                }
            }
            registry.close_pipe_read(pipe);
            // the write end belongs to the upstream stage
            registry.close_pipe_write(pipe);
        } else {
            match SavedFd::save(0) {
                Ok(saved) => self.saved = Some(saved),
                Err(err) => registry.report(err)?,
            }
            if let Some(raw) = registry.pipe_read_fd(pipe) {
                if let Err(err) = redirect(raw, 0) {
                    registry.report(err)?;
                }
            }
            registry.close_pipe_read(pipe);
        }
        Ok(())
    }

    fn term(&mut self, registry: &Registry, cx: &RedirCtx) {
        if let Some(pipe) = self.pipe {
            registry.close_pipe_read(pipe);
            if cx.forked {
                registry.close_pipe_write(pipe);
            }
        }
        if let Some(mut saved) = self.saved.take() {
            saved.restore();
        }
    }
}

impl Drop for PipeSource {
    fn drop(&mut self) {
        if let Some(pipe) = self.pipe.take() {
            self.registry.drop_pipe(pipe);
        }
    }
}

/// Standard input from an in-memory buffer. A private pipe is created before
/// the fork and its read end planted on fd 0, so the child simply inherits
/// it; the payload is written by the parent afterwards, from the only process
/// still holding a write-capable end, then the pipe is closed.
#[derive(Debug)]
pub(crate) struct StringSource {
    registry: Registry,
    text: String,
    pipe: Option<PipeId>,
    saved: Option<SavedFd>,
}

impl StringSource {
    fn init_parent(&mut self, registry: &Registry, _cx: &RedirCtx) -> Result<()> {
        // Deliberately unowned by either command id: the child's own copy of
        // both ends must go away in the post-fork sweep, leaving fd 0 as the
        // child's only handle and the parent's write end as the only writer.
        let pipe = match registry.new_pipe(None, None) {
            Ok(pipe) => pipe,
            Err(err) => return registry.report(err),
        };
        self.pipe = Some(pipe);
        match SavedFd::save(0) {
            Ok(saved) => self.saved = Some(saved),
            Err(err) => registry.report(err)?,
        }
        if let Some(raw) = registry.pipe_read_fd(pipe) {
            if let Err(err) = redirect(raw, 0) {
                registry.report(err)?;
            }
        }
        Ok(())
    }

    fn process(&mut self, registry: &Registry) -> Result<()> {
        if let Some(mut saved) = self.saved.take() {
            saved.restore();
        }
        let Some(pipe) = self.pipe else {
            return Ok(());
        };
        registry.close_pipe_read(pipe);
        if let Some(write_end) = registry.take_pipe_write(pipe) {
            trace!("writing {} byte string payload", self.text.len());
            let mut file = File::from(write_end);
            if let Err(err) = file.write_all(self.text.as_bytes()) {
                registry.report(CommandError::Write(err))?;
            }
            // dropping the file closes the write end, delivering EOF
        }
        Ok(())
    }
}

impl Drop for StringSource {
    fn drop(&mut self) {
        if let Some(pipe) = self.pipe.take() {
            self.registry.drop_pipe(pipe);
        }
    }
}
