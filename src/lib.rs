//! Run external commands and wire them into pipelines.
//!
//! A [`Registry`] holds the command table, the pipe arena and the error sink.
//! [`Command`]s are built against a registry, given redirections (files,
//! pipes, in-memory strings) and started; forked commands run in a child
//! process and their terminations are collected asynchronously, inline
//! commands run a callback in place. See [`Command::wait`] for job-control
//! style waiting with terminal foreground handover.
//!
//! ```no_run
//! use cmdpipe::{Command, Registry};
//!
//! # fn main() -> cmdpipe::Result<()> {
//! let registry = Registry::new();
//!
//! let produce = Command::new(&registry, "ls", "ls", ["-l"]);
//! produce.add_pipe_dest(1);
//! let consume = Command::new(&registry, "wc", "wc", ["-l"]);
//! consume.add_pipe_src()?;
//! let lines = consume.add_string_dest(1);
//!
//! produce.start()?;
//! consume.start()?;
//! produce.wait()?;
//! consume.wait()?;
//! println!("{}", lines.contents());
//! # Ok(())
//! # }
//! ```

mod command;
mod dest;
mod error;
mod fdutil;
mod pipe;
mod reaper;
mod registry;
mod source;

pub use command::{Command, State};
pub use dest::OutputBuffer;
pub use error::{CommandError, Result};
pub use registry::{CommandId, Registry};
