use std::path::PathBuf;

use nix::errno::Errno;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CommandError>;

/// Failure currency for the whole crate. Setup failures are reported through
/// the registry's error sink, which records the message and either swallows
/// or returns the error depending on the raise-on-error flag.
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("{op}: {source}")]
    Sys {
        op: &'static str,
        #[source]
        source: Errno,
    },
    #[error("{}: {source}", path.display())]
    OpenFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{}: File exists.", .0.display())]
    FileExists(PathBuf),
    #[error("{}: No such file or directory.", .0.display())]
    MissingFile(PathBuf),
    #[error("no pipe destination for source")]
    NoPipeDestination,
    #[error("pipe destination was never linked to a source")]
    UnlinkedPipeDestination,
    #[error("[{pid}] kill: {source}")]
    SignalDelivery {
        pid: i32,
        #[source]
        source: Errno,
    },
    #[error("fork: {0}")]
    Fork(#[source] Errno),
    #[error("execvp: {program}: {source}")]
    Exec {
        program: String,
        #[source]
        source: Errno,
    },
    #[error("write: {0}")]
    Write(#[source] std::io::Error),
    #[error("read: {0}")]
    Read(#[source] std::io::Error),
}
