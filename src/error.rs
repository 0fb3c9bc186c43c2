use thiserror::Error;

/// The error taxonomy for `memhook`. Kinds, not types: each variant maps to
/// exactly one of the failure modes a caller needs to branch on.
#[derive(Debug, Error)]
pub enum Error {
    #[error("no process is attached")]
    Detached,

    #[error("permission denied by ptrace; run as root")]
    Permission,

    #[error("partial transfer while accessing target memory at {address:#x}")]
    TransportFailure { address: u64 },

    #[error("failed to decode instruction bytes at {address:#x}")]
    DecodeFailure { address: u64 },

    #[error("a scan or tracking session is already in progress")]
    Busy,

    #[error("differential scan requested with no baseline snapshot")]
    NoBaseline,

    #[error("malformed AOB string: {0}")]
    ParseError(String),

    #[error("all four hardware breakpoint slots are in use")]
    SlotExhausted,

    #[error("an active patch already exists at {0:#x}")]
    PatchConflict(u64),

    #[error("ptrace request failed")]
    Ptrace(#[from] nix::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Maps a `ptrace`-originated failure to `Permission` on `EPERM`, which
    /// almost always means the caller isn't running as root or isn't the
    /// tracee's parent; anything else falls through to the generic `Ptrace`
    /// wrapper.
    pub(crate) fn from_ptrace(err: nix::Error) -> Error {
        match err {
            nix::Error::Sys(nix::errno::Errno::EPERM) => Error::Permission,
            other => Error::Ptrace(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
