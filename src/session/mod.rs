//! Interactive shell sessions: the SSH transport and the prompt protocol
//! spoken over it.

pub mod prompt;
pub mod ssh;

use std::io;
use std::time::Duration;

use crate::config::Credentials;
use crate::error::PollResult;

/// Byte stream of an interactive shell.
pub trait ShellChannel {
    /// Reads whatever is ready without waiting. `Ok(None)` means nothing is
    /// available yet; `Ok(Some(0))` means the remote side closed the stream.
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>>;

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;
}

/// One connection plus its shell channel, scoped to a single poll attempt.
pub trait ShellSession: ShellChannel + Send {
    /// Idempotent. Implementations also call this on drop.
    fn close(&mut self);
}

pub trait ShellTransport: Send + Sync + 'static {
    type Session: ShellSession;

    fn open(
        &self,
        address: &str,
        credentials: &Credentials,
        connect_timeout: Duration,
    ) -> PollResult<Self::Session>;
}
