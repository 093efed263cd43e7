//! RCON clients for the two Valve engine families: Source (TCP) and
//! GoldSource (UDP with challenge-response).

use std::time::Duration;

use err_derive::Error;

pub mod goldsrc;
pub mod source;

pub use goldsrc::GoldSrcConnection;
pub use source::SourceConnection;

#[derive(Debug, Error)]
pub enum Error {
    #[error(display = "connection failed: {}", _0)]
    ConnectionFailed(String),
    #[error(display = "authentication failed")]
    AuthFailed,
    #[error(display = "timed out after {:?}", _0)]
    Timeout(Duration),
    #[error(display = "invalid response: {}", _0)]
    InvalidResponse(String),
    #[error(display = "not connected")]
    NotConnected,
    #[error(display = "command failed: {}", _0)]
    CommandFailed(String),
    #[error(display = "invalid credentials: {}", _0)]
    InvalidCredentials(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Connect and per-command deadlines shared by both protocol clients.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub connect: Duration,
    pub command: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(5),
            command: Duration::from_secs(3),
        }
    }
}
