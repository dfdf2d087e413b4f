//! FTP client contract for firmware downloads.
//!
//! The library does not ship a network stack; a host that wants built-in
//! downloads supplies an [`FtpClient`]. Transfers are pumped from the tick
//! loop: every [`FtpDownload::poll`] call does a bounded amount of work and
//! never blocks.

use thiserror::Error;

/// Why a transfer connection went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FtpCloseReason {
    /// The whole file arrived.
    Completed,
    /// The local side gave up (writer returned 0).
    Aborted,
    /// Connection or protocol failure.
    Error,
}

/// Progress of an ongoing transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FtpPoll {
    /// Transfer still running; poll again next tick.
    Active,
    /// Connection closed for the given reason.
    Closed(FtpCloseReason),
}

#[derive(Debug, Error)]
pub enum FtpError {
    #[error("Unsupported firmware location: {0}")]
    UnsupportedUrl(String),

    #[error("FTP connection failed: {0}")]
    Connect(String),
}

/// One in-flight download.
pub trait FtpDownload {
    /// Advance the transfer by one bounded step, handing any received bytes
    /// to `sink`. `sink` returns how many bytes it accepted, in
    /// `1..=chunk.len()`; returning 0 aborts the download.
    fn poll(&mut self, sink: &mut dyn FnMut(&[u8]) -> usize) -> FtpPoll;
}

/// Factory for downloads; typically wraps the host's TCP/TLS stack.
pub trait FtpClient {
    fn open_download(&mut self, location: &str) -> Result<Box<dyn FtpDownload>, FtpError>;
}
