//! Failure classes that callers need to tell apart.
//!
//! Everything OS-level (dial, wire reads and writes, ioctls, netlink
//! transactions) is propagated as the underlying error wrapped with eyre
//! context; the variants here cover the protocol- and policy-level failures
//! that change what the caller does next.

use std::error::Error;
use std::fmt;
use std::path::PathBuf;

/// Errors raised by negotiation, configuration, and device binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// The server broke the newstyle handshake framing.
    Handshake(String),
    /// The server spoke the pre-2.10 oldstyle protocol.
    LegacyServer,
    /// A requested feature is not compiled into or supported by this build.
    UnsupportedFeature(&'static str),
    /// The export is too large for the kernel's block-count interface.
    SizeOverflow(u64),
    /// A persist reconnect negotiated a different export size.
    SizeChanged { expected: u64, actual: u64 },
    /// A Unix socket path does not fit in `sockaddr_un`.
    PathTooLong(PathBuf),
    /// No nbdtab record exists for the device.
    NotFound(String),
    /// An nbdtab record could not be parsed.
    Config { line: usize, reason: String },
    /// The device name does not look like an nbd device.
    InvalidDevice(String),
    /// The kernel refused a second socket on the ioctl path.
    MultiConnUnsupported,
    /// The server forbids listing exports (`NBD_REP_ERR_POLICY`).
    ListDenied(Option<String>),
    /// The server answered the list option with some other error reply.
    ListRefused { code: u32, message: Option<String> },
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ClientError::Handshake(msg) => write!(f, "nbd handshake error: {msg}"),
            ClientError::LegacyServer => write!(
                f,
                "it looks like you're trying to connect to an oldstyle server; \
                 this is no longer supported since nbd 3.10"
            ),
            ClientError::UnsupportedFeature(what) => {
                write!(f, "{what} is not supported by this build")
            }
            ClientError::SizeOverflow(size) => {
                write!(f, "exported device of {size} bytes is too big for this machine")
            }
            ClientError::SizeChanged { expected, actual } => write!(
                f,
                "size of the device changed ({expected} bytes -> {actual} bytes)"
            ),
            ClientError::PathTooLong(path) => {
                write!(f, "unix socket path {} is too long", path.display())
            }
            ClientError::NotFound(dev) => {
                write!(f, "no valid configuration for device {dev} found")
            }
            ClientError::Config { line, reason } => {
                write!(f, "nbdtab line {line}: {reason}")
            }
            ClientError::InvalidDevice(dev) => write!(f, "invalid nbd device target {dev}"),
            ClientError::MultiConnUnsupported => {
                write!(f, "kernel does not support multiple connections")
            }
            ClientError::ListDenied(msg) => {
                write!(f, "listing not allowed by server")?;
                if let Some(msg) = msg {
                    write!(f, " (server said: {msg})")?;
                }
                Ok(())
            }
            ClientError::ListRefused { code, message } => {
                write!(f, "unexpected error {code:#x} from server")?;
                if let Some(msg) = message {
                    write!(f, " (server said: {msg})")?;
                }
                Ok(())
            }
        }
    }
}

impl Error for ClientError {}
