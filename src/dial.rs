//! Stream-socket dialing for NBD sessions.
//!
//! Network dialing resolves the host and tries every candidate address, IPv4
//! or IPv6, until one accepts the connection.

use std::io::{self, prelude::*};
use std::net::{TcpStream, ToSocketAddrs};
use std::os::unix::net::UnixStream;
use std::os::unix::prelude::{AsRawFd, IntoRawFd, OsStrExt, RawFd};
use std::path::{Path, PathBuf};

use color_eyre::eyre::{bail, eyre, WrapErr};
use color_eyre::Result;
use log::warn;
use nix::sys::socket::{setsockopt, sockopt};

use crate::errors::ClientError;

/// Capacity of `sockaddr_un.sun_path`, including the terminating NUL.
const UNIX_PATH_MAX: usize = 108;

/// Where an NBD server lives. Cheap to clone so reconnect loops can redial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Net {
        host: String,
        port: u16,
        sdp: bool,
    },
    Unix {
        path: PathBuf,
    },
}

impl Endpoint {
    /// Dial this endpoint and return a connected stream.
    pub fn connect(&self) -> Result<Stream> {
        match self {
            Endpoint::Net { host, port, sdp } => Ok(Stream::Tcp(tcp(host, *port, *sdp)?)),
            Endpoint::Unix { path } => Ok(Stream::Unix(unix(path)?)),
        }
    }
}

/// A connected socket, TCP or Unix, moved as a linear value: once its fd has
/// been handed to the kernel the `Stream` is dropped or forgotten, never
/// written again.
#[derive(Debug)]
pub enum Stream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.read(buf),
            Stream::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.write(buf),
            Stream::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.flush(),
            Stream::Unix(s) => s.flush(),
        }
    }
}

impl AsRawFd for Stream {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Stream::Tcp(s) => s.as_raw_fd(),
            Stream::Unix(s) => s.as_raw_fd(),
        }
    }
}

impl IntoRawFd for Stream {
    fn into_raw_fd(self) -> RawFd {
        match self {
            Stream::Tcp(s) => s.into_raw_fd(),
            Stream::Unix(s) => s.into_raw_fd(),
        }
    }
}

/// Connect to `host:port`, trying every resolved address until one accepts.
///
/// The port is numeric by construction. SDP rewriting of the address family
/// is not compiled into this build and is rejected up front.
pub fn tcp(host: &str, port: u16, sdp: bool) -> Result<TcpStream> {
    if sdp {
        bail!(ClientError::UnsupportedFeature("SDP"));
    }
    let addrs = (host, port)
        .to_socket_addrs()
        .wrap_err_with(|| format!("resolving {host}:{port}"))?;
    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect(addr) {
            Ok(stream) => {
                set_client_sockopts(&stream);
                return Ok(stream);
            }
            Err(err) => last_err = Some(err),
        }
    }
    match last_err {
        Some(err) => Err(err).wrap_err_with(|| format!("connecting to {host}:{port}")),
        None => Err(eyre!("{host}:{port} resolved to no addresses")),
    }
}

fn set_client_sockopts(stream: &TcpStream) {
    if let Err(err) = stream.set_nodelay(true) {
        warn!("could not set TCP_NODELAY: {err}");
    }
    if let Err(err) = setsockopt(stream.as_raw_fd(), sockopt::KeepAlive, &true) {
        warn!("could not set SO_KEEPALIVE: {err}");
    }
}

/// Connect to a Unix-domain socket at `path`.
pub fn unix(path: &Path) -> Result<UnixStream> {
    if path.as_os_str().as_bytes().len() >= UNIX_PATH_MAX {
        bail!(ClientError::PathTooLong(path.to_path_buf()));
    }
    UnixStream::connect(path).wrap_err_with(|| format!("connecting to {}", path.display()))
}
