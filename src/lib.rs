//! Client-side tools for the Linux Network Block Device (NBD).
//!
//! This crate negotiates the newstyle NBD handshake with a remote server and
//! binds the resulting connection to a local `/dev/nbdX` device, either
//! through the legacy per-device ioctls or through the kernel's generic
//! netlink interface. It also resolves device-addressed invocations from
//! `/etc/nbdtab` and can list a server's exports.
//!
//! See <https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md>
//! for the protocol description.

pub mod attach;
pub mod dial;
pub mod errors;
pub mod handshake;
pub mod kernel;
pub mod nbdtab;
pub mod netlink;
pub mod proto;
