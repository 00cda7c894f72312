//! Generic-netlink path for binding NBD devices.
//!
//! Unlike the ioctl path, the netlink interface hands a whole set of
//! negotiated sockets to the kernel in one `CONNECT` transaction, lets the
//! kernel pick the device index, and can rebind a fresh socket into a live
//! device on a `LINK_DEAD` notification.

#[cfg(not(target_os = "linux"))]
compile_error!("the NBD netlink interface only exists on Linux");

use std::os::unix::prelude::{AsRawFd, RawFd};
use std::thread::sleep;
use std::time::Duration;

use color_eyre::eyre::{bail, eyre, WrapErr};
use color_eyre::Result;
use log::warn;
use neli::{
    consts::genl::NlAttrType,
    consts::nl::{NlmF, NlmFFlags},
    consts::socket::NlFamily,
    err::NlError,
    genl::{Genlmsghdr, Nlattr},
    impl_var,
    nl::{NlPayload, Nlmsghdr},
    socket::NlSocketHandle,
    types::{Buffer, GenlBuffer},
    Nl,
};

use crate::attach::AttachTarget;
use crate::errors::ClientError;
use crate::handshake::{self, Export};
use crate::proto::HandshakeFlags;

impl_var!(
    NbdCmd, u8,
    Unspec => 0,
    Connect => 1,
    Disconnect => 2,
    Reconfigure => 3,
    LinkDead => 4,
    Status => 5
);
impl neli::consts::genl::Cmd for NbdCmd {}

impl_var!(
    NbdAttr, u16,
    Unspec => 0,
    Index => 1,
    SizeBytes => 2,
    BlockSizeBytes => 3,
    Timeout => 4,
    ServerFlags => 5,
    ClientFlags => 6,
    Sockets => 7,
    DeadConnTimeout => 8,
    DeviceList => 9
);
impl NlAttrType for NbdAttr {}

impl_var!(
    NbdSockItem, u16,
    Unspec => 0,
    Item => 1
);
impl NlAttrType for NbdSockItem {}

impl_var!(
    NbdSock, u16,
    Unspec => 0,
    Fd => 1
);
impl NlAttrType for NbdSock {}

/// Tear the device down when the last connection drops.
pub const CFLAG_DESTROY_ON_DISCONNECT: u64 = 1 << 0;
/// Disconnect the device on its final close.
pub const CFLAG_DISCONNECT_ON_CLOSE: u64 = 1 << 1;

const FAMILY_NAME: &str = "nbd";
const MCAST_GROUP_NAME: &str = "nbd_mc_group";

fn attr<T: NlAttrType, P: Nl>(t: T, p: P) -> Result<Nlattr<T, Buffer>, NlError> {
    Nlattr::new(None, false, false, t, p)
}

fn sockets_attr(fds: &[RawFd]) -> Result<Nlattr<NbdAttr, Buffer>, NlError> {
    let mut sockets = Nlattr::new(None, true, false, NbdAttr::Sockets, Buffer::new())?;
    for fd in fds {
        sockets.add_nested_attribute(&Nlattr::new(
            None,
            true,
            false,
            NbdSockItem::Item,
            attr(NbdSock::Fd, *fd)?,
        )?)?;
    }
    Ok(sockets)
}

/// Control connection to the kernel's `nbd` generic-netlink family.
pub struct NbdNetlink {
    nl: NlSocketHandle,
    family: u16,
}

impl NbdNetlink {
    /// Open a generic-netlink socket and resolve the `nbd` family.
    pub fn new() -> Result<Self> {
        let mut nl = NlSocketHandle::new(NlFamily::Generic)
            .wrap_err("opening generic netlink socket")?;
        let family = nl.resolve_genl_family(FAMILY_NAME).wrap_err(
            "could not resolve the nbd netlink family; make sure the nbd module is \
             loaded and your nbd driver supports the netlink interface",
        )?;
        Ok(Self { nl, family })
    }

    fn send(
        &mut self,
        cmd: NbdCmd,
        flags: &[NlmF],
        attrs: GenlBuffer<NbdAttr, Buffer>,
    ) -> Result<()> {
        let genl = Genlmsghdr::new(cmd, 1, attrs);
        let msg = Nlmsghdr::new(
            None,
            self.family,
            NlmFFlags::new(flags),
            None,
            None,
            NlPayload::Payload(genl),
        );
        self.nl.send(msg).wrap_err("sending nbd netlink message")?;
        Ok(())
    }

    fn recv_ack(&mut self) -> Result<()> {
        let resp: Option<Nlmsghdr<u16, Genlmsghdr<NbdCmd, NbdAttr>>> =
            self.nl.recv().wrap_err("netlink transaction failed")?;
        if let Some(msg) = resp {
            if let NlPayload::Err(err) = msg.nl_payload {
                bail!("netlink transaction failed: {err:?}");
            }
        }
        Ok(())
    }

    /// Bundle all negotiated sockets and per-device tunables into one
    /// `CONNECT` and return the index the kernel assigned.
    ///
    /// Every fd must belong to a fully negotiated connection. The kernel
    /// owns them once this returns; the caller closes its handles afterwards.
    pub fn connect(
        &mut self,
        index: Option<u32>,
        export: &Export,
        block_size: u64,
        timeout: u64,
        dead_timeout: u64,
        client_flags: u64,
        fds: &[RawFd],
    ) -> Result<u32> {
        let mut attrs = GenlBuffer::new();
        if let Some(index) = index {
            attrs.push(attr(NbdAttr::Index, index)?);
        }
        attrs.push(attr(NbdAttr::SizeBytes, export.size)?);
        attrs.push(attr(NbdAttr::BlockSizeBytes, block_size)?);
        attrs.push(attr(NbdAttr::ServerFlags, export.flags.bits() as u64)?);
        attrs.push(attr(NbdAttr::Timeout, timeout)?);
        attrs.push(attr(NbdAttr::DeadConnTimeout, dead_timeout)?);
        attrs.push(attr(NbdAttr::ClientFlags, client_flags)?);
        attrs.push(sockets_attr(fds)?);
        self.send(NbdCmd::Connect, &[NlmF::Request], attrs)?;

        let resp: Nlmsghdr<u16, Genlmsghdr<NbdCmd, NbdAttr>> = self
            .nl
            .recv()
            .wrap_err("failed to set up device, check dmesg")?
            .ok_or_else(|| eyre!("no response to nbd connect"))?;
        let index = resp
            .get_payload()?
            .get_attr_handle()
            .get_attr_payload_as::<u32>(NbdAttr::Index)
            .wrap_err("did not receive an index from the kernel")?;
        Ok(index)
    }

    /// Ask the kernel to tear down device `index`.
    pub fn disconnect(&mut self, index: u32) -> Result<()> {
        let mut attrs = GenlBuffer::new();
        attrs.push(attr(NbdAttr::Index, index)?);
        self.send(NbdCmd::Disconnect, &[NlmF::Request, NlmF::Ack], attrs)?;
        self.recv_ack().wrap_err("failed to disconnect device")
    }

    /// Rebind one fresh, fully negotiated socket into live device `index`.
    pub fn reconfigure(&mut self, index: u32, fd: RawFd) -> Result<()> {
        let mut attrs = GenlBuffer::new();
        attrs.push(attr(NbdAttr::Index, index)?);
        attrs.push(sockets_attr(&[fd])?);
        self.send(NbdCmd::Reconfigure, &[NlmF::Request, NlmF::Ack], attrs)?;
        self.recv_ack().wrap_err("could not reconfigure device")
    }
}

/// Parse the device index out of `/dev/nbdN` (or a bare `nbdN`).
pub fn parse_index(device: &str) -> Result<u32> {
    let name = device.strip_prefix("/dev/").unwrap_or(device);
    name.strip_prefix("nbd")
        .and_then(|idx| idx.parse().ok())
        .ok_or_else(|| eyre!(ClientError::InvalidDevice(device.to_string())))
}

/// Dial with bounded retries: one attempt, then up to `dead_timeout` more
/// with one second between them. `dead_timeout == 0` means a single attempt.
fn redial<T, E, F>(mut dial: F, dead_timeout: u64) -> Option<T>
where
    E: std::fmt::Display,
    F: FnMut() -> std::result::Result<T, E>,
{
    let mut retries = 0;
    loop {
        match dial() {
            Ok(sock) => return Some(sock),
            Err(err) => warn!("reconnect attempt failed: {err}"),
        }
        if retries >= dead_timeout {
            return None;
        }
        retries += 1;
        sleep(Duration::from_secs(1));
    }
}

/// Watch the `nbd` multicast group and repair dead links.
///
/// On `LINK_DEAD` for some index: redial within the dead-timeout budget,
/// renegotiate from scratch, and `RECONFIGURE` the fresh socket into the
/// device. All other notifications are ignored. Runs until the netlink
/// socket fails.
pub fn monitor(target: &AttachTarget, dead_timeout: u64) -> Result<()> {
    let mut mcast = NlSocketHandle::new(NlFamily::Generic)
        .wrap_err("opening generic netlink socket")?;
    let group = mcast
        .resolve_nl_mcast_group(FAMILY_NAME, MCAST_GROUP_NAME)
        .wrap_err("could not find the nbd multicast group")?;
    mcast
        .add_mcast_membership(&[group])
        .wrap_err("joining the nbd multicast group")?;
    let mut control = NbdNetlink::new()?;

    loop {
        let msg: Nlmsghdr<u16, Genlmsghdr<NbdCmd, NbdAttr>> =
            match mcast.recv().wrap_err("receiving nbd notification")? {
                Some(msg) => msg,
                None => continue,
            };
        let payload = match msg.get_payload() {
            Ok(payload) => payload,
            Err(err) => {
                warn!("invalid message from the kernel: {err}");
                continue;
            }
        };
        if payload.cmd != NbdCmd::LinkDead {
            continue;
        }
        let index = match payload
            .get_attr_handle()
            .get_attr_payload_as::<u32>(NbdAttr::Index)
        {
            Ok(index) => index,
            Err(_) => {
                warn!("link-dead notification without an index");
                continue;
            }
        };
        println!("disconnect on index {index}");

        let mut sock = match redial(|| target.endpoint.connect(), dead_timeout) {
            Some(sock) => sock,
            None => {
                warn!("couldn't reconnect to the server");
                continue;
            }
        };
        handshake::negotiate(&mut sock, &target.export, HandshakeFlags::empty())?;
        control.reconfigure(index, sock.as_raw_fd())?;
        // the kernel has taken over; drop our handle
    }
}

#[cfg(test)]
mod tests {
    use super::{parse_index, redial};
    use crate::errors::ClientError;

    #[test]
    fn device_index_parsing() {
        assert_eq!(parse_index("/dev/nbd0").unwrap(), 0);
        assert_eq!(parse_index("nbd12").unwrap(), 12);
        for bad in ["/dev/sda", "nbd", "nbdx", "/dev/nbd-1"] {
            let err = parse_index(bad).unwrap_err();
            assert!(matches!(
                err.downcast_ref::<ClientError>(),
                Some(ClientError::InvalidDevice(_))
            ));
        }
    }

    #[test]
    fn zero_dead_timeout_gives_up_after_one_attempt() {
        let mut attempts = 0;
        let result: Option<()> = redial(
            || {
                attempts += 1;
                Err::<(), _>("connection refused")
            },
            0,
        );
        assert!(result.is_none());
        assert_eq!(attempts, 1);
    }

    #[test]
    fn redial_retries_within_the_dead_timeout_budget() {
        let mut attempts = 0;
        let result = redial(
            || {
                attempts += 1;
                if attempts < 3 {
                    Err("connection refused")
                } else {
                    Ok(attempts)
                }
            },
            3,
        );
        assert_eq!(result, Some(3));
    }
}
