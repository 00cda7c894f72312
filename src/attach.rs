//! Bind a negotiated session to a kernel NBD device via ioctls.
//!
//! The binder applies the export's geometry to the device, hands the socket
//! to the kernel, and parks in the `DO_IT` run loop until the session ends.
//! With `persist` an involuntary disconnect redials and renegotiates instead
//! of exiting; `EBADR` from the kernel marks a user-initiated disconnect and
//! always ends the session.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::prelude::AsRawFd;
use std::path::{Path, PathBuf};
use std::process;
use std::thread::sleep;
use std::time::Duration;

use color_eyre::eyre::{bail, WrapErr};
use color_eyre::Result;
use fork::Fork;
use log::warn;
use nix::errno::Errno;
use nix::libc::c_ulong;
use nix::sys::mman::{mlockall, MlockAllFlags};
use nix::sys::signal::{sigprocmask, SigHandler, SigSet, SigmaskHow, Signal};
use nix::unistd::{getpid, getppid, Pid};

use crate::dial::{Endpoint, Stream};
use crate::errors::ClientError;
use crate::handshake;
use crate::kernel;
use crate::proto::{HandshakeFlags, TransmitFlags};

/// Everything needed to (re)establish one ioctl-path session.
#[derive(Debug, Clone)]
pub struct AttachTarget {
    pub endpoint: Endpoint,
    pub export: String,
    pub block_size: u64,
    pub timeout: u64,
    pub persist: bool,
    pub swap: bool,
}

/// How the device will be sized: an initial block size for the
/// `SET_BLKSIZE`/`SET_SIZE_BLOCKS` pair, and the requested block size to
/// reassert afterwards when the initial one had to be widened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Sizing {
    pub initial: u64,
    pub blocks: u64,
    pub reassert: Option<u64>,
}

/// Plan the block-size/block-count pair for a device of `size` bytes.
///
/// Block counts travel through an `unsigned long` kernel interface, so when
/// `size / block_size` does not fit we set up with 4096-byte blocks first and
/// reassert the requested block size afterwards, keeping
/// `blocks * initial == size` exact throughout.
pub(crate) fn plan_sizing(size: u64, block_size: u64) -> Result<Sizing> {
    if (size >> 12) > c_ulong::MAX as u64 {
        bail!(ClientError::SizeOverflow(size));
    }
    let initial = if size / block_size <= c_ulong::MAX as u64 {
        block_size
    } else {
        4096
    };
    Ok(Sizing {
        initial,
        blocks: size / initial,
        reassert: (initial != block_size).then(|| block_size),
    })
}

/// Apply export geometry and flags to the device: block size, size in
/// blocks, a clean socket slot, transmission flags (best effort), and the
/// read-only attribute.
pub fn setsizes(nbd: &File, size: u64, block_size: u64, flags: TransmitFlags) -> Result<()> {
    let sizing = plan_sizing(size, block_size)?;
    kernel::set_blksize(nbd, sizing.initial)
        .wrap_err_with(|| format!("setting block size {}", sizing.initial))?;
    kernel::set_size_blocks(nbd, sizing.blocks)
        .wrap_err_with(|| format!("setting size to {} blocks", sizing.blocks))?;
    if let Some(bs) = sizing.reassert {
        kernel::set_blksize(nbd, bs).wrap_err_with(|| format!("setting block size {bs}"))?;
    }
    eprintln!("bs={}, sz={} bytes", sizing.initial, sizing.blocks * sizing.initial);

    let _ = kernel::clear_sock(nbd);
    // kernel may not support SET_FLAGS; ignore failure
    let _ = kernel::set_flags(nbd, flags.bits() as u64);
    kernel::set_read_only(nbd, flags.contains(TransmitFlags::READ_ONLY))
        .wrap_err("setting read-only attribute")?;
    Ok(())
}

fn apply_timeout(nbd: &File, timeout: u64) -> Result<()> {
    if timeout > 0 {
        kernel::set_timeout(nbd, timeout).wrap_err("setting NBD timeout")?;
        eprintln!("timeout={timeout}");
    }
    Ok(())
}

/// Hand the negotiated socket to the kernel and, for swap use, pin our pages
/// and drop out of the OOM killer's sights.
///
/// Page locking is best effort, except that a kernel without `mlockall`
/// cannot honor `swap` at all and fails the attach.
fn finish_sock(nbd: &File, sock: &Stream, swap: bool) -> Result<()> {
    if let Err(err) = kernel::set_sock(nbd, sock.as_raw_fd()) {
        if err.raw_os_error() == Some(Errno::EBUSY as i32) {
            bail!(ClientError::MultiConnUnsupported);
        }
        return Err(err).wrap_err("setting NBD socket");
    }
    if swap {
        match mlockall(MlockAllFlags::MCL_CURRENT | MlockAllFlags::MCL_FUTURE) {
            Ok(()) => {}
            Err(Errno::ENOSYS) => bail!(ClientError::UnsupportedFeature("swap (mlockall)")),
            Err(err) => warn!("could not lock process memory: {err}"),
        }
        oom_adjust();
    }
    Ok(())
}

// Swap over NBD must not let the OOM killer take the one process keeping the
// swap device alive.
fn oom_adjust() {
    // linux >= 2.6.36 interface first, then the legacy one
    if std::fs::write("/proc/self/oom_score_adj", "-1000").is_err() {
        let _ = std::fs::write("/proc/self/oom_adj", "-17");
    }
}

/// Did `DO_IT` return because somebody ran `--disconnect` on us?
pub(crate) fn disconnect_was_voluntary(err: &io::Error) -> bool {
    err.raw_os_error() == Some(Errno::EBADR as i32)
}

fn open_device(device: &Path) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(device)
        .wrap_err_with(|| {
            format!(
                "cannot open {}; please ensure the 'nbd' module is loaded",
                device.display()
            )
        })
}

/// An attached ioctl-path session: device handle, the socket the kernel is
/// serving from, and the parameters needed to reconnect.
pub struct Session {
    device: PathBuf,
    target: AttachTarget,
    nbd: File,
    // the kernel owns the connection now; we keep the handle alive for the
    // lifetime of the attach and drop it on reconnect
    sock: Stream,
    size: u64,
}

impl Session {
    /// Dial, negotiate, and bind `target` to `device`, leaving the session
    /// one `run()` call away from serving I/O.
    pub fn establish(device: &Path, target: AttachTarget) -> Result<Session> {
        let nbd = open_device(device)?;
        let mut sock = target.endpoint.connect()?;
        let export = handshake::negotiate(&mut sock, &target.export, HandshakeFlags::empty())?;
        setsizes(&nbd, export.size, target.block_size, export.flags)?;
        apply_timeout(&nbd, target.timeout)?;
        finish_sock(&nbd, &sock, target.swap)?;
        Ok(Session {
            device: device.to_path_buf(),
            size: export.size,
            target,
            nbd,
            sock,
        })
    }

    /// Size of the attached export in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Enter the kernel run loop and stay attached until the session ends.
    ///
    /// Spawns the post-attach open helper before each entry so the partition
    /// table gets rescanned, and with `persist` keeps redialing after
    /// involuntary disconnects.
    pub fn run(mut self) -> Result<()> {
        // the open helper is reaped implicitly
        unsafe { nix::sys::signal::signal(Signal::SIGCHLD, SigHandler::SigIgn) }
            .wrap_err("ignoring SIGCHLD")?;
        let main_pid = getpid();
        loop {
            spawn_open_helper(&self.device, main_pid);
            match kernel::do_it(&self.nbd) {
                Ok(()) => {
                    eprintln!("kernel call returned");
                    break;
                }
                Err(err) => {
                    eprintln!("nbd,{main_pid}: kernel call returned: {err}");
                    if disconnect_was_voluntary(&err) || !self.target.persist {
                        break;
                    }
                    self = self.reconnect()?;
                }
            }
        }
        print!("sock, ");
        let _ = kernel::clear_sock(&self.nbd);
        println!("done");
        Ok(())
    }

    /// Redial until the server answers, renegotiate, and rebind the device.
    /// The export must come back at its original size.
    fn reconnect(self) -> Result<Session> {
        let Session {
            device,
            target,
            nbd,
            sock,
            size,
        } = self;
        // the dead link and the device handle close before redialing
        drop(sock);
        drop(nbd);

        let mut sock = loop {
            eprintln!("reconnecting");
            match target.endpoint.connect() {
                Ok(sock) => break sock,
                Err(err) => {
                    warn!("redial failed: {err}");
                    sleep(Duration::from_secs(1));
                }
            }
        };
        let nbd = open_device(&device)?;
        let export = handshake::negotiate(&mut sock, &target.export, HandshakeFlags::empty())?;
        if export.size != size {
            bail!(ClientError::SizeChanged {
                expected: size,
                actual: export.size,
            });
        }
        setsizes(&nbd, size, target.block_size, export.flags)?;
        apply_timeout(&nbd, target.timeout)?;
        finish_sock(&nbd, &sock, target.swap)?;
        Ok(Session {
            device,
            target,
            nbd,
            sock,
            size,
        })
    }
}

/// Fork the post-attach open helper.
///
/// The kernel cannot reread the partition table from inside the `DO_IT`
/// ioctl, so a first open of the device after the attach has to do it. The
/// helper polls the sysfs pid node until the device is attached, opens the
/// device read-only once, and exits. All signals except KILL/TERM/PIPE are
/// blocked across the fork so the helper never runs inherited handlers; the
/// parent's mask is restored right after.
fn spawn_open_helper(device: &Path, parent: Pid) {
    let mut block = SigSet::all();
    block.remove(Signal::SIGKILL);
    block.remove(Signal::SIGTERM);
    block.remove(Signal::SIGPIPE);
    let mut old = SigSet::empty();
    if let Err(err) = sigprocmask(SigmaskHow::SIG_SETMASK, Some(&block), Some(&mut old)) {
        warn!("could not block signals around helper fork: {err}");
        return;
    }
    match fork::fork() {
        Ok(Fork::Child) => {
            open_helper(device, parent);
            process::exit(0);
        }
        Ok(Fork::Parent(_)) => {}
        Err(errno) => warn!("could not fork open helper: errno {errno}"),
    }
    if let Err(err) = sigprocmask(SigmaskHow::SIG_SETMASK, Some(&old), None) {
        warn!("could not restore signal mask: {err}");
    }
}

fn open_helper(device: &Path, parent: Pid) {
    let device_name = device.to_string_lossy();
    loop {
        match kernel::attached_pid(&device_name) {
            Ok(Some(_)) => break,
            // parent gone means the attach failed; nothing left to rescan
            _ if getppid() != parent => return,
            _ => sleep(Duration::from_millis(100)),
        }
    }
    let _ = File::open(device);
}
