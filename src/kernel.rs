//! Kernel side of an attach: the per-device NBD ioctls and the sysfs
//! attached-pid probe.
//!
//! The device binder drives these in a fixed order (geometry, flags,
//! timeout, socket, then the run loop); the probe is what the post-attach
//! open helper and check mode poll. Request codes are from
//! <https://github.com/NetworkBlockDevice/nbd/blob/master/nbd.h>.

#![deny(missing_docs)]

use std::{
    fs::File,
    io,
    os::unix::prelude::{AsRawFd, RawFd},
    path::PathBuf,
};

use nix::libc::c_int;

mod ioctl {
    use nix::{ioctl_none_bad, ioctl_write_int_bad, ioctl_write_ptr_bad, request_code_none};
    const NBD_IOCTL: u8 = 0xAB;
    ioctl_write_int_bad!(set_sock, request_code_none!(NBD_IOCTL, 0));
    ioctl_write_int_bad!(set_blksize, request_code_none!(NBD_IOCTL, 1));
    // set_size (2) takes a byte count; devices are sized through
    // set_blksize + set_size_blocks here instead
    ioctl_none_bad!(do_it, request_code_none!(NBD_IOCTL, 3));
    ioctl_none_bad!(clear_sock, request_code_none!(NBD_IOCTL, 4));
    // deprecated
    // ioctl_none_bad!(clear_que, request_code_none!(NBD_IOCTL, 5));
    // ioctl_none_bad!(print_debug, request_code_none!(NBD_IOCTL, 6));
    ioctl_write_int_bad!(set_size_blocks, request_code_none!(NBD_IOCTL, 7));
    ioctl_none_bad!(disconnect, request_code_none!(NBD_IOCTL, 8));
    ioctl_write_int_bad!(set_timeout, request_code_none!(NBD_IOCTL, 9));
    ioctl_write_int_bad!(set_flags, request_code_none!(NBD_IOCTL, 10));
    // BLKROSET lives in the generic block layer, not the NBD range
    ioctl_write_ptr_bad!(blkroset, request_code_none!(0x12, 93), nix::libc::c_int);
}

/// Bind the negotiated socket `sock` to the device open at `f`; the kernel
/// serves block I/O from it once [`do_it`] is entered. `EBUSY` means the
/// device already holds a socket.
pub fn set_sock(f: &File, sock: RawFd) -> io::Result<()> {
    let fd = f.as_raw_fd();
    unsafe { ioctl::set_sock(fd, sock as i32)? };
    Ok(())
}

/// Park in the kernel serving the attached session; returns only when the
/// device disconnects. `EBADR` marks a disconnect requested from userspace,
/// anything else is an involuntary link failure the persist loop may redial.
pub fn do_it(f: &File) -> io::Result<()> {
    let fd = f.as_raw_fd();
    unsafe { ioctl::do_it(fd)? };
    Ok(())
}

/// Set the device's block size in bytes. Issued again after
/// [`set_size_blocks`] when the sizing plan had to widen the block size to
/// keep the block count inside an `unsigned long`.
pub fn set_blksize(f: &File, blksize: u64) -> io::Result<()> {
    let fd = f.as_raw_fd();
    unsafe { ioctl::set_blksize(fd, blksize as i32)? };
    Ok(())
}

/// Set the device length as a count of current-block-size blocks; together
/// with [`set_blksize`] this pins the export's exact byte size.
pub fn set_size_blocks(f: &File, blocks: u64) -> io::Result<()> {
    let fd = f.as_raw_fd();
    unsafe { ioctl::set_size_blocks(fd, blocks as i32)? };
    Ok(())
}

/// Set the per-request I/O timeout in seconds. Only issued when the
/// configured timeout is nonzero.
pub fn set_timeout(f: &File, secs: u64) -> io::Result<()> {
    let fd = f.as_raw_fd();
    unsafe { ioctl::set_timeout(fd, secs as i32)? };
    Ok(())
}

/// Push the server's transmission flags down to the kernel. Callers treat
/// failure as best effort, older kernels reject this ioctl.
pub fn set_flags(f: &File, flags: u64) -> io::Result<()> {
    let fd = f.as_raw_fd();
    unsafe { ioctl::set_flags(fd, flags as i32)? };
    Ok(())
}

/// Set or clear the block device's read-only attribute, mirroring the
/// export's READ_ONLY transmission flag.
pub fn set_read_only(f: &File, read_only: bool) -> io::Result<()> {
    let fd = f.as_raw_fd();
    let flag: c_int = read_only.into();
    unsafe { ioctl::blkroset(fd, &flag)? };
    Ok(())
}

/// Drop any socket bound to the device. Run before a fresh [`set_sock`] and
/// again after the run loop ends, so a stale binding never outlives its
/// session.
pub fn clear_sock(f: &File) -> io::Result<()> {
    let fd = f.as_raw_fd();
    unsafe { ioctl::clear_sock(fd)? };
    Ok(())
}

/// Ask the kernel to end the device's session; the blocked [`do_it`] in the
/// attached process then returns `EBADR`.
pub fn disconnect(f: &File) -> io::Result<()> {
    let fd = f.as_raw_fd();
    unsafe { ioctl::disconnect(fd)? };
    Ok(())
}

/// Sysfs node exposing the pid serving an attached device.
///
/// Partition names (`nbd0p1`) are truncated at the `p`: partitions have no
/// pid node of their own.
pub fn sysfs_pid_path(device: &str) -> PathBuf {
    let name = device.rsplit('/').next().unwrap_or(device);
    let name = match name.find('p') {
        Some(i) => &name[..i],
        None => name,
    };
    PathBuf::from(format!("/sys/block/{name}/pid"))
}

/// Read the pid attached to `device`, `None` when the device is unattached
/// (the sysfs node does not exist).
pub fn attached_pid(device: &str) -> io::Result<Option<String>> {
    match std::fs::read_to_string(sysfs_pid_path(device)) {
        Ok(pid) => Ok(Some(pid.trim().to_string())),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}
