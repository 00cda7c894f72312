//! Client side of the newstyle NBD negotiation.
//!
//! Drives the fixed-newstyle handshake over any `Read + Write` stream and
//! yields the export's size and transmission flags, or walks the LIST
//! sub-protocol. Oldstyle servers are rejected.

use std::io::prelude::*;

use byteorder::{ReadBytesExt, WriteBytesExt, BE};
use color_eyre::eyre::{bail, WrapErr};
use color_eyre::Result;
use nix::libc::c_ulong;

use crate::errors::ClientError;
use crate::proto::*;

/// What the server told us about the selected export.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Export {
    /// Total exported length in bytes.
    pub size: u64,
    /// Transmission flags as received from the server.
    pub flags: TransmitFlags,
}

/// `size >> 12` has to fit the platform's `unsigned long` or later
/// block-count arithmetic overflows.
pub(crate) fn export_too_large(size: u64, ulong_max: u64) -> bool {
    (size >> 12) > ulong_max
}

/// Exchange magics and flags with the server, leaving the stream ready for
/// option haggling. Returns the server's global flags.
///
/// Every bit in `needed` must be advertised by the server. If the server
/// offers `NO_ZEROES` we accept it, which elides the 124-byte padding after
/// export selection.
pub fn initial_handshake<IO: Read + Write>(
    stream: &mut IO,
    needed: HandshakeFlags,
) -> Result<HandshakeFlags> {
    print!("Negotiation: ");
    let magic = stream.read_u64::<BE>().wrap_err("reading init password")?;
    if magic != MAGIC {
        bail!(ClientError::Handshake(format!("bad init password {magic:#x}")));
    }
    print!(".");
    let opt_magic = stream.read_u64::<BE>()?;
    if opt_magic == CLISERV_MAGIC {
        bail!(ClientError::LegacyServer);
    }
    if opt_magic != IHAVEOPT {
        bail!(ClientError::Handshake(format!("bad opts magic {opt_magic:#x}")));
    }
    print!(".");
    let global_flags = HandshakeFlags::from_bits_truncate(stream.read_u16::<BE>()?);
    if !global_flags.contains(needed) {
        bail!(ClientError::Handshake(format!(
            "server lacks required capabilities {:?}",
            needed - global_flags
        )));
    }
    let mut client_flags = ClientHandshakeFlags::C_FIXED_NEWSTYLE;
    if global_flags.contains(HandshakeFlags::NO_ZEROES) {
        client_flags |= ClientHandshakeFlags::C_NO_ZEROES;
    }
    stream.write_u32::<BE>(client_flags.bits())?;
    stream.flush()?;
    Ok(global_flags)
}

/// Select `name` and read back the export descriptor (steps 6-10 of the
/// newstyle negotiation).
pub fn request_export<IO: Read + Write>(
    stream: &mut IO,
    name: &str,
    global_flags: HandshakeFlags,
) -> Result<Export> {
    Opt {
        typ: OptType::EXPORT_NAME,
        data: name.as_bytes().to_vec(),
    }
    .put(&mut *stream)?;

    let size = stream.read_u64::<BE>().wrap_err("reading export size")?;
    if export_too_large(size, c_ulong::MAX as u64) {
        bail!(ClientError::SizeOverflow(size));
    }
    print!("size = {}MB", size >> 20);
    let flags = TransmitFlags::from_bits_truncate(stream.read_u16::<BE>()?);
    if !global_flags.contains(HandshakeFlags::NO_ZEROES) {
        let mut padding = [0u8; 124];
        stream
            .read_exact(&mut padding)
            .wrap_err("reading reserved padding")?;
    }
    println!();
    Ok(Export { size, flags })
}

/// Run the full handshake and return the negotiated export.
pub fn negotiate<IO: Read + Write>(
    stream: &mut IO,
    name: &str,
    needed: HandshakeFlags,
) -> Result<Export> {
    let global_flags = initial_handshake(stream, needed)?;
    request_export(stream, name, global_flags)
}

/// Ask the server for its export list.
///
/// Call after [`initial_handshake`] (with `FIXED_NEWSTYLE` in the needed
/// flags); iterate the result to pull names one reply at a time.
pub fn list<IO: Read + Write>(stream: &mut IO) -> Result<ExportList<'_, IO>> {
    Opt::new(OptType::LIST).put(&mut *stream)?;
    // move away from the "Negotiation:" line before printing names
    println!();
    Ok(ExportList {
        stream,
        done: false,
    })
}

/// Lazy, finite sequence of export names from a LIST exchange.
///
/// Consumes exactly the bytes each reply advertises and nothing past the
/// terminating ACK, which is acknowledged with a polite ABORT.
pub struct ExportList<'a, IO: Read + Write> {
    stream: &'a mut IO,
    done: bool,
}

impl<IO: Read + Write> ExportList<'_, IO> {
    fn next_name(&mut self) -> Result<Option<String>> {
        if self.done {
            return Ok(None);
        }
        let reply = OptReply::get(&mut *self.stream)?;
        if reply.is_error() {
            self.done = true;
            match reply.typ() {
                Some(ReplyType::ERR_POLICY) => {
                    bail!(ClientError::ListDenied(reply.message()))
                }
                _ => bail!(ClientError::ListRefused {
                    code: reply.reply_type,
                    message: reply.message(),
                }),
            }
        }
        match reply.typ() {
            Some(ReplyType::ACK) => {
                self.done = true;
                Opt::new(OptType::ABORT).put(&mut *self.stream)?;
                Ok(None)
            }
            Some(ReplyType::SERVER) => {
                let mut data = &reply.data[..];
                let name_len = data.read_u32::<BE>().wrap_err("reading export name length")? as usize;
                if name_len > data.len() {
                    self.done = true;
                    bail!(ClientError::Handshake(format!(
                        "export name length {name_len} exceeds reply payload"
                    )));
                }
                Ok(Some(String::from_utf8_lossy(&data[..name_len]).into_owned()))
            }
            _ => {
                self.done = true;
                bail!(ClientError::Handshake(format!(
                    "server sent a reply we don't understand ({:#x})",
                    reply.reply_type
                )))
            }
        }
    }
}

impl<IO: Read + Write> Iterator for ExportList<'_, IO> {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_name() {
            Ok(Some(name)) => Some(Ok(name)),
            Ok(None) => None,
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}
