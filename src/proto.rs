//! NBD newstyle handshake constants and framing.
//!
//! See <https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md>
//! for the protocol description. Everything on the wire is big-endian.
#![allow(clippy::upper_case_acronyms)]
#![allow(non_camel_case_types)]

use std::io::{self, prelude::*};

use bitflags::bitflags;
use byteorder::{ReadBytesExt, WriteBytesExt, BE};
use color_eyre::eyre::{bail, ensure};
use color_eyre::Result;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::errors::ClientError;

/// Default NBD server port. Must always be numeric.
pub const TCP_PORT: u16 = 10809;

/// Init password the server sends first, read as one big-endian word.
pub const MAGIC: u64 = 0x4e42444d41474943; // b"NBDMAGIC"
/// Newstyle option-haggling magic.
pub const IHAVEOPT: u64 = 0x49484156454F5054; // b"IHAVEOPT"
/// Oldstyle magic; receiving it after the init password is fatal.
pub const CLISERV_MAGIC: u64 = 0x00420281861253;
/// Magic preceding every option reply.
pub const REPLY_MAGIC: u64 = 0x3e889045565a9;

bitflags! {
  /// Global flags the server advertises right after the magics.
  pub struct HandshakeFlags: u16 {
    const FIXED_NEWSTYLE = 0b01;
    const NO_ZEROES = 0b10;
  }

  /// Flags the client answers with.
  pub struct ClientHandshakeFlags: u32 {
    const C_FIXED_NEWSTYLE = 0b01;
    const C_NO_ZEROES = 0b10;
  }

  /// Per-export transmission flags returned at export selection.
  pub struct TransmitFlags: u16 {
    const HAS_FLAGS = 1 << 0;
    const READ_ONLY = 1 << 1;
    const SEND_FLUSH = 1 << 2;
    const SEND_FUA = 1 << 3;
    const ROTATIONAL = 1 << 4;
    const SEND_TRIM = 1 << 5;
    const SEND_WRITE_ZEROES = 1 << 6;
    const SEND_DF = 1 << 7;
    const CAN_MULTI_CONN = 1 << 8;
    const SEND_RESIZE = 1 << 9;
    const SEND_CACHE = 1 << 10;
    const SEND_FAST_ZERO = 1 << 11;
  }
}

#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum OptType {
    EXPORT_NAME = 1,
    ABORT = 2,
    LIST = 3,
    PEEK_EXPORT = 4,
    STARTTLS = 5,
    INFO = 6,
    GO = 7,
}

/// Bit set on every error reply type.
pub const REP_FLAG_ERROR: u32 = 1 << 31;

#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum ReplyType {
    ACK = 1,
    SERVER = 2,
    INFO = 3,
    ERR_UNSUP = REP_FLAG_ERROR + 1,
    ERR_POLICY = REP_FLAG_ERROR + 2,
    ERR_INVALID = REP_FLAG_ERROR + 3,
    ERR_TLS_REQD = REP_FLAG_ERROR + 5,
    ERR_UNKNOWN = REP_FLAG_ERROR + 6,
    ERR_SHUTDOWN = REP_FLAG_ERROR + 7,
    ERR_BLOCK_SIZE_REQD = REP_FLAG_ERROR + 8,
    ERR_TOO_BIG = REP_FLAG_ERROR + 9,
}

/// An option request, sent by the client during haggling.
#[derive(Debug, Clone)]
pub struct Opt {
    pub typ: OptType,
    pub data: Vec<u8>,
}

impl Opt {
    pub fn new(typ: OptType) -> Self {
        Self { typ, data: vec![] }
    }

    pub fn put<IO: Write>(&self, mut stream: IO) -> io::Result<()> {
        // C: 64 bits, 0x49484156454F5054 (ASCII 'IHAVEOPT')
        // C: 32 bits, option
        // C: 32 bits, length of option data (unsigned)
        // C: any data needed for the chosen option, of length as specified above.
        stream.write_u64::<BE>(IHAVEOPT)?;
        stream.write_u32::<BE>(self.typ.into())?;
        stream.write_u32::<BE>(self.data.len() as u32)?;
        stream.write_all(&self.data)?;
        stream.flush()?;
        Ok(())
    }
}

/// One option reply frame, as read off the wire.
///
/// The reply type is kept raw so that error codes this crate does not know
/// about still carry their payload up to the caller.
#[derive(Debug, Clone)]
pub struct OptReply {
    /// Echo of the option this is a reply to.
    pub opt: u32,
    pub reply_type: u32,
    pub data: Vec<u8>,
}

impl OptReply {
    pub fn get<IO: Read>(mut stream: IO) -> Result<Self> {
        // S: 64 bits, 0x3e889045565a9 (magic number for replies)
        // S: 32 bits, the option as sent by the client to which this is a reply
        // S: 32 bits, reply type
        // S: 32 bits, length of the reply
        // S: any data as required by the reply
        let magic = stream.read_u64::<BE>()?;
        if magic != REPLY_MAGIC {
            bail!(ClientError::Handshake(format!(
                "unexpected reply magic {magic:#x}"
            )));
        }
        let opt = stream.read_u32::<BE>()?;
        let reply_type = stream.read_u32::<BE>()?;
        let len = stream.read_u32::<BE>()?;
        ensure!(
            len < 10_000,
            ClientError::Handshake(format!("reply length {len} is too large"))
        );
        let mut data = vec![0u8; len as usize];
        stream.read_exact(&mut data)?;
        Ok(Self {
            opt,
            reply_type,
            data,
        })
    }

    pub fn is_error(&self) -> bool {
        self.reply_type & REP_FLAG_ERROR != 0
    }

    /// Decoded reply type, when this crate knows the code.
    pub fn typ(&self) -> Option<ReplyType> {
        ReplyType::try_from(self.reply_type).ok()
    }

    /// Server-supplied human-readable payload, if any.
    pub fn message(&self) -> Option<String> {
        if self.data.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(&self.data).into_owned())
        }
    }
}
