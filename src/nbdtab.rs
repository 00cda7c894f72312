//! Resolver for the system device table, `/etc/nbdtab`.
//!
//! Each line maps a local nbd device to a host, an export, and an optional
//! comma-separated options field:
//!
//! ```text
//! # device  host          export  options
//! nbd0      storage.lan   root    bs=4096,timeout=20,persist
//! nbd1      /run/nbd.sock backup  unix
//! ```

use std::fmt;
use std::fs;

use color_eyre::eyre::{bail, eyre, WrapErr};
use color_eyre::Result;
use log::warn;

use crate::errors::ClientError;

/// System-wide device table.
pub const NBDTAB: &str = "/etc/nbdtab";

/// One parsed nbdtab record. Option fields left `None`/`false` keep the
/// command-line defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    /// Device name with any `/dev/` prefix stripped, e.g. `nbd0`.
    pub device: String,
    pub host: String,
    pub export: String,
    pub block_size: Option<u64>,
    pub timeout: Option<u64>,
    pub port: Option<u16>,
    pub persist: bool,
    pub swap: bool,
    pub sdp: bool,
    pub unix: bool,
}

impl DeviceRecord {
    fn new(device: &str, host: &str, export: &str) -> Self {
        Self {
            device: device.to_string(),
            host: host.to_string(),
            export: export.to_string(),
            block_size: None,
            timeout: None,
            port: None,
            persist: false,
            swap: false,
            sdp: false,
            unix: false,
        }
    }

    /// Device node path, e.g. `/dev/nbd0`.
    pub fn device_path(&self) -> String {
        format!("/dev/{}", self.device)
    }
}

impl fmt::Display for DeviceRecord {
    /// Normalized single-line nbdtab form of this record.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}\t{}\t{}", self.device, self.host, self.export)?;
        let mut opts = vec![];
        if let Some(bs) = self.block_size {
            opts.push(format!("bs={bs}"));
        }
        if let Some(timeout) = self.timeout {
            opts.push(format!("timeout={timeout}"));
        }
        if let Some(port) = self.port {
            opts.push(format!("port={port}"));
        }
        for (flag, name) in [
            (self.persist, "persist"),
            (self.swap, "swap"),
            (self.sdp, "sdp"),
            (self.unix, "unix"),
        ] {
            if flag {
                opts.push(name.to_string());
            }
        }
        if !opts.is_empty() {
            write!(f, "\t{}", opts.join(","))?;
        }
        Ok(())
    }
}

/// Look `device` up in [`NBDTAB`].
pub fn lookup(device: &str) -> Result<DeviceRecord> {
    let contents = fs::read_to_string(NBDTAB).wrap_err_with(|| format!("opening {NBDTAB}"))?;
    find_in(&contents, device)
}

/// Find the first record for `device` in the given table contents.
///
/// A `/dev/` prefix on the identifier is ignored. Lines are comments from
/// `#` onward; fields are separated by spaces or tabs.
pub fn find_in(contents: &str, device: &str) -> Result<DeviceRecord> {
    let device = device.strip_prefix("/dev/").unwrap_or(device);
    for (lineno, line) in contents.lines().enumerate() {
        let line = line.split('#').next().unwrap_or("");
        let mut fields = line.split(&[' ', '\t'][..]).filter(|f| !f.is_empty());
        match fields.next() {
            Some(first) if first == device => {
                return parse_fields(device, fields, lineno + 1);
            }
            _ => continue,
        }
    }
    Err(eyre!(ClientError::NotFound(device.to_string())))
}

fn parse_fields<'a>(
    device: &str,
    mut fields: impl Iterator<Item = &'a str>,
    lineno: usize,
) -> Result<DeviceRecord> {
    let config_err = |reason: String| ClientError::Config {
        line: lineno,
        reason,
    };
    let host = fields
        .next()
        .ok_or_else(|| config_err("missing host field".to_string()))?;
    let export = fields
        .next()
        .ok_or_else(|| config_err("missing export field".to_string()))?;
    let mut record = DeviceRecord::new(device, host, export);
    if let Some(options) = fields.next() {
        parse_options(&mut record, options, lineno)?;
    }
    if let Some(extra) = fields.next() {
        bail!(config_err(format!("trailing field '{extra}'")));
    }
    Ok(record)
}

fn parse_options(record: &mut DeviceRecord, options: &str, lineno: usize) -> Result<()> {
    let config_err = |reason: String| ClientError::Config {
        line: lineno,
        reason,
    };
    for opt in options.split(',').filter(|o| !o.is_empty()) {
        match opt.split_once('=') {
            Some(("bs", value)) => {
                record.block_size = Some(
                    value
                        .parse()
                        .map_err(|_| config_err(format!("bad block size '{value}'")))?,
                );
            }
            Some(("timeout", value)) => {
                record.timeout = Some(
                    value
                        .parse()
                        .map_err(|_| config_err(format!("bad timeout '{value}'")))?,
                );
            }
            Some(("port", value)) => {
                record.port = Some(
                    value
                        .parse()
                        .map_err(|_| config_err(format!("bad port '{value}'")))?,
                );
            }
            None if opt == "persist" => record.persist = true,
            None if opt == "swap" => record.swap = true,
            None if opt == "sdp" => record.sdp = true,
            None if opt == "unix" => record.unix = true,
            // underscore-prefixed options are reserved for third parties
            _ if opt.starts_with('_') => {}
            _ => warn!("unknown option '{opt}' found in nbdtab file"),
        }
    }
    Ok(())
}
