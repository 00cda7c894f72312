use std::fs::OpenOptions;
use std::os::unix::prelude::{AsRawFd, RawFd};
use std::path::Path;
use std::process;

use clap::Parser;
use color_eyre::eyre::{bail, ensure, eyre, WrapErr};
use color_eyre::Result;
use fork::{daemon, Fork};
use log::warn;

use nbd_client::attach::{AttachTarget, Session};
use nbd_client::dial::Endpoint;
use nbd_client::errors::ClientError;
use nbd_client::handshake::{self, Export};
use nbd_client::proto::{HandshakeFlags, TCP_PORT};
use nbd_client::{kernel, nbdtab, netlink};

const BLOCK_SIZES: [u64; 4] = [512, 1024, 2048, 4096];

#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
struct Args {
    /// Block size in bytes (512, 1024, 2048, or 4096)
    #[clap(short = 'b', long, default_value_t = 1024)]
    block_size: u64,

    /// Check whether DEV is attached and print the serving pid
    #[clap(short = 'c', long, value_name = "DEV")]
    check: Option<String>,

    /// Number of connections to open (netlink only)
    #[clap(short = 'C', long, default_value_t = 1)]
    connections: u32,

    /// Disconnect DEV from its server
    #[clap(short = 'd', long, value_name = "DEV")]
    disconnect: Option<String>,

    /// Number of reconnect attempts after a dead link (implies --netlink)
    #[clap(short = 'D', long, default_value_t = 0)]
    dead_timeout: u64,

    /// Destroy the device on disconnect (netlink only)
    #[clap(short = 'e', long)]
    destroy: bool,

    /// List the server's exports instead of attaching
    #[clap(short = 'l', long)]
    list: bool,

    /// Stay attached and repair dead links from link-dead notifications (implies --netlink)
    #[clap(short = 'M', long)]
    monitor: bool,

    /// Name of the export to attach (empty for the server's default)
    #[clap(short = 'N', long, default_value = "")]
    name: String,

    /// Configure the device over generic netlink instead of ioctls
    #[clap(short = 'L', long)]
    netlink: bool,

    /// Keep running in the foreground (don't daemonize)
    #[clap(short = 'n', long)]
    nofork: bool,

    /// Redial and renegotiate after involuntary disconnects
    #[clap(short = 'p', long)]
    persist: bool,

    /// Use the Sockets Direct Protocol address family
    #[clap(short = 'S', long)]
    sdp: bool,

    /// The device will hold swap; lock memory and hide from the OOM killer
    #[clap(short = 's', long)]
    swap: bool,

    /// Mark the process so systemd spares it on shutdown
    #[clap(short = 'm', long)]
    systemd_mark: bool,

    /// I/O timeout in seconds (0 disables)
    #[clap(short = 't', long, default_value_t = 30)]
    timeout: u64,

    /// HOST is a Unix socket path rather than a network address
    #[clap(short = 'u', long)]
    unix: bool,

    /// HOST [PORT] DEVICE, or a bare nbdX device listed in /etc/nbdtab
    args: Vec<String>,
}

/// One fully resolved attach request: command line plus any nbdtab record.
#[derive(Debug)]
struct Invocation {
    endpoint: Endpoint,
    export: String,
    device: Option<String>,
    block_size: u64,
    timeout: u64,
    persist: bool,
    swap: bool,
}

fn looks_like_nbd_device(arg: &str) -> bool {
    arg.starts_with("nbd") || arg.starts_with("/dev/nbd")
}

fn resolve(args: &Args) -> Result<Invocation> {
    ensure!(!args.args.is_empty(), "no information specified");

    if args.args.len() == 1 && !args.list && looks_like_nbd_device(&args.args[0]) {
        let record = nbdtab::lookup(&args.args[0])
            .wrap_err_with(|| format!("looking up {} in {}", args.args[0], nbdtab::NBDTAB))?;
        let endpoint = if record.unix {
            Endpoint::Unix {
                path: record.host.clone().into(),
            }
        } else {
            Endpoint::Net {
                host: record.host.clone(),
                port: record.port.unwrap_or(TCP_PORT),
                sdp: record.sdp,
            }
        };
        return Ok(Invocation {
            endpoint,
            export: record.export.clone(),
            device: Some(record.device_path()),
            block_size: record.block_size.unwrap_or(args.block_size),
            timeout: record.timeout.unwrap_or(args.timeout),
            persist: args.persist || record.persist,
            swap: args.swap || record.swap,
        });
    }

    let host = args.args[0].clone();
    let (port, device) = match args.args.len() {
        1 => (TCP_PORT, None),
        // a second argument that parses as a number is the port
        2 => match args.args[1].parse::<u16>() {
            Ok(port) => (port, None),
            Err(_) => (TCP_PORT, Some(args.args[1].clone())),
        },
        3 => (
            args.args[1]
                .parse::<u16>()
                .wrap_err("port must always be numeric")?,
            Some(args.args[2].clone()),
        ),
        _ => bail!("too many non-option arguments specified"),
    };
    let endpoint = if args.unix {
        Endpoint::Unix { path: host.into() }
    } else {
        Endpoint::Net {
            host,
            port,
            sdp: args.sdp,
        }
    };
    Ok(Invocation {
        endpoint,
        export: args.name.clone(),
        device,
        block_size: args.block_size,
        timeout: args.timeout,
        persist: args.persist,
        swap: args.swap,
    })
}

fn check(device: &str) -> i32 {
    match kernel::attached_pid(device) {
        Ok(Some(pid)) => {
            println!("{pid}");
            0
        }
        Ok(None) => 1,
        Err(err) => {
            eprintln!("ERROR: could not read from {}: {err}", device);
            2
        }
    }
}

fn ioctl_disconnect(device: &str) -> Result<()> {
    let nbd = OpenOptions::new()
        .read(true)
        .write(true)
        .open(device)
        .wrap_err_with(|| format!("cannot open {device}; please ensure the 'nbd' module is loaded"))?;
    print!("disconnect, ");
    kernel::disconnect(&nbd).wrap_err("NBD_DISCONNECT ioctl failed")?;
    print!("sock, ");
    kernel::clear_sock(&nbd).wrap_err("NBD_CLEAR_SOCK ioctl failed")?;
    println!("done");
    Ok(())
}

fn list_exports(invocation: &Invocation) -> Result<()> {
    let mut sock = invocation.endpoint.connect()?;
    handshake::initial_handshake(&mut sock, HandshakeFlags::FIXED_NEWSTYLE)?;
    for name in handshake::list(&mut sock)? {
        match name {
            Ok(name) => println!("{name}"),
            Err(err) => {
                // keep the wire diagnostics on stderr before the error report
                let server_said = match err.downcast_ref::<ClientError>() {
                    Some(ClientError::ListDenied(msg)) => {
                        eprintln!("E: listing not allowed by server.");
                        msg.clone()
                    }
                    Some(ClientError::ListRefused { message, .. }) => {
                        eprintln!("E: unexpected error from server.");
                        message.clone()
                    }
                    _ => None,
                };
                if let Some(msg) = server_said {
                    eprintln!("Server said: {msg}");
                }
                return Err(err);
            }
        }
    }
    Ok(())
}

fn attach_ioctl(args: &Args, invocation: Invocation) -> Result<()> {
    ensure!(
        args.connections == 1,
        "more than one connection requires --netlink"
    );
    let device = invocation
        .device
        .ok_or_else(|| eyre!("not enough information specified: no nbd device given"))?;
    let target = AttachTarget {
        endpoint: invocation.endpoint,
        export: invocation.export,
        block_size: invocation.block_size,
        timeout: invocation.timeout,
        persist: invocation.persist,
        swap: invocation.swap,
    };
    let session = Session::establish(Path::new(&device), target)?;

    if args.nofork {
        return session.run();
    }
    if let Ok(Fork::Child) = daemon(false, false) {
        session.run()?;
    }
    Ok(())
}

fn attach_netlink(args: &Args, invocation: Invocation) -> Result<()> {
    ensure!(args.connections >= 1, "at least one connection is required");
    let index = invocation
        .device
        .as_deref()
        .map(netlink::parse_index)
        .transpose()?;

    // every socket completes the full handshake before CONNECT is sent
    let mut streams = Vec::with_capacity(args.connections as usize);
    let mut export: Option<Export> = None;
    for _ in 0..args.connections {
        let mut sock = invocation.endpoint.connect()?;
        export = Some(handshake::negotiate(
            &mut sock,
            &invocation.export,
            HandshakeFlags::empty(),
        )?);
        streams.push(sock);
    }
    let export = match export {
        Some(export) => export,
        None => bail!("at least one connection is required"),
    };

    let mut client_flags = 0;
    if args.destroy {
        client_flags |= netlink::CFLAG_DESTROY_ON_DISCONNECT;
    }
    let fds: Vec<RawFd> = streams.iter().map(|s| s.as_raw_fd()).collect();
    let mut control = netlink::NbdNetlink::new()?;
    let index = control.connect(
        index,
        &export,
        invocation.block_size,
        invocation.timeout,
        args.dead_timeout,
        client_flags,
        &fds,
    )?;
    println!("Connected /dev/nbd{index}");
    // the kernel owns the connections now
    drop(streams);

    if args.monitor {
        let target = AttachTarget {
            endpoint: invocation.endpoint,
            export: invocation.export,
            block_size: invocation.block_size,
            timeout: invocation.timeout,
            persist: invocation.persist,
            swap: invocation.swap,
        };
        netlink::monitor(&target, args.dead_timeout)?;
    }
    Ok(())
}

fn escalate() -> Result<()> {
    if let Err(err) = sudo::escalate_if_needed() {
        bail!("could not get sudo privilege: {}", err);
    }
    Ok(())
}

fn main() -> Result<()> {
    color_eyre::install()?;
    env_logger::init();

    let args = Args::parse();

    if args.systemd_mark {
        warn!("--systemd-mark is not supported by this build; ignoring");
    }

    if let Some(device) = &args.check {
        process::exit(check(device));
    }

    if let Some(device) = &args.disconnect {
        escalate()?;
        if args.netlink {
            let index = netlink::parse_index(device)?;
            netlink::NbdNetlink::new()?.disconnect(index)?;
        } else {
            ioctl_disconnect(device)?;
        }
        return Ok(());
    }

    let invocation = resolve(&args)?;
    ensure!(
        BLOCK_SIZES.contains(&invocation.block_size),
        "allowed values for blocksize are 512, 1024, 2048, and 4096"
    );

    if args.list {
        return list_exports(&invocation);
    }

    if invocation.export.is_empty() {
        println!(
            "Warning: the oldstyle protocol is no longer supported.\n\
             This method now uses the newstyle protocol with a default export"
        );
    }

    escalate()?;
    if args.netlink || args.monitor || args.dead_timeout > 0 {
        attach_netlink(&args, invocation)
    } else {
        attach_ioctl(&args, invocation)
    }
}
