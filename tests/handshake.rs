//! Handshake tests against a scripted in-memory server.
//!
//! Two pipes glued into a duplex stream stand in for the TCP connection; a
//! thread plays the server side byte for byte.

use std::io::prelude::*;
use std::thread::{self, JoinHandle};

use byteorder::{ReadBytesExt, WriteBytesExt, BE};
use color_eyre::Result;
use pipe::{PipeReader, PipeWriter};
use rand::Rng;
use readwrite::ReadWrite;

use nbd_client::errors::ClientError;
use nbd_client::handshake::{self, negotiate};
use nbd_client::proto::*;

type Duplex = ReadWrite<PipeReader, PipeWriter>;

fn duplex() -> (Duplex, Duplex) {
    let (client_read, server_write) = pipe::pipe();
    let (server_read, client_write) = pipe::pipe();
    (
        ReadWrite::new(client_read, client_write),
        ReadWrite::new(server_read, server_write),
    )
}

/// Server side of the fixed-newstyle greeting, asserting on the client's
/// answered flags.
fn greet(server: &mut Duplex, flags: HandshakeFlags) {
    server.write_u64::<BE>(MAGIC).unwrap();
    server.write_u64::<BE>(IHAVEOPT).unwrap();
    server.write_u16::<BE>(flags.bits()).unwrap();
    let mut expected = ClientHandshakeFlags::C_FIXED_NEWSTYLE;
    if flags.contains(HandshakeFlags::NO_ZEROES) {
        expected |= ClientHandshakeFlags::C_NO_ZEROES;
    }
    assert_eq!(server.read_u32::<BE>().unwrap(), expected.bits());
}

/// Server side of export selection: read the EXPORT_NAME option, check the
/// requested name, and send back size and transmission flags.
fn serve_export(server: &mut Duplex, expect_name: &str, size: u64, flags: u16, padding: bool) {
    assert_eq!(server.read_u64::<BE>().unwrap(), IHAVEOPT);
    assert_eq!(server.read_u32::<BE>().unwrap(), u32::from(OptType::EXPORT_NAME));
    let len = server.read_u32::<BE>().unwrap();
    let mut name = vec![0u8; len as usize];
    server.read_exact(&mut name).unwrap();
    assert_eq!(name, expect_name.as_bytes());
    server.write_u64::<BE>(size).unwrap();
    server.write_u16::<BE>(flags).unwrap();
    if padding {
        server.write_all(&[0u8; 124]).unwrap();
    }
}

fn reply(server: &mut Duplex, opt: u32, reply_type: u32, data: &[u8]) {
    server.write_u64::<BE>(REPLY_MAGIC).unwrap();
    server.write_u32::<BE>(opt).unwrap();
    server.write_u32::<BE>(reply_type).unwrap();
    server.write_u32::<BE>(data.len() as u32).unwrap();
    server.write_all(data).unwrap();
}

fn spawn_server<F>(mut server: Duplex, script: F) -> JoinHandle<()>
where
    F: FnOnce(&mut Duplex) + Send + 'static,
{
    thread::spawn(move || script(&mut server))
}

#[test]
fn negotiates_a_gigabyte_export() {
    let (mut client, server) = duplex();
    let server = spawn_server(server, |server| {
        greet(
            server,
            HandshakeFlags::FIXED_NEWSTYLE | HandshakeFlags::NO_ZEROES,
        );
        serve_export(server, "data", 1 << 30, 0, false);
    });
    let export = negotiate(&mut client, "data", HandshakeFlags::empty()).unwrap();
    assert_eq!(export.size, 1 << 30);
    assert!(export.flags.is_empty());
    server.join().unwrap();
}

#[test]
fn reads_transmission_flags() {
    let (mut client, server) = duplex();
    let flags = TransmitFlags::HAS_FLAGS | TransmitFlags::READ_ONLY | TransmitFlags::SEND_FLUSH;
    let server = spawn_server(server, move |server| {
        greet(server, HandshakeFlags::FIXED_NEWSTYLE | HandshakeFlags::NO_ZEROES);
        serve_export(server, "", 4096, flags.bits(), false);
    });
    let export = negotiate(&mut client, "", HandshakeFlags::empty()).unwrap();
    assert!(export.flags.contains(TransmitFlags::READ_ONLY));
    server.join().unwrap();
}

#[test]
fn consumes_exactly_124_padding_bytes_without_no_zeroes() {
    let (mut client, server) = duplex();
    let server = spawn_server(server, |server| {
        greet(server, HandshakeFlags::FIXED_NEWSTYLE);
        serve_export(server, "data", 1 << 20, 0, true);
        // sentinel directly after the padding
        server.write_u8(0xAB).unwrap();
    });
    let export = negotiate(&mut client, "data", HandshakeFlags::empty()).unwrap();
    assert_eq!(export.size, 1 << 20);
    // the next byte on the stream must be the sentinel, not leftover padding
    assert_eq!(client.read_u8().unwrap(), 0xAB);
    server.join().unwrap();
}

#[test]
fn negotiates_randomized_sizes() {
    let mut rng = rand::thread_rng();
    for _ in 0..4 {
        let size = rng.gen_range(1..=1u64 << 28) * 4096;
        let (mut client, server) = duplex();
        let server = spawn_server(server, move |server| {
            greet(server, HandshakeFlags::FIXED_NEWSTYLE | HandshakeFlags::NO_ZEROES);
            serve_export(server, "disk", size, 0, false);
        });
        let export = negotiate(&mut client, "disk", HandshakeFlags::empty()).unwrap();
        assert_eq!(export.size, size);
        server.join().unwrap();
    }
}

#[test]
fn rejects_an_oldstyle_server() {
    let (mut client, server) = duplex();
    let server = spawn_server(server, |server| {
        server.write_u64::<BE>(MAGIC).unwrap();
        server.write_u64::<BE>(CLISERV_MAGIC).unwrap();
    });
    let err = negotiate(&mut client, "data", HandshakeFlags::empty()).unwrap_err();
    assert_eq!(
        err.downcast_ref::<ClientError>(),
        Some(&ClientError::LegacyServer)
    );
    server.join().unwrap();
}

#[test]
fn rejects_a_bad_init_password() {
    let (mut client, server) = duplex();
    let server = spawn_server(server, |server| {
        server.write_u64::<BE>(0x6261646d61676963).unwrap();
    });
    let err = negotiate(&mut client, "data", HandshakeFlags::empty()).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ClientError>(),
        Some(ClientError::Handshake(_))
    ));
    server.join().unwrap();
}

#[test]
fn rejects_a_server_missing_required_capabilities() {
    let (mut client, server) = duplex();
    let server = spawn_server(server, |server| {
        server.write_u64::<BE>(MAGIC).unwrap();
        server.write_u64::<BE>(IHAVEOPT).unwrap();
        server.write_u16::<BE>(0).unwrap();
    });
    let err =
        handshake::initial_handshake(&mut client, HandshakeFlags::FIXED_NEWSTYLE).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ClientError>(),
        Some(ClientError::Handshake(_))
    ));
    server.join().unwrap();
}

fn server_reply_payload(name: &str) -> Vec<u8> {
    let mut data = vec![];
    data.write_u32::<BE>(name.len() as u32).unwrap();
    data.extend_from_slice(name.as_bytes());
    data
}

#[test]
fn lists_two_exports_and_aborts() {
    let (mut client, server) = duplex();
    let server = spawn_server(server, |server| {
        greet(server, HandshakeFlags::FIXED_NEWSTYLE);
        // LIST with no payload
        assert_eq!(server.read_u64::<BE>().unwrap(), IHAVEOPT);
        assert_eq!(server.read_u32::<BE>().unwrap(), u32::from(OptType::LIST));
        assert_eq!(server.read_u32::<BE>().unwrap(), 0);
        let list = u32::from(OptType::LIST);
        reply(server, list, ReplyType::SERVER.into(), &server_reply_payload("gold"));
        reply(server, list, ReplyType::SERVER.into(), &server_reply_payload("silver"));
        reply(server, list, ReplyType::ACK.into(), &[]);
        // the client acknowledges the ACK with a polite ABORT
        assert_eq!(server.read_u64::<BE>().unwrap(), IHAVEOPT);
        assert_eq!(server.read_u32::<BE>().unwrap(), u32::from(OptType::ABORT));
        assert_eq!(server.read_u32::<BE>().unwrap(), 0);
    });
    handshake::initial_handshake(&mut client, HandshakeFlags::FIXED_NEWSTYLE).unwrap();
    let names = handshake::list(&mut client)
        .unwrap()
        .collect::<Result<Vec<_>>>()
        .unwrap();
    assert_eq!(names, ["gold", "silver"]);
    server.join().unwrap();
}

#[test]
fn listing_forbidden_by_policy_carries_the_server_message() {
    let (mut client, server) = duplex();
    let server = spawn_server(server, |server| {
        greet(server, HandshakeFlags::FIXED_NEWSTYLE);
        assert_eq!(server.read_u64::<BE>().unwrap(), IHAVEOPT);
        assert_eq!(server.read_u32::<BE>().unwrap(), u32::from(OptType::LIST));
        assert_eq!(server.read_u32::<BE>().unwrap(), 0);
        reply(server, OptType::LIST.into(), ReplyType::ERR_POLICY.into(), b"no");
    });
    handshake::initial_handshake(&mut client, HandshakeFlags::FIXED_NEWSTYLE).unwrap();
    let err = handshake::list(&mut client)
        .unwrap()
        .next()
        .expect("an error item")
        .unwrap_err();
    assert_eq!(
        err.downcast_ref::<ClientError>(),
        Some(&ClientError::ListDenied(Some("no".to_string())))
    );
    server.join().unwrap();
}

#[test]
fn unknown_list_error_codes_fail_generically() {
    let (mut client, server) = duplex();
    let code = REP_FLAG_ERROR + 42;
    let server = spawn_server(server, move |server| {
        greet(server, HandshakeFlags::FIXED_NEWSTYLE);
        assert_eq!(server.read_u64::<BE>().unwrap(), IHAVEOPT);
        assert_eq!(server.read_u32::<BE>().unwrap(), u32::from(OptType::LIST));
        assert_eq!(server.read_u32::<BE>().unwrap(), 0);
        reply(server, OptType::LIST.into(), code, b"out of cheese");
    });
    handshake::initial_handshake(&mut client, HandshakeFlags::FIXED_NEWSTYLE).unwrap();
    let err = handshake::list(&mut client)
        .unwrap()
        .next()
        .expect("an error item")
        .unwrap_err();
    assert_eq!(
        err.downcast_ref::<ClientError>(),
        Some(&ClientError::ListRefused {
            code,
            message: Some("out of cheese".to_string()),
        })
    );
    server.join().unwrap();
}
