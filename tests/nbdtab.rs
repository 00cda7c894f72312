//! Device-table parsing tests.

use nbd_client::errors::ClientError;
use nbd_client::nbdtab::find_in;

const TABLE: &str = "\
# systemwide nbd device table
nbd0\tstorage.example.com\troot\tbs=4096,timeout=20,persist
nbd1 storage.example.com backup port=10810,swap,_vendor=7,frobnicate
nbd2\t/run/nbd/server.sock\tscratch\tunix   # local server
nbd3 storage.example.com plain
";

fn downcast(err: color_eyre::Report) -> ClientError {
    err.downcast_ref::<ClientError>()
        .expect("a ClientError")
        .clone()
}

#[test]
fn finds_a_record_with_options() {
    let record = find_in(TABLE, "nbd0").unwrap();
    assert_eq!(record.device, "nbd0");
    assert_eq!(record.device_path(), "/dev/nbd0");
    assert_eq!(record.host, "storage.example.com");
    assert_eq!(record.export, "root");
    assert_eq!(record.block_size, Some(4096));
    assert_eq!(record.timeout, Some(20));
    assert!(record.persist);
    assert!(!record.swap);
    assert!(!record.unix);
}

#[test]
fn dev_prefix_is_stripped() {
    assert_eq!(find_in(TABLE, "/dev/nbd0").unwrap(), find_in(TABLE, "nbd0").unwrap());
}

#[test]
fn unspecified_options_keep_their_defaults() {
    let record = find_in(TABLE, "nbd3").unwrap();
    assert_eq!(record.block_size, None);
    assert_eq!(record.timeout, None);
    assert_eq!(record.port, None);
    assert!(!record.persist && !record.swap && !record.sdp && !record.unix);
}

#[test]
fn unknown_options_are_skipped() {
    // `_vendor=7` is silently ignored, `frobnicate` is warned about and
    // skipped; neither disturbs the recognized options around them
    let record = find_in(TABLE, "nbd1").unwrap();
    assert_eq!(record.port, Some(10810));
    assert!(record.swap);
}

#[test]
fn unix_records_carry_the_socket_path_as_host() {
    let record = find_in(TABLE, "nbd2").unwrap();
    assert!(record.unix);
    assert_eq!(record.host, "/run/nbd/server.sock");
    assert_eq!(record.export, "scratch");
}

#[test]
fn missing_devices_are_not_found() {
    let err = downcast(find_in(TABLE, "nbd9").unwrap_err());
    assert_eq!(err, ClientError::NotFound("nbd9".to_string()));
}

#[test]
fn first_matching_line_wins() {
    let table = "nbd0 first.example.com a\nnbd0 second.example.com b\n";
    assert_eq!(find_in(table, "nbd0").unwrap().host, "first.example.com");
}

#[test]
fn malformed_lines_report_their_line_number() {
    let table = "# comment\n\nnbd0 lonely-host\n";
    match downcast(find_in(table, "nbd0").unwrap_err()) {
        ClientError::Config { line, .. } => assert_eq!(line, 3),
        other => panic!("expected a config error, got {other:?}"),
    }
}

#[test]
fn malformed_option_values_are_config_errors() {
    let table = "nbd0 host export bs=banana\n";
    assert!(matches!(
        downcast(find_in(table, "nbd0").unwrap_err()),
        ClientError::Config { line: 1, .. }
    ));
}

#[test]
fn comments_and_blank_lines_are_ignored() {
    let table = "\n   \n# nbd0 commented.example.com x\nnbd0 real.example.com data\n";
    assert_eq!(find_in(table, "nbd0").unwrap().host, "real.example.com");
}

#[test]
fn records_round_trip_through_their_normalized_form() {
    for device in ["nbd0", "nbd1", "nbd2", "nbd3"] {
        let record = find_in(TABLE, device).unwrap();
        let reparsed = find_in(&record.to_string(), device).unwrap();
        assert_eq!(record, reparsed);
    }
}

#[test]
fn display_emits_the_normalized_line() {
    let record = find_in(TABLE, "nbd0").unwrap();
    assert_eq!(
        record.to_string(),
        "nbd0\tstorage.example.com\troot\tbs=4096,timeout=20,persist"
    );
}
