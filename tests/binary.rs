//! Integration tests for the client binary.

use std::path::PathBuf;
use std::{
    env,
    process::{Command, Output},
};

use serial_test::serial;

fn exe_path(name: &str) -> PathBuf {
    let bin_dir = env::current_exe()
        .unwrap()
        .parent()
        .expect("test executable's directory")
        .parent()
        .expect("output directory")
        .to_path_buf();
    bin_dir.join(name)
}

fn cmd_stdout(out: Output) -> String {
    String::from_utf8(out.stdout).expect("non utf-8 output")
}

#[test]
#[serial]
fn test_help_flag() {
    let out = Command::new(exe_path("nbd-client"))
        .args(["--help"])
        .output()
        .expect("failed to run nbd-client --help");
    let stdout = cmd_stdout(out);
    assert!(stdout.contains("--persist"));
    assert!(stdout.contains("--netlink"));
}

#[test]
#[serial]
fn test_check_of_unattached_device_exits_1() {
    // a device name that certainly has no /sys/block entry
    let status = Command::new(exe_path("nbd-client"))
        .args(["--check", "nbdtest"])
        .status()
        .expect("failed to run nbd-client --check");
    assert_eq!(status.code(), Some(1));
}

#[test]
#[serial]
fn test_no_arguments_is_a_usage_error() {
    let out = Command::new(exe_path("nbd-client"))
        .output()
        .expect("failed to run nbd-client");
    assert_eq!(out.status.code(), Some(1));
    let stderr = String::from_utf8(out.stderr).expect("non utf-8 output");
    assert!(stderr.contains("no information specified"));
}

#[test]
#[serial]
fn test_nonnumeric_port_is_rejected() {
    let out = Command::new(exe_path("nbd-client"))
        .args(["localhost", "teapot", "/dev/nbd0", "--nofork"])
        .output()
        .expect("failed to run nbd-client");
    assert_ne!(out.status.code(), Some(0));
}
