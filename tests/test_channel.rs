use std::io::{Read, Write};
use std::os::fd::AsFd;
use std::os::unix::net::UnixStream;

use procpool::MessageChannel;

fn channel_pair() -> (MessageChannel, MessageChannel) {
    let (a, b) = UnixStream::pair().unwrap();
    (
        MessageChannel::from_stream(a),
        MessageChannel::from_stream(b),
    )
}

#[test]
fn test_array_round_trip() {
    let (tx, rx) = channel_pair();

    tx.write_array(["hello", "world !!"]).unwrap();
    assert_eq!(rx.read_array().unwrap(), vec!["hello", "world !!"]);

    tx.write_array(["one"]).unwrap();
    assert_eq!(rx.read_array().unwrap(), vec!["one"]);

    // empty fields survive
    tx.write_array(["", "x", ""]).unwrap();
    assert_eq!(rx.read_array().unwrap(), vec!["", "x", ""]);

    // so does the empty message
    tx.write_array(Vec::<String>::new()).unwrap();
    assert_eq!(rx.read_array().unwrap(), Vec::<String>::new());
}

#[test]
fn test_array_rejects_nul_in_field() {
    let (tx, _rx) = channel_pair();
    let err = tx.write_array(["bad\0field"]).unwrap_err();
    assert!(err.is_protocol_violation());
}

#[test]
fn test_scalar_round_trip() {
    let (tx, rx) = channel_pair();

    tx.write_scalar(b"some long string which can contain \x00 binary data")
        .unwrap();
    assert_eq!(
        rx.read_scalar().unwrap(),
        b"some long string which can contain \x00 binary data"
    );

    tx.write_scalar(b"").unwrap();
    assert_eq!(rx.read_scalar().unwrap(), b"");
}

#[test]
fn test_read_array_at_eof() {
    let (tx, rx) = channel_pair();
    drop(tx);
    assert!(rx.read_array().unwrap_err().is_eof());
}

#[test]
fn test_read_scalar_at_eof() {
    let (tx, rx) = channel_pair();
    drop(tx);
    assert!(rx.read_scalar().unwrap_err().is_eof());
}

#[test]
fn test_file_descriptor_passing() {
    let (tx, rx) = channel_pair();
    let (carried_a, mut carried_b) = UnixStream::pair().unwrap();

    tx.write_file_descriptor(carried_a.as_fd()).unwrap();
    let received = rx.read_file_descriptor().unwrap();

    // the received descriptor is the same socket: bytes written into it
    // come out of the peer
    let mut received = UnixStream::from(received);
    received.write_all(b"ping").unwrap();
    let mut buf = [0u8; 4];
    carried_b.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"ping");
}

#[test]
fn test_mixed_message_sequence() {
    // array, fd, scalar share the stream; order is preserved
    let (tx, rx) = channel_pair();
    let (carried_a, _carried_b) = UnixStream::pair().unwrap();

    tx.write_array(["spawn_application", "/srv/app", "", ""])
        .unwrap();
    tx.write_file_descriptor(carried_a.as_fd()).unwrap();
    tx.write_scalar(b"trailing").unwrap();

    assert_eq!(
        rx.read_array().unwrap(),
        vec!["spawn_application", "/srv/app", "", ""]
    );
    rx.read_file_descriptor().unwrap();
    assert_eq!(rx.read_scalar().unwrap(), b"trailing");
}

#[test]
fn test_read_file_descriptor_without_one_is_protocol_violation() {
    let (tx, rx) = channel_pair();
    // plain data where ancillary data was expected
    tx.write_scalar(b"x").unwrap();
    let err = rx.read_file_descriptor().unwrap_err();
    assert!(err.is_protocol_violation());
}
