// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use bus_protocol::message::{drain_frames, Message, MessageType};
use bus_protocol::{BusAddress, Error, Variant};

#[test]
fn method_call_round_trip() {
    let mut msg = Message::method_call("test.ipc.svc", "/test", "test.ipc.if", "Echo");
    msg.set_args(&vec![Variant::Uint32(7), Variant::String("hi".to_string())])
        .unwrap();
    msg.serial = 42;
    msg.sender = Some(":1.5".to_string());

    let data = msg.encode().unwrap();
    let mut fds = Vec::new();
    let after = Message::decode(&data, &mut fds).unwrap();

    assert_eq!(after.msg_type, MessageType::MethodCall);
    assert_eq!(after.serial, 42);
    assert_eq!(after.destination.as_deref(), Some("test.ipc.svc"));
    assert_eq!(after.path.as_deref(), Some("/test"));
    assert_eq!(after.interface.as_deref(), Some("test.ipc.if"));
    assert_eq!(after.member.as_deref(), Some("Echo"));
    assert_eq!(after.sender.as_deref(), Some(":1.5"));
    assert_eq!(after.signature, "us");
    assert_eq!(
        after.args().unwrap(),
        vec![Variant::Uint32(7), Variant::String("hi".to_string())]
    );
}

#[test]
fn signal_round_trip() {
    let mut msg = Message::signal("/obj", "test.ipc.if", "Tick");
    msg.set_args(&vec![Variant::Uint64(42)]).unwrap();
    msg.serial = 1;

    let data = msg.encode().unwrap();
    let mut fds = Vec::new();
    let after = Message::decode(&data, &mut fds).unwrap();

    assert_eq!(after.msg_type, MessageType::Signal);
    assert_eq!(after.member.as_deref(), Some("Tick"));
    assert_eq!(after.args().unwrap(), vec![Variant::Uint64(42)]);
}

#[test]
fn reply_addresses_the_caller() {
    let mut request = Message::method_call("svc", "/o", "if", "M");
    request.serial = 9;
    request.sender = Some(":1.7".to_string());

    let reply = Message::method_return(&request);
    assert_eq!(reply.msg_type, MessageType::MethodReturn);
    assert_eq!(reply.reply_serial, Some(9));
    assert_eq!(reply.destination.as_deref(), Some(":1.7"));
}

#[test]
fn error_reply_carries_description() {
    let mut msg = Message::error(
        17,
        Some(":1.2"),
        "org.freedesktop.DBus.Error.NoReply",
        "Did not receive a reply",
    );
    msg.serial = 3;

    let data = msg.encode().unwrap();
    let mut fds = Vec::new();
    let after = Message::decode(&data, &mut fds).unwrap();

    assert_eq!(after.msg_type, MessageType::Error);
    assert_eq!(after.reply_serial, Some(17));
    assert_eq!(
        after.error_name.as_deref(),
        Some("org.freedesktop.DBus.Error.NoReply")
    );
    assert_eq!(
        after.args().unwrap(),
        vec![Variant::String("Did not receive a reply".to_string())]
    );
}

#[test]
fn incomplete_messages_are_rejected() {
    // an unsupported endianness marker must fail fast
    let mut header = [0u8; 16];
    header[0] = b'B';
    header[3] = 1;
    assert!(matches!(
        Message::required_len(&header),
        Err(Error::Demarshal(_))
    ));

    // as must an unknown protocol version
    header[0] = b'l';
    header[3] = 9;
    assert!(matches!(
        Message::required_len(&header),
        Err(Error::Demarshal(_))
    ));
}

#[test]
fn frames_split_correctly() {
    let mut first = Message::signal("/a", "if.a", "One");
    first.serial = 1;
    let mut second = Message::signal("/b", "if.b", "Two");
    second.set_args(&vec![Variant::Uint32(2)]).unwrap();
    second.serial = 2;

    let mut stream = first.encode().unwrap();
    stream.extend_from_slice(&second.encode().unwrap());
    // plus a partial third message
    let mut third = Message::signal("/c", "if.c", "Three");
    third.serial = 3;
    let third_data = third.encode().unwrap();
    stream.extend_from_slice(&third_data[..10]);

    let mut buf = stream;
    let mut fds = Vec::new();
    let messages = drain_frames(&mut buf, &mut fds).unwrap();

    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].member.as_deref(), Some("One"));
    assert_eq!(messages[1].member.as_deref(), Some("Two"));

    // the partial tail stays buffered until the rest arrives
    assert_eq!(buf.len(), 10);
    buf.extend_from_slice(&third_data[10..]);
    let rest = drain_frames(&mut buf, &mut fds).unwrap();
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0].member.as_deref(), Some("Three"));
    assert!(buf.is_empty());
}

#[test]
fn addresses_parse_to_socket_paths() {
    let address = BusAddress::Address("unix:path=/tmp/test-bus.sock".to_string());
    assert_eq!(
        address.socket_path().unwrap(),
        std::path::PathBuf::from("/tmp/test-bus.sock")
    );

    let with_params =
        BusAddress::Address("unix:path=/run/bus,guid=abcdef".to_string());
    assert_eq!(
        with_params.socket_path().unwrap(),
        std::path::PathBuf::from("/run/bus")
    );

    assert!(BusAddress::Address("tcp:host=localhost".to_string())
        .socket_path()
        .is_err());
    assert!(BusAddress::Address("unix:abstract=/hidden".to_string())
        .socket_path()
        .is_err());

    let parsed: BusAddress = "system".parse().unwrap();
    assert_eq!(parsed, BusAddress::System);
    let parsed: BusAddress = "unix:path=/x".parse().unwrap();
    assert_eq!(parsed, BusAddress::Address("unix:path=/x".to_string()));
    assert!("bogus".parse::<BusAddress>().is_err());
}
