// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::collections::BTreeMap;
use std::io::Read;

use bus_protocol::wire::{demarshal, marshal};
use bus_protocol::{process_val, DictValue, Error, ObjectPath, UnixFd, Variant};

fn round_trip(args: Vec<Variant>) {
    let body = marshal(&args).unwrap();
    let after = demarshal(&body.data, &body.signature, &body.fds).unwrap();
    assert_eq!(args, after);
}

#[test]
fn basic_types_round_trip() {
    round_trip(vec![
        Variant::Bool(true),
        Variant::Byte(0xa5),
        Variant::Int16(-12345),
        Variant::Uint16(54321),
        Variant::Int32(-7),
        Variant::Uint32(7),
        Variant::Int64(-1234567890123),
        Variant::Uint64(9876543210987),
        Variant::String("hi".to_string()),
        Variant::ObjectPath(ObjectPath::new("/test/object")),
    ]);
}

#[test]
fn vectors_round_trip() {
    round_trip(vec![
        Variant::ByteArray(vec![1, 2, 3]),
        Variant::Uint16Array(vec![10, 20]),
        Variant::Int32Array(vec![-1, 0, 1]),
        Variant::Uint32Array(vec![42]),
        Variant::Uint64Array(vec![u64::MAX, 0]),
        Variant::StringArray(vec!["a".to_string(), "bc".to_string(), String::new()]),
        Variant::ObjectPathArray(vec![ObjectPath::new("/a"), ObjectPath::new("/b/c")]),
    ]);
}

#[test]
fn empty_vectors_keep_their_signature() {
    let cases: Vec<(Variant, &str)> = vec![
        (Variant::ByteArray(vec![]), "ay"),
        (Variant::Uint16Array(vec![]), "aq"),
        (Variant::Int32Array(vec![]), "ai"),
        (Variant::Uint32Array(vec![]), "au"),
        (Variant::Uint64Array(vec![]), "at"),
        (Variant::StringArray(vec![]), "as"),
        (Variant::ObjectPathArray(vec![]), "ao"),
        (Variant::Dict(BTreeMap::new()), "a{sv}"),
    ];

    for (arg, expected_sig) in cases {
        let body = marshal(&vec![arg.clone()]).unwrap();
        assert_eq!(body.signature, expected_sig);

        let after = demarshal(&body.data, &body.signature, &body.fds).unwrap();
        assert_eq!(after, vec![arg]);
    }
}

#[test]
fn dictionary_round_trip() {
    let (mut a, b) = bus_protocol::pipe::pipe().unwrap();

    let mut dict = BTreeMap::new();
    dict.insert("flag".to_string(), DictValue::Bool(false));
    dict.insert("byte".to_string(), DictValue::Byte(9));
    dict.insert("small".to_string(), DictValue::Int16(-3));
    dict.insert("word".to_string(), DictValue::Uint16(17));
    dict.insert("count".to_string(), DictValue::Int32(-100));
    dict.insert("index".to_string(), DictValue::Uint32(100));
    dict.insert("big".to_string(), DictValue::Int64(i64::MIN));
    dict.insert("huge".to_string(), DictValue::Uint64(u64::MAX));
    dict.insert("name".to_string(), DictValue::String("value".to_string()));
    dict.insert(
        "where".to_string(),
        DictValue::ObjectPath(ObjectPath::new("/somewhere")),
    );
    dict.insert("pipe".to_string(), DictValue::UnixFd(UnixFd::new(&b.fd)));

    let args = vec![Variant::Dict(dict)];
    let body = marshal(&args).unwrap();
    assert_eq!(body.fds.len(), 1);

    let after = demarshal(&body.data, &body.signature, &body.fds).unwrap();
    assert_eq!(args, after);

    // the fd that came back out of the dictionary reaches the same socket
    let Variant::Dict(decoded) = &after[0] else {
        panic!("expected a dictionary argument");
    };
    let Some(DictValue::UnixFd(fd)) = decoded.get("pipe") else {
        panic!("expected a unix fd dictionary value");
    };
    let mut dup = fd.clone();
    let owned = dup.take().unwrap();
    nix::unistd::write(&owned, b"dict").unwrap();

    let mut received = [0u8; 4];
    a.read_exact(&mut received).unwrap();
    assert_eq!(&received, b"dict");
}

#[test]
fn mixed_alignment_round_trip() {
    // a byte before each wider type forces every padding path
    round_trip(vec![
        Variant::Byte(1),
        Variant::Uint64(2),
        Variant::Byte(3),
        Variant::Uint32(4),
        Variant::Byte(5),
        Variant::String("padded".to_string()),
        Variant::Byte(6),
        Variant::Uint64Array(vec![7, 8]),
    ]);
}

#[test]
fn file_descriptor_round_trip() {
    let (mut a, b) = bus_protocol::pipe::pipe().unwrap();

    let args = vec![Variant::UnixFd(UnixFd::new(&b.fd))];
    let body = marshal(&args).unwrap();
    assert_eq!(body.signature, "h");
    assert_eq!(body.fds.len(), 1);

    let after = demarshal(&body.data, &body.signature, &body.fds).unwrap();
    let Variant::UnixFd(fd) = &after[0] else {
        panic!("expected a unix fd argument");
    };
    assert!(fd.is_valid());

    // the duplicate must reach the same socket as the original
    let mut dup = fd.clone();
    let owned = dup.take().unwrap();
    nix::unistd::write(&owned, b"ping").unwrap();

    let mut received = [0u8; 4];
    a.read_exact(&mut received).unwrap();
    assert_eq!(&received, b"ping");
}

#[test]
fn marshalling_an_invalid_fd_fails() {
    let args = vec![Variant::UnixFd(UnixFd::invalid())];
    assert!(matches!(marshal(&args), Err(Error::Marshal(_))));
}

#[test]
fn fd_arguments_compare_by_underlying_file() {
    let (a, b) = bus_protocol::pipe::pipe().unwrap();

    let first = UnixFd::new(&a.fd);
    let same = UnixFd::new(&a.fd);
    let other = UnixFd::new(&b.fd);

    assert_eq!(first, same);
    assert_ne!(first, other);
    assert_eq!(UnixFd::invalid(), UnixFd::invalid());
    assert_ne!(first, UnixFd::invalid());
}

#[test]
fn type_mismatch_is_reported() {
    let args = vec![Variant::String("seven".to_string())];

    match process_val::<u32>(&args, 0) {
        Err(Error::TypeMismatch { index, expected }) => {
            assert_eq!(index, 0);
            assert_eq!(expected, "uint32");
        }
        other => panic!("expected a type mismatch, got {other:?}"),
    }

    // missing arguments report the same way
    assert!(matches!(
        process_val::<u32>(&args, 5),
        Err(Error::TypeMismatch { index: 5, .. })
    ));

    assert_eq!(process_val::<String>(&args, 0).unwrap(), "seven");
}

#[test]
fn truncated_body_is_rejected() {
    let args = vec![Variant::String("truncate me".to_string())];
    let body = marshal(&args).unwrap();

    let cut = &body.data[..body.data.len() - 4];
    assert!(matches!(
        demarshal(cut, &body.signature, &body.fds),
        Err(Error::Demarshal(_))
    ));
}
