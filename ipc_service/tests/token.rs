// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use ipc_service::token::{SecurityTokenClient, TOKEN_MESSAGE_ID};
use ipc_service::Error;

fn helper_socket_path() -> PathBuf {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    std::env::temp_dir().join(format!(
        "token-helper-{}-{}.sock",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::SeqCst)
    ))
}

fn put_varint(out: &mut Vec<u8>, mut value: u32) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            break;
        }
    }
}

fn reply_frame(id: u16, payload: &[u8]) -> Vec<u8> {
    // the helper answers with the request id shifted left, low bit set
    let ident = (u32::from(id) << 1) | 1;
    let mut frame = Vec::new();
    put_varint(&mut frame, payload.len() as u32 + 1);
    put_varint(&mut frame, ident);
    frame.extend_from_slice(payload);
    frame
}

/// Serves `behaviours` connections: each entry handles one connection and
/// says what to answer (None means read the request but never reply).
fn spawn_helper(path: PathBuf, behaviours: Vec<Option<Vec<u8>>>) {
    let listener = UnixListener::bind(&path).unwrap();
    thread::spawn(move || {
        for behaviour in behaviours {
            let Ok((mut stream, _)) = listener.accept() else {
                return;
            };
            handle_helper_connection(&mut stream, behaviour);
        }
    });
}

fn handle_helper_connection(stream: &mut UnixStream, behaviour: Option<Vec<u8>>) {
    let mut request = [0u8; 2048];
    let Ok(n) = stream.read(&mut request) else {
        return;
    };
    if n == 0 {
        return;
    }

    // sanity: request id 10 arrives shifted left by one
    assert_eq!(request[1], u8::try_from(TOKEN_MESSAGE_ID << 1).unwrap());

    if let Some(reply) = behaviour {
        let _ = stream.write_all(&reply);
    }
    // hold the connection open until the client gives up on it
    thread::sleep(Duration::from_millis(200));
}

#[test]
fn token_request_round_trip() {
    let path = helper_socket_path();
    spawn_helper(
        path.clone(),
        vec![Some(reply_frame(TOKEN_MESSAGE_ID, b"opaque-token-data"))],
    );

    let client = SecurityTokenClient::new(&path, None);
    client.open().unwrap();
    assert!(client.is_open());

    let token = client.get_token("https://example.com/app").unwrap();
    assert_eq!(token, b"opaque-token-data");

    client.close();
    assert!(!client.is_open());
    let _ = std::fs::remove_file(&path);
}

#[test]
fn get_token_without_open_fails() {
    let client = SecurityTokenClient::new("/nonexistent/helper.sock", None);
    assert!(matches!(
        client.get_token("https://example.com"),
        Err(Error::NotConnected)
    ));
}

#[test]
fn silent_helper_times_out_and_the_socket_is_reopened() {
    let path = helper_socket_path();
    // first connection never answers, the second one is for the reopen
    spawn_helper(path.clone(), vec![None, None]);

    let client =
        SecurityTokenClient::new(&path, Some(Duration::from_millis(100)));
    client.open().unwrap();

    assert!(matches!(
        client.get_token("https://example.com"),
        Err(Error::Timeout)
    ));

    // the failed exchange dropped the old socket and opened a fresh one
    assert!(client.is_open());
    let _ = std::fs::remove_file(&path);
}

#[test]
fn mismatched_reply_id_is_an_error() {
    let path = helper_socket_path();
    spawn_helper(path.clone(), vec![Some(reply_frame(11, b"wrong")), None]);

    let client = SecurityTokenClient::new(&path, Some(Duration::from_millis(200)));
    client.open().unwrap();

    assert!(matches!(
        client.get_token("https://example.com"),
        Err(Error::Bus(_))
    ));
    assert!(client.is_open());
    let _ = std::fs::remove_file(&path);
}
