// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! A minimal in-process bus daemon, just enough for exercising the service
//! end to end: EXTERNAL auth, Hello / name registration, method call routing
//! by destination, signal broadcast, descriptor forwarding and
//! `NameOwnerChanged` on disconnect.

use std::collections::HashMap;
use std::io::{IoSlice, IoSliceMut, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::socket::{
    recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags, UnixAddr,
};

use bus_protocol::message::{drain_frames, Message, MessageType};
use bus_protocol::{BusAddress, Variant};

pub struct TestDaemon {
    pub address: BusAddress,
    path: PathBuf,
}

struct Client {
    unique: String,
    stream: UnixStream,
    write_lock: Mutex<()>,
}

struct Shared {
    clients: Mutex<HashMap<String, Arc<Client>>>,
    names: Mutex<HashMap<String, String>>,
    next_client: AtomicU64,
    serial: AtomicU32,
}

impl TestDaemon {
    pub fn start() -> TestDaemon {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let path = std::env::temp_dir().join(format!(
            "testbus-{}-{}.sock",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::SeqCst)
        ));
        let _ = std::fs::remove_file(&path);

        let listener = UnixListener::bind(&path).expect("failed to bind test bus socket");
        let shared = Arc::new(Shared {
            clients: Mutex::new(HashMap::new()),
            names: Mutex::new(HashMap::new()),
            next_client: AtomicU64::new(1),
            serial: AtomicU32::new(1),
        });

        let accept_shared = shared.clone();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                let shared = accept_shared.clone();
                thread::spawn(move || serve_client(&shared, stream));
            }
        });

        TestDaemon {
            address: BusAddress::Address(format!("unix:path={}", path.display())),
            path,
        }
    }
}

impl Drop for TestDaemon {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Waits for a condition with a timeout, for the asynchronous assertions.
pub fn wait_until<F: FnMut() -> bool>(mut condition: F, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(10));
    }
}

fn serve_client(shared: &Arc<Shared>, mut stream: UnixStream) {
    if !server_auth(&mut stream) {
        return;
    }

    let unique = format!(":1.{}", shared.next_client.fetch_add(1, Ordering::SeqCst));
    let client = Arc::new(Client {
        unique: unique.clone(),
        stream: match stream.try_clone() {
            Ok(s) => s,
            Err(_) => return,
        },
        write_lock: Mutex::new(()),
    });

    let mut registered = false;
    let mut buf: Vec<u8> = Vec::new();
    let mut fds: Vec<OwnedFd> = Vec::new();

    'serve: loop {
        let mut chunk = [0u8; 16384];
        let mut cmsg = Vec::with_capacity(256);
        let received = {
            let mut iov = [IoSliceMut::new(&mut chunk)];
            match recvmsg::<UnixAddr>(
                stream.as_raw_fd(),
                &mut iov,
                Some(&mut cmsg),
                MsgFlags::MSG_CMSG_CLOEXEC,
            ) {
                Ok(msg) => {
                    if let Ok(cmsgs) = msg.cmsgs() {
                        for c in cmsgs {
                            if let ControlMessageOwned::ScmRights(received_fds) = c {
                                for raw in received_fds {
                                    // SAFETY: SCM_RIGHTS delivered fresh
                                    // descriptors that we now own.
                                    fds.push(unsafe { OwnedFd::from_raw_fd(raw) });
                                }
                            }
                        }
                    }
                    msg.bytes
                }
                Err(Errno::EINTR) => continue,
                Err(_) => break 'serve,
            }
        };

        if received == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..received]);

        let messages = match drain_frames(&mut buf, &mut fds) {
            Ok(messages) => messages,
            Err(_) => break,
        };

        for mut msg in messages {
            msg.sender = Some(unique.clone());

            if !registered {
                if is_daemon_call(&msg, "Hello") {
                    shared
                        .clients
                        .lock()
                        .unwrap()
                        .insert(unique.clone(), client.clone());
                    registered = true;
                    reply_args(shared, &client, &msg, vec![Variant::String(unique.clone())]);
                }
                continue;
            }

            route(shared, &client, msg);
        }
    }

    if registered {
        shared.clients.lock().unwrap().remove(&unique);

        let released: Vec<String> = {
            let mut names = shared.names.lock().unwrap();
            let released = names
                .iter()
                .filter(|(_, owner)| **owner == unique)
                .map(|(name, _)| name.clone())
                .collect::<Vec<_>>();
            for name in &released {
                names.remove(name);
            }
            released
        };

        for name in released.iter().map(String::as_str).chain([unique.as_str()]) {
            broadcast_name_owner_changed(shared, name, &unique);
        }
    }
}

/// Byte-wise line reads so nothing belonging to the binary stream after
/// BEGIN is consumed.
fn server_auth(stream: &mut UnixStream) -> bool {
    let mut nul = [0u8; 1];
    if stream.read_exact(&mut nul).is_err() || nul[0] != 0 {
        return false;
    }

    loop {
        let Some(line) = read_auth_line(stream) else {
            return false;
        };

        if line.starts_with("AUTH EXTERNAL") {
            if stream.write_all(b"OK 1234deadbeef5678deadbeef9abc\r\n").is_err() {
                return false;
            }
        } else if line == "NEGOTIATE_UNIX_FD" {
            if stream.write_all(b"AGREE_UNIX_FD\r\n").is_err() {
                return false;
            }
        } else if line == "BEGIN" {
            return true;
        } else if stream.write_all(b"ERROR\r\n").is_err() {
            return false;
        }
    }
}

fn read_auth_line(stream: &mut UnixStream) -> Option<String> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        if stream.read_exact(&mut byte).is_err() {
            return None;
        }
        if byte[0] == b'\n' {
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            return String::from_utf8(line).ok();
        }
        line.push(byte[0]);
    }
}

fn is_daemon_call(msg: &Message, member: &str) -> bool {
    msg.msg_type == MessageType::MethodCall
        && msg.destination.as_deref() == Some("org.freedesktop.DBus")
        && msg.member.as_deref() == Some(member)
}

fn route(shared: &Arc<Shared>, client: &Arc<Client>, msg: Message) {
    if msg.destination.as_deref() == Some("org.freedesktop.DBus") {
        handle_daemon_call(shared, client, &msg);
        return;
    }

    match msg.msg_type {
        MessageType::Signal => {
            let others: Vec<Arc<Client>> = shared
                .clients
                .lock()
                .unwrap()
                .values()
                .filter(|c| c.unique != client.unique)
                .cloned()
                .collect();
            for peer in others {
                send_message(&peer, &msg);
            }
        }
        _ => {
            let destination = msg.destination.clone().unwrap_or_default();
            let target = {
                let names = shared.names.lock().unwrap();
                let unique = names
                    .get(&destination)
                    .cloned()
                    .unwrap_or_else(|| destination.clone());
                shared.clients.lock().unwrap().get(&unique).cloned()
            };

            match target {
                Some(peer) => send_message(&peer, &msg),
                None => {
                    if msg.msg_type == MessageType::MethodCall {
                        let error = Message::error(
                            msg.serial,
                            Some(&client.unique),
                            "org.freedesktop.DBus.Error.ServiceUnknown",
                            &format!("The name {destination} has no owner"),
                        );
                        send_daemon_message(shared, client, error);
                    }
                }
            }
        }
    }
}

fn handle_daemon_call(shared: &Arc<Shared>, client: &Arc<Client>, msg: &Message) {
    let member = msg.member.as_deref().unwrap_or("");
    let args = msg.args().unwrap_or_default();

    match member {
        "RequestName" => {
            if let Some(Variant::String(name)) = args.first() {
                shared
                    .names
                    .lock()
                    .unwrap()
                    .insert(name.clone(), client.unique.clone());
            }
            reply_args(shared, client, msg, vec![Variant::Uint32(1)]);
        }
        "ReleaseName" => {
            if let Some(Variant::String(name)) = args.first() {
                shared.names.lock().unwrap().remove(name);
            }
            reply_args(shared, client, msg, vec![Variant::Uint32(1)]);
        }
        "NameHasOwner" => {
            let owned = match args.first() {
                Some(Variant::String(name)) => {
                    shared.names.lock().unwrap().contains_key(name)
                        || shared.clients.lock().unwrap().contains_key(name)
                }
                _ => false,
            };
            reply_args(shared, client, msg, vec![Variant::Bool(owned)]);
        }
        "GetConnectionUnixUser" => {
            let uid = nix::unistd::getuid().as_raw();
            reply_args(shared, client, msg, vec![Variant::Uint32(uid)]);
        }
        "AddMatch" | "RemoveMatch" => {
            reply_args(shared, client, msg, vec![]);
        }
        other => {
            let error = Message::error(
                msg.serial,
                Some(&client.unique),
                "org.freedesktop.DBus.Error.UnknownMethod",
                &format!("No such method {other}"),
            );
            send_daemon_message(shared, client, error);
        }
    }
}

fn reply_args(shared: &Arc<Shared>, client: &Arc<Client>, request: &Message, args: Vec<Variant>) {
    let mut reply = Message::method_return(request);
    if reply.set_args(&args).is_err() {
        return;
    }
    send_daemon_message(shared, client, reply);
}

fn send_daemon_message(shared: &Arc<Shared>, client: &Arc<Client>, mut msg: Message) {
    msg.sender = Some("org.freedesktop.DBus".to_string());
    msg.serial = shared.serial.fetch_add(1, Ordering::SeqCst);
    send_message(client, &msg);
}

fn broadcast_name_owner_changed(shared: &Arc<Shared>, name: &str, old_owner: &str) {
    let mut signal = Message::signal(
        "/org/freedesktop/DBus",
        "org.freedesktop.DBus",
        "NameOwnerChanged",
    );
    if signal
        .set_args(&vec![name.into(), old_owner.into(), "".into()])
        .is_err()
    {
        return;
    }
    signal.sender = Some("org.freedesktop.DBus".to_string());
    signal.serial = shared.serial.fetch_add(1, Ordering::SeqCst);

    let clients: Vec<Arc<Client>> = shared.clients.lock().unwrap().values().cloned().collect();
    for client in clients {
        send_message(&client, &signal);
    }
}

fn send_message(client: &Client, msg: &Message) {
    let Ok(data) = msg.encode() else { return };
    let raw_fds: Vec<RawFd> = msg.fds.iter().map(|f| f.as_raw_fd()).collect();

    let _guard = client.write_lock.lock().unwrap();
    let mut offset = 0;
    while offset < data.len() {
        let iov = [IoSlice::new(&data[offset..])];
        let scm;
        let cmsgs: &[ControlMessage] = if offset == 0 && !raw_fds.is_empty() {
            scm = [ControlMessage::ScmRights(&raw_fds)];
            &scm
        } else {
            &[]
        };

        match sendmsg::<UnixAddr>(
            client.stream.as_raw_fd(),
            &iov,
            cmsgs,
            MsgFlags::empty(),
            None,
        ) {
            Ok(written) => offset += written,
            Err(Errno::EINTR) => continue,
            Err(_) => return,
        }
    }
}
