// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The low level connection engine. It owns the bus socket, queues traffic in
//! both directions, and tracks in-flight method calls with their deadlines.
//!
//! The engine never polls by itself. Whoever runs the event loop drains
//! [`Channel::take_watch_requests`] / [`Channel::take_timer_requests`] after
//! every call into the engine and feeds readiness and timer expiry back in
//! through [`Channel::handle_watch`] and [`Channel::handle_timeout`]. All
//! methods must be called from that one event-loop thread.

use log::*;

use std::collections::{HashMap, VecDeque};
use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::socket::{
    connect, recvmsg, sendmsg, socket, AddressFamily, ControlMessage, ControlMessageOwned,
    MsgFlags, SockFlag, SockType, UnixAddr,
};

use crate::message::{drain_frames, Message, MessageType};
use crate::variant::process_val;
use crate::{auth, BusAddress, Error};
use crate::{DBUS_INTERFACE, DBUS_PATH, DBUS_SERVICE, ERROR_DISCONNECTED, ERROR_NO_REPLY};

/// Timeout applied to a method call when the caller asks for the default.
pub const DEFAULT_METHOD_TIMEOUT_MS: i32 = 25_000;

/// Watch flag bits requested of the event loop, one per readiness condition.
pub const WATCH_READABLE: u32 = 0x1;
pub const WATCH_WRITABLE: u32 = 0x2;
pub const WATCH_ERROR: u32 = 0x4;
pub const WATCH_HANGUP: u32 = 0x8;

/// Identifier of a watch requested by the engine.
pub type WatchId = u64;

const READ_WATCH: WatchId = 1;
const WRITE_WATCH: WatchId = 2;

const RECV_CHUNK: usize = 16 * 1024;
const CMSG_CAPACITY: usize = 256;

/// A request from the engine to the event loop's watch multiplexer.
#[derive(Debug)]
pub enum WatchRequest {
    Add {
        id: WatchId,
        fd: RawFd,
        flags: u32,
        enabled: bool,
    },
    Toggle {
        id: WatchId,
        flags: u32,
        enabled: bool,
    },
    Remove {
        id: WatchId,
    },
}

/// A request from the engine to the event loop's timeout multiplexer.
#[derive(Debug)]
pub enum TimerRequest {
    Add { id: u64, interval: Duration },
    Remove { id: u64 },
}

/// One item popped from the engine's incoming queue.
pub enum Dispatched {
    /// The completion of an outbound method call issued through
    /// [`Channel::send_with_reply`].
    Reply { call_serial: u32, message: Message },

    /// Anything else: incoming method calls, signals, and stray replies.
    Message(Message),
}

struct OutFrame {
    data: Vec<u8>,
    fds: Vec<OwnedFd>,
    offset: usize,
}

pub struct Channel {
    sock: OwnedFd,
    unique_name: String,
    fd_passing: bool,
    connected: bool,
    next_serial: u32,
    out_queue: VecDeque<OutFrame>,
    in_buf: Vec<u8>,
    in_fds: Vec<OwnedFd>,
    in_queue: VecDeque<Message>,
    pending: HashMap<u32, ()>,
    watch_requests: Vec<WatchRequest>,
    timer_requests: Vec<TimerRequest>,
    write_watch_enabled: bool,
    dispatch_hook: Option<Box<dyn Fn() + Send>>,
}

impl Channel {
    /// Opens a private connection to the bus at `address`: connects the
    /// socket, authenticates, switches to non-blocking mode and registers on
    /// the bus with a `Hello` call.
    pub fn open(address: &BusAddress) -> Result<Channel, Error> {
        crate::global_init();

        let path = address.socket_path()?;
        let sock = socket(
            AddressFamily::Unix,
            SockType::Stream,
            SockFlag::SOCK_CLOEXEC,
            None,
        )?;

        let addr = UnixAddr::new(&path)?;
        loop {
            match connect(sock.as_raw_fd(), &addr) {
                Ok(()) => break,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    return Err(Error::Io(std::io::Error::new(
                        std::io::Error::from_raw_os_error(e as i32).kind(),
                        format!("failed to connect to bus socket {}: {e}", path.display()),
                    )))
                }
            }
        }

        let fd_passing = auth::authenticate(sock.as_fd())?;
        set_nonblocking(&sock)?;

        let mut channel = Channel {
            sock,
            unique_name: String::new(),
            fd_passing,
            connected: true,
            next_serial: 1,
            out_queue: VecDeque::new(),
            in_buf: Vec::new(),
            in_fds: Vec::new(),
            in_queue: VecDeque::new(),
            pending: HashMap::new(),
            watch_requests: Vec::new(),
            timer_requests: Vec::new(),
            write_watch_enabled: false,
            dispatch_hook: None,
        };

        // ask the event loop to monitor the socket; the write side starts
        // disabled and is toggled on whenever the out queue fills
        let raw = channel.sock.as_raw_fd();
        channel.watch_requests.push(WatchRequest::Add {
            id: READ_WATCH,
            fd: raw,
            flags: WATCH_READABLE | WATCH_ERROR | WATCH_HANGUP,
            enabled: true,
        });
        channel.watch_requests.push(WatchRequest::Add {
            id: WRITE_WATCH,
            fd: raw,
            flags: WATCH_WRITABLE,
            enabled: false,
        });

        let hello = Message::method_call(DBUS_SERVICE, DBUS_PATH, DBUS_INTERFACE, "Hello");
        let reply = channel.blocking_call(hello, Duration::from_secs(25))?;
        if reply.msg_type == MessageType::Error {
            return Err(Error::Auth(format!(
                "bus registration failed: {}",
                reply.error_name.as_deref().unwrap_or("unknown error")
            )));
        }
        channel.unique_name = process_val::<String>(&reply.args()?, 0)?;

        info!("connected to bus as {}", channel.unique_name);
        Ok(channel)
    }

    /// Our unique connection name, assigned by the bus.
    pub fn unique_name(&self) -> &str {
        &self.unique_name
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn supports_fd_passing(&self) -> bool {
        self.fd_passing
    }

    /// Installs the hook fired when the incoming queue becomes non-empty.
    pub fn set_dispatch_hook(&mut self, hook: Box<dyn Fn() + Send>) {
        self.dispatch_hook = Some(hook);
    }

    fn assign_serial(&mut self) -> u32 {
        let serial = self.next_serial;
        self.next_serial = self.next_serial.wrapping_add(1);
        if self.next_serial == 0 {
            self.next_serial = 1;
        }
        serial
    }

    /// Queues `msg` for transmission and returns its serial.
    pub fn send(&mut self, mut msg: Message) -> Result<u32, Error> {
        if !self.connected {
            return Err(Error::Disconnected);
        }
        if !msg.fds.is_empty() && !self.fd_passing {
            return Err(Error::Marshal(
                "bus connection does not support descriptor passing".into(),
            ));
        }

        let serial = self.assign_serial();
        msg.serial = serial;
        let data = msg.encode()?;
        let fds = msg.take_fds();

        self.out_queue.push_back(OutFrame {
            data,
            fds,
            offset: 0,
        });
        self.enable_write_watch();

        Ok(serial)
    }

    /// Queues a method call and registers a completion deadline for it. When
    /// the deadline passes before the reply arrives, an error reply is
    /// synthesised locally and delivered through the normal dispatch path.
    pub fn send_with_reply(&mut self, msg: Message, timeout_ms: i32) -> Result<u32, Error> {
        let timeout_ms = if timeout_ms <= 0 {
            DEFAULT_METHOD_TIMEOUT_MS
        } else {
            timeout_ms
        };

        let serial = self.send(msg)?;
        self.pending.insert(serial, ());
        self.timer_requests.push(TimerRequest::Add {
            id: u64::from(serial),
            interval: Duration::from_millis(timeout_ms as u64),
        });

        Ok(serial)
    }

    fn enable_write_watch(&mut self) {
        if !self.write_watch_enabled {
            self.write_watch_enabled = true;
            self.watch_requests.push(WatchRequest::Toggle {
                id: WRITE_WATCH,
                flags: WATCH_WRITABLE,
                enabled: true,
            });
        }
    }

    fn disable_write_watch(&mut self) {
        if self.write_watch_enabled {
            self.write_watch_enabled = false;
            self.watch_requests.push(WatchRequest::Toggle {
                id: WRITE_WATCH,
                flags: WATCH_WRITABLE,
                enabled: false,
            });
        }
    }

    /// Readiness callback from the event loop.
    pub fn handle_watch(&mut self, id: WatchId, flags: u32) {
        if !self.connected {
            return;
        }

        if id == READ_WATCH {
            if flags & (WATCH_ERROR | WATCH_HANGUP) != 0 {
                warn!("bus socket reported error/hang-up");
                self.local_disconnect();
                return;
            }
            if flags & WATCH_READABLE != 0 {
                self.read_ready();
            }
        } else if id == WRITE_WATCH && flags & WATCH_WRITABLE != 0 {
            self.write_ready();
        }
    }

    /// Deadline callback from the event loop for a pending method call.
    pub fn handle_timeout(&mut self, id: u64) {
        let serial = id as u32;
        self.timer_requests.push(TimerRequest::Remove { id });
        if self.pending.remove(&serial).is_some() {
            debug!("method call with serial {serial} timed out");
            let reply = Message::error(
                serial,
                None,
                ERROR_NO_REPLY,
                "Did not receive a reply within the requested time",
            );
            self.queue_incoming(reply);
        }
    }

    /// Pops the next item off the incoming queue, classifying completions of
    /// tracked method calls.
    pub fn dispatch(&mut self) -> Option<Dispatched> {
        let message = self.in_queue.pop_front()?;

        if matches!(
            message.msg_type,
            MessageType::MethodReturn | MessageType::Error
        ) {
            if let Some(serial) = message.reply_serial {
                if self.pending.remove(&serial).is_some() {
                    self.timer_requests.push(TimerRequest::Remove {
                        id: u64::from(serial),
                    });
                    return Some(Dispatched::Reply {
                        call_serial: serial,
                        message,
                    });
                }
            }
        }

        Some(Dispatched::Message(message))
    }

    pub fn has_messages(&self) -> bool {
        !self.in_queue.is_empty()
    }

    pub fn take_watch_requests(&mut self) -> Vec<WatchRequest> {
        std::mem::take(&mut self.watch_requests)
    }

    pub fn take_timer_requests(&mut self) -> Vec<TimerRequest> {
        std::mem::take(&mut self.timer_requests)
    }

    fn queue_incoming(&mut self, msg: Message) {
        let was_empty = self.in_queue.is_empty();
        self.in_queue.push_back(msg);
        if was_empty {
            if let Some(hook) = &self.dispatch_hook {
                hook();
            }
        }
    }

    fn read_ready(&mut self) {
        loop {
            let mut buf = [0u8; RECV_CHUNK];
            let mut cmsg = Vec::with_capacity(CMSG_CAPACITY);
            let received;
            {
                let mut iov = [IoSliceMut::new(&mut buf)];
                let res = recvmsg::<UnixAddr>(
                    self.sock.as_raw_fd(),
                    &mut iov,
                    Some(&mut cmsg),
                    MsgFlags::MSG_CMSG_CLOEXEC,
                );
                match res {
                    Ok(msg) => {
                        received = msg.bytes;
                        if let Ok(cmsgs) = msg.cmsgs() {
                            for c in cmsgs {
                                if let ControlMessageOwned::ScmRights(fds) = c {
                                    for raw in fds {
                                        // SAFETY: SCM_RIGHTS hands us freshly
                                        // installed descriptors that we now own.
                                        self.in_fds.push(unsafe { OwnedFd::from_raw_fd(raw) });
                                    }
                                }
                            }
                        }
                    }
                    Err(Errno::EAGAIN) => return,
                    Err(Errno::EINTR) => continue,
                    Err(e) => {
                        warn!("read error on bus socket: {e}");
                        self.local_disconnect();
                        return;
                    }
                }
            }

            if received == 0 {
                info!("bus closed the connection");
                self.local_disconnect();
                return;
            }

            self.in_buf.extend_from_slice(&buf[..received]);
            match drain_frames(&mut self.in_buf, &mut self.in_fds) {
                Ok(messages) => {
                    for msg in messages {
                        trace!(
                            "received {:?} serial {} from {:?}",
                            msg.msg_type,
                            msg.serial,
                            msg.sender
                        );
                        self.queue_incoming(msg);
                    }
                }
                Err(e) => {
                    // descriptor/frame association is lost, the stream is dead
                    error!("corrupt message stream: {e}");
                    self.local_disconnect();
                    return;
                }
            }
        }
    }

    fn write_ready(&mut self) {
        while let Some(frame) = self.out_queue.front_mut() {
            let iov = [IoSlice::new(&frame.data[frame.offset..])];
            let raw_fds: Vec<RawFd> = frame.fds.iter().map(|f| f.as_raw_fd()).collect();
            // descriptors ride with the first byte of the frame only
            let scm;
            let cmsgs: &[ControlMessage] = if frame.offset == 0 && !raw_fds.is_empty() {
                scm = [ControlMessage::ScmRights(&raw_fds)];
                &scm
            } else {
                &[]
            };

            match sendmsg::<UnixAddr>(
                self.sock.as_raw_fd(),
                &iov,
                cmsgs,
                MsgFlags::MSG_NOSIGNAL,
                None,
            ) {
                Ok(written) => {
                    frame.offset += written;
                    if frame.offset >= frame.data.len() {
                        self.out_queue.pop_front();
                    }
                }
                Err(Errno::EAGAIN) => return,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    warn!("write error on bus socket: {e}");
                    self.local_disconnect();
                    return;
                }
            }
        }

        self.disable_write_watch();
    }

    /// Marks the connection dead and fails every in-flight call so waiters do
    /// not hang until their safety timeout.
    fn local_disconnect(&mut self) {
        if !self.connected {
            return;
        }
        self.connected = false;

        self.watch_requests.push(WatchRequest::Remove { id: READ_WATCH });
        self.watch_requests.push(WatchRequest::Remove { id: WRITE_WATCH });
        self.write_watch_enabled = false;

        let serials: Vec<u32> = self.pending.keys().copied().collect();
        for serial in serials {
            self.pending.remove(&serial);
            self.timer_requests.push(TimerRequest::Remove {
                id: u64::from(serial),
            });
            let reply = Message::error(
                serial,
                None,
                ERROR_DISCONNECTED,
                "Connection was disconnected before a reply arrived",
            );
            self.queue_incoming(reply);
        }
    }

    /// Sends `msg` and waits for its reply, reading the socket directly. Any
    /// unrelated traffic read while waiting is queued for normal dispatch.
    ///
    /// This intentionally bypasses the event loop so it can be used both
    /// before the loop starts (bus registration) and from within it (daemon
    /// queries made while dispatching an incoming call).
    pub fn blocking_call(&mut self, msg: Message, timeout: Duration) -> Result<Message, Error> {
        let serial = self.send(msg)?;
        let deadline = Instant::now() + timeout;

        self.flush_until(deadline)?;

        loop {
            if let Some(index) = self
                .in_queue
                .iter()
                .position(|m| m.reply_serial == Some(serial))
            {
                // every remove from the middle preserves queue order
                if let Some(reply) = self.in_queue.remove(index) {
                    return Ok(reply);
                }
            }

            if !self.connected {
                return Err(Error::Disconnected);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Timeout);
            }

            self.wait_readable(remaining)?;
            self.read_ready();
        }
    }

    /// Pushes all queued outbound frames to the socket, waiting for
    /// writability as needed.
    pub fn flush_blocking(&mut self) -> Result<(), Error> {
        self.flush_until(Instant::now() + Duration::from_secs(10))
    }

    fn flush_until(&mut self, deadline: Instant) -> Result<(), Error> {
        while !self.out_queue.is_empty() {
            if !self.connected {
                return Err(Error::Disconnected);
            }

            self.write_ready();
            if self.out_queue.is_empty() {
                break;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Timeout);
            }

            let mut fds = [PollFd::new(self.sock.as_fd(), PollFlags::POLLOUT)];
            let timeout =
                PollTimeout::try_from(remaining.as_millis().min(i32::MAX as u128) as i32)
                    .unwrap_or(PollTimeout::MAX);
            match poll(&mut fds, timeout) {
                Ok(_) => {}
                Err(Errno::EINTR) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn wait_readable(&mut self, timeout: Duration) -> Result<(), Error> {
        let mut fds = [PollFd::new(self.sock.as_fd(), PollFlags::POLLIN)];
        let timeout = PollTimeout::try_from(timeout.as_millis().min(i32::MAX as u128) as i32)
            .unwrap_or(PollTimeout::MAX);
        match poll(&mut fds, timeout) {
            Ok(_) => Ok(()),
            Err(Errno::EINTR) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Orderly shutdown: best-effort flush of queued traffic, then mark the
    /// connection closed. The socket itself closes when the channel drops.
    pub fn disconnect(&mut self) {
        if self.connected {
            if let Err(e) = self.flush_blocking() {
                warn!("failed to flush connection on disconnect: {e}");
            }
        }
        self.local_disconnect();
    }
}

fn set_nonblocking(fd: &OwnedFd) -> Result<(), Error> {
    use nix::fcntl::{fcntl, FcntlArg, OFlag};

    let flags = fcntl(fd, FcntlArg::F_GETFL)?;
    let mut oflags = OFlag::from_bits_retain(flags);
    oflags.insert(OFlag::O_NONBLOCK);
    fcntl(fd, FcntlArg::F_SETFL(oflags))?;
    Ok(())
}
