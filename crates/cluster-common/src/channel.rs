// Framed message channel between the supervisor and one worker, carried
// over a Unix socketpair.
//
// The wire protocol is simple:
// - 4 bytes: body length as little-endian u32
// - 1 byte:  flags (bit 0 set when a descriptor rides along)
// - N bytes: body as one JSON value
//
// A frame with the handle flag set carries exactly one descriptor as
// SCM_RIGHTS ancillary data attached to its leading bytes. Both byte and
// ancillary ordering are FIFO on a stream socket, so pairing received
// descriptors with flagged frames in arrival order is sound.

use std::collections::VecDeque;
use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use nix::cmsg_space;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::socket::{
    recvmsg, sendmsg, shutdown, socketpair, AddressFamily, ControlMessage, ControlMessageOwned,
    MsgFlags, Shutdown, SockFlag, SockType, UnixAddr,
};
use serde_json::Value;
use tokio::io::unix::AsyncFd;
use tokio::sync::Mutex;

use crate::constants::MAX_FRAME_LEN;
use crate::error::ClusterError;

const HEADER_LEN: usize = 5;
const FLAG_HANDLE: u8 = 0x01;
const RECV_CHUNK: usize = 64 * 1024;

/// One end of the duplex message-plus-handle channel.
pub struct MessageChannel {
    io: Arc<AsyncFd<OwnedFd>>,
}

impl MessageChannel {
    /// Create a connected pair. The first element is the local channel;
    /// the second is the raw descriptor destined for the peer process.
    pub fn pair() -> Result<(MessageChannel, OwnedFd), ClusterError> {
        let (ours, theirs) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::SOCK_CLOEXEC | SockFlag::SOCK_NONBLOCK,
        )
        .map_err(io::Error::from)?;
        Ok((Self::from_fd(ours)?, theirs))
    }

    /// Wrap an inherited or transferred descriptor.
    pub fn from_fd(fd: OwnedFd) -> Result<MessageChannel, ClusterError> {
        set_nonblocking(fd.as_raw_fd())?;
        let io = AsyncFd::new(fd).map_err(ClusterError::Io)?;
        Ok(Self { io: Arc::new(io) })
    }

    /// Split into a cloneable sender and the single receiver.
    pub fn split(self) -> (ChannelSender, ChannelReceiver) {
        let sender = ChannelSender {
            io: Arc::clone(&self.io),
            write_gate: Arc::new(Mutex::new(())),
            closed: Arc::new(AtomicBool::new(false)),
        };
        let receiver = ChannelReceiver {
            io: self.io,
            buf: BytesMut::with_capacity(RECV_CHUNK),
            fds: VecDeque::new(),
            eof: false,
        };
        (sender, receiver)
    }
}

fn set_nonblocking(fd: RawFd) -> Result<(), ClusterError> {
    let bits = fcntl(fd, FcntlArg::F_GETFL).map_err(io::Error::from)?;
    let mut flags = OFlag::from_bits_truncate(bits);
    flags.insert(OFlag::O_NONBLOCK);
    fcntl(fd, FcntlArg::F_SETFL(flags)).map_err(io::Error::from)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Sender
// ---------------------------------------------------------------------------

/// Write half of the channel. Clones share one socket; whole frames are
/// serialized through the write gate so they never interleave.
#[derive(Clone)]
pub struct ChannelSender {
    io: Arc<AsyncFd<OwnedFd>>,
    write_gate: Arc<Mutex<()>>,
    closed: Arc<AtomicBool>,
}

impl ChannelSender {
    /// Send one message, with at most one descriptor riding along.
    pub async fn send(
        &self,
        value: &Value,
        handle: Option<std::os::fd::BorrowedFd<'_>>,
    ) -> Result<(), ClusterError> {
        if !self.is_connected() {
            return Err(ClusterError::ChannelClosed);
        }

        let body = serde_json::to_vec(value)?;
        if body.len() > MAX_FRAME_LEN {
            return Err(ClusterError::Protocol(format!(
                "frame of {} bytes exceeds the {} byte limit",
                body.len(),
                MAX_FRAME_LEN
            )));
        }

        let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
        frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
        frame.push(if handle.is_some() { FLAG_HANDLE } else { 0 });
        frame.extend_from_slice(&body);

        let _gate = self.write_gate.lock().await;

        // The descriptor is transferred with the first written byte; the
        // remainder of a short write goes out without ancillary data.
        let mut pending_fd = handle.map(|h| h.as_raw_fd());
        let mut sent = 0;
        while sent < frame.len() {
            let mut guard = self.io.writable().await.map_err(ClusterError::Io)?;
            let result = guard.try_io(|inner| {
                let iov = [IoSlice::new(&frame[sent..])];
                let written = match pending_fd {
                    Some(raw) => {
                        let fds = [raw];
                        sendmsg::<UnixAddr>(
                            inner.as_raw_fd(),
                            &iov,
                            &[ControlMessage::ScmRights(&fds)],
                            MsgFlags::empty(),
                            None,
                        )
                    }
                    None => {
                        sendmsg::<UnixAddr>(inner.as_raw_fd(), &iov, &[], MsgFlags::empty(), None)
                    }
                };
                written.map_err(io::Error::from)
            });
            match result {
                Ok(Ok(n)) => {
                    sent += n;
                    if n > 0 {
                        pending_fd = None;
                    }
                }
                Ok(Err(err)) if is_disconnect(&err) => {
                    self.closed.store(true, Ordering::SeqCst);
                    return Err(ClusterError::ChannelClosed);
                }
                Ok(Err(err)) => return Err(ClusterError::Io(err)),
                Err(_would_block) => continue,
            }
        }
        Ok(())
    }

    /// Close the channel. Shutting the socket down surfaces end-of-stream
    /// at both read loops, which drives the disconnect paths.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = shutdown(self.io.get_ref().as_raw_fd(), Shutdown::Both);
        }
    }

    pub fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }
}

fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset | io::ErrorKind::NotConnected
    )
}

// ---------------------------------------------------------------------------
// Receiver
// ---------------------------------------------------------------------------

/// Read half of the channel.
pub struct ChannelReceiver {
    io: Arc<AsyncFd<OwnedFd>>,
    buf: BytesMut,
    fds: VecDeque<OwnedFd>,
    eof: bool,
}

impl ChannelReceiver {
    /// Receive the next message. `Ok(None)` means the peer closed the
    /// channel.
    pub async fn recv(&mut self) -> Result<Option<(Value, Option<OwnedFd>)>, ClusterError> {
        loop {
            if let Some(message) = self.parse_frame()? {
                return Ok(Some(message));
            }
            if self.eof {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(ClusterError::Protocol(
                    "stream ended inside a frame".to_string(),
                ));
            }
            self.fill().await?;
        }
    }

    fn parse_frame(&mut self) -> Result<Option<(Value, Option<OwnedFd>)>, ClusterError> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let mut header = [0u8; 4];
        header.copy_from_slice(&self.buf[..4]);
        let len = u32::from_le_bytes(header) as usize;
        if len > MAX_FRAME_LEN {
            return Err(ClusterError::Protocol(format!(
                "frame of {} bytes exceeds the {} byte limit",
                len, MAX_FRAME_LEN
            )));
        }
        let flags = self.buf[4];
        if self.buf.len() < HEADER_LEN + len {
            return Ok(None);
        }

        self.buf.advance(HEADER_LEN);
        let body = self.buf.split_to(len);
        let value: Value = serde_json::from_slice(&body)?;

        let handle = if flags & FLAG_HANDLE != 0 {
            Some(self.fds.pop_front().ok_or_else(|| {
                ClusterError::Protocol("frame advertised a handle but none arrived".to_string())
            })?)
        } else {
            None
        };
        Ok(Some((value, handle)))
    }

    async fn fill(&mut self) -> Result<(), ClusterError> {
        loop {
            let mut guard = self.io.readable().await.map_err(ClusterError::Io)?;
            let mut chunk = [0u8; RECV_CHUNK];
            let result = guard.try_io(|inner| {
                let mut iov = [IoSliceMut::new(&mut chunk)];
                let mut cmsg_buf = cmsg_space!([RawFd; 8]);
                let msg = recvmsg::<UnixAddr>(
                    inner.as_raw_fd(),
                    &mut iov,
                    Some(&mut cmsg_buf),
                    MsgFlags::MSG_CMSG_CLOEXEC,
                )
                .map_err(io::Error::from)?;

                let mut received = Vec::new();
                if let Ok(cmsgs) = msg.cmsgs() {
                    for cmsg in cmsgs {
                        if let ControlMessageOwned::ScmRights(fds) = cmsg {
                            for fd in fds {
                                // recvmsg installed the descriptor in this
                                // process; take ownership of it here.
                                received.push(unsafe { OwnedFd::from_raw_fd(fd) });
                            }
                        }
                    }
                }
                Ok((msg.bytes, received))
            });
            match result {
                Ok(Ok((0, _))) => {
                    self.eof = true;
                    return Ok(());
                }
                Ok(Ok((n, received))) => {
                    self.buf.extend_from_slice(&chunk[..n]);
                    self.fds.extend(received);
                    return Ok(());
                }
                Ok(Err(err)) if is_disconnect(&err) => {
                    self.eof = true;
                    return Ok(());
                }
                Ok(Err(err)) => return Err(ClusterError::Io(err)),
                Err(_would_block) => continue,
            }
        }
    }
}
