//! Unix socket transport with `SCM_RIGHTS` descriptor passing.
//!
//! Each message is one `SOCK_SEQPACKET` record holding a JSON frame, with at
//! most one descriptor attached as ancillary data. Sequenced packets keep
//! record boundaries (so a descriptor is always paired with the right
//! message) and report end-of-file when the peer exits, which is how the
//! primary notices a dead worker.
//!
//! Linux only: relies on `MSG_CMSG_CLOEXEC` and `MSG_NOSIGNAL`.

use std::io::{self, IoSlice, IoSliceMut};
use std::marker::PhantomData;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use async_trait::async_trait;
use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::sys::socket::{
    recvmsg, sendmsg, socketpair, AddressFamily, ControlMessage, ControlMessageOwned, MsgFlags,
    SockFlag, SockType,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::message::{decode, encode, PrimaryMessage, WorkerMessage};
use crate::{Delivery, Endpoint, IpcError, Link, MAX_FRAME_BYTES};

/// Environment variable carrying an inherited channel descriptor.
pub const CHANNEL_FD_ENV: &str = "PORTSHARE_CHANNEL_FD";

/// Room for stray descriptors so they are received (and closed) rather
/// than truncated.
const MAX_FDS_PER_FRAME: usize = 4;

/// A non-blocking sequenced-packet socket registered with the runtime.
struct SeqPacket {
    fd: AsyncFd<OwnedFd>,
}

impl SeqPacket {
    fn new(fd: OwnedFd) -> io::Result<Self> {
        set_nonblocking(&fd)?;
        Ok(Self {
            fd: AsyncFd::new(fd)?,
        })
    }

    async fn send_frame(&self, frame: &[u8], handle: Option<&OwnedFd>) -> io::Result<()> {
        let fds: Vec<RawFd> = handle.map(AsRawFd::as_raw_fd).into_iter().collect();

        loop {
            let mut guard = self.fd.writable().await?;
            let result = guard.try_io(|inner| {
                let iov = [IoSlice::new(frame)];
                let cmsgs: Vec<ControlMessage<'_>> = if fds.is_empty() {
                    Vec::new()
                } else {
                    vec![ControlMessage::ScmRights(&fds)]
                };
                sendmsg::<()>(
                    inner.get_ref().as_raw_fd(),
                    &iov,
                    &cmsgs,
                    MsgFlags::MSG_NOSIGNAL,
                    None,
                )
                .map_err(io::Error::from)
            });

            match result {
                Ok(sent) => return sent.map(|_| ()),
                Err(_would_block) => continue,
            }
        }
    }

    async fn recv_frame(&self, buf: &mut [u8]) -> io::Result<(usize, Vec<OwnedFd>)> {
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|inner| recv_once(inner.get_ref().as_raw_fd(), &mut *buf)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }
}

fn recv_once(raw: RawFd, buf: &mut [u8]) -> io::Result<(usize, Vec<OwnedFd>)> {
    let mut cmsg_space = nix::cmsg_space!([RawFd; MAX_FDS_PER_FRAME]);
    let mut iov = [IoSliceMut::new(buf)];
    let msg = recvmsg::<()>(
        raw,
        &mut iov,
        Some(&mut cmsg_space),
        MsgFlags::MSG_CMSG_CLOEXEC,
    )
    .map_err(io::Error::from)?;

    let mut handles = Vec::new();
    for cmsg in msg.cmsgs().map_err(io::Error::from)? {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            for fd in fds {
                // SAFETY: the kernel just installed this descriptor in our
                // table for us; nothing else refers to it.
                handles.push(unsafe { OwnedFd::from_raw_fd(fd) });
            }
        }
    }

    if msg.flags.contains(MsgFlags::MSG_TRUNC) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "frame exceeds receive buffer",
        ));
    }

    Ok((msg.bytes, handles))
}

fn set_nonblocking(fd: &OwnedFd) -> io::Result<()> {
    let raw = fd.as_raw_fd();
    let flags = OFlag::from_bits_truncate(fcntl(raw, FcntlArg::F_GETFL)?);
    fcntl(raw, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}

/// Outbound half over a shared socket.
struct UnixLink<M> {
    socket: Arc<SeqPacket>,
    _marker: PhantomData<fn(M)>,
}

#[async_trait]
impl<M> Link<M> for UnixLink<M>
where
    M: Serialize + Send + 'static,
{
    async fn send(&self, message: M, handle: Option<OwnedFd>) -> Result<(), IpcError> {
        let frame = encode(&message)?;
        self.socket
            .send_frame(&frame, handle.as_ref())
            .await
            .map_err(|e| match e.kind() {
                io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset => IpcError::Closed,
                _ => IpcError::Io(e),
            })?;
        // The peer now holds its own copy; ours closes here.
        drop(handle);
        Ok(())
    }
}

fn spawn_reader<In>(socket: Arc<SeqPacket>, tx: mpsc::UnboundedSender<Delivery<In>>)
where
    In: DeserializeOwned + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_FRAME_BYTES];
        loop {
            let received = tokio::select! {
                received = socket.recv_frame(&mut buf) => received,
                _ = tx.closed() => break,
            };
            let (len, mut handles) = match received {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(error = %e, "channel read failed");
                    break;
                }
            };

            if len == 0 && handles.is_empty() {
                debug!("peer closed channel");
                break;
            }

            if handles.len() > 1 {
                warn!(
                    error = %IpcError::UnexpectedDescriptors(handles.len()),
                    "dropping frame"
                );
                continue;
            }

            let message = match decode::<In>(&buf[..len]) {
                Ok(message) => message,
                Err(e) => {
                    warn!(error = %e, "dropping undecodable frame");
                    continue;
                }
            };

            let delivery = Delivery {
                message,
                handle: handles.pop(),
            };
            if tx.send(delivery).is_err() {
                break;
            }
        }
    });
}

/// Create a connected, close-on-exec `SOCK_SEQPACKET` socket pair.
pub fn socketpair_seqpacket() -> Result<(OwnedFd, OwnedFd), IpcError> {
    Ok(socketpair(
        AddressFamily::Unix,
        SockType::SeqPacket,
        None,
        SockFlag::SOCK_CLOEXEC,
    )?)
}

/// Wrap one end of a socket pair as an endpoint.
///
/// Must be called from within a tokio runtime; spawns the reader task.
pub fn endpoint<Out, In>(fd: OwnedFd) -> Result<Endpoint<Out, In>, IpcError>
where
    Out: Serialize + Send + 'static,
    In: DeserializeOwned + Send + 'static,
{
    let socket = Arc::new(SeqPacket::new(fd)?);
    let (tx, inbound) = mpsc::unbounded_channel();
    spawn_reader(Arc::clone(&socket), tx);

    Ok(Endpoint {
        link: Arc::new(UnixLink {
            socket,
            _marker: PhantomData,
        }),
        inbound,
    })
}

/// Create a connected pair of endpoints in this process:
/// `(primary side, worker side)`.
pub fn pair() -> Result<
    (
        Endpoint<PrimaryMessage, WorkerMessage>,
        Endpoint<WorkerMessage, PrimaryMessage>,
    ),
    IpcError,
> {
    let (primary, worker) = socketpair_seqpacket()?;
    Ok((endpoint(primary)?, endpoint(worker)?))
}

/// Clear close-on-exec so a spawned child inherits this descriptor.
pub fn make_inheritable(fd: &OwnedFd) -> Result<(), IpcError> {
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::empty()))?;
    Ok(())
}

/// Take ownership of a channel descriptor passed in [`CHANNEL_FD_ENV`].
///
/// Returns `Ok(None)` when the variable is not set.
pub fn inherited_from_env() -> Result<Option<OwnedFd>, IpcError> {
    let Ok(value) = std::env::var(CHANNEL_FD_ENV) else {
        return Ok(None);
    };

    let raw: RawFd = value.trim().parse().map_err(|_| {
        IpcError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} is not a descriptor number: {}", CHANNEL_FD_ENV, value),
        ))
    })?;

    // Validate before taking ownership.
    fcntl(raw, FcntlArg::F_GETFD)?;

    // SAFETY: the parent left this descriptor open for us and passed its
    // number in the environment; nothing else in this process owns it.
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
    Ok(Some(fd))
}
