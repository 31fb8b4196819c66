//! vsock listener and stream on top of `socket2` and `AsyncFd`.

use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use socket2::{Domain, SockAddr, Socket, Type};
use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::net::listener::LISTEN_BACKLOG;

/// A listening vsock socket.
#[derive(Debug)]
pub struct VsockListener {
    inner: AsyncFd<Socket>,
    cid: u32,
    port: u32,
}

impl VsockListener {
    /// Bind and listen on `(cid, port)`. Must be called inside a runtime.
    pub fn bind(cid: u32, port: u32) -> io::Result<Self> {
        let socket = Socket::new(Domain::VSOCK, Type::STREAM, None)?;
        socket.set_nonblocking(true)?;
        socket.bind(&SockAddr::vsock(cid, port))?;
        socket.listen(LISTEN_BACKLOG)?;
        let (cid, port) = socket
            .local_addr()
            .ok()
            .and_then(|addr| addr.as_vsock_address())
            .unwrap_or((cid, port));
        Ok(Self {
            inner: AsyncFd::new(socket)?,
            cid,
            port,
        })
    }

    pub fn local_address(&self) -> (u32, u32) {
        (self.cid, self.port)
    }

    pub fn poll_accept(&self, cx: &mut Context<'_>) -> Poll<io::Result<(VsockStream, (u32, u32))>> {
        loop {
            let mut guard = ready!(self.inner.poll_read_ready(cx))?;
            match guard.try_io(|inner| inner.get_ref().accept()) {
                Ok(Ok((socket, addr))) => {
                    socket.set_nonblocking(true)?;
                    let peer = addr.as_vsock_address().unwrap_or((0, 0));
                    return Poll::Ready(Ok((VsockStream::new(socket)?, peer)));
                }
                Ok(Err(e)) => return Poll::Ready(Err(e)),
                Err(_would_block) => continue,
            }
        }
    }
}

/// A connected vsock stream.
#[derive(Debug)]
pub struct VsockStream {
    inner: AsyncFd<Socket>,
}

impl VsockStream {
    fn new(socket: Socket) -> io::Result<Self> {
        Ok(Self {
            inner: AsyncFd::new(socket)?,
        })
    }
}

impl AsyncRead for VsockStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            let mut guard = ready!(this.inner.poll_read_ready(cx))?;
            let unfilled = buf.initialize_unfilled();
            match guard.try_io(|inner| {
                let mut socket = inner.get_ref();
                socket.read(unfilled)
            }) {
                Ok(Ok(n)) => {
                    buf.advance(n);
                    return Poll::Ready(Ok(()));
                }
                Ok(Err(e)) => return Poll::Ready(Err(e)),
                Err(_would_block) => continue,
            }
        }
    }
}

impl AsyncWrite for VsockStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        loop {
            let mut guard = ready!(this.inner.poll_write_ready(cx))?;
            match guard.try_io(|inner| {
                let mut socket = inner.get_ref();
                socket.write(buf)
            }) {
                Ok(result) => return Poll::Ready(result),
                Err(_would_block) => continue,
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(self.inner.get_ref().shutdown(Shutdown::Write))
    }
}
