use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};

use tracing::{debug, info};

use crate::error::{Result, TransportError};
use crate::stream::LinkStream;

/// TCP listener accepting robot links.
///
/// The listener can run blocking (`accept`) or be polled without blocking
/// (`try_accept`) from a multiplexer loop.
pub struct LinkListener {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl LinkListener {
    /// Bind and listen on a TCP address (e.g. `"0.0.0.0:5760"`).
    ///
    /// Port `0` picks an ephemeral port; query it with [`LinkListener::local_addr`].
    pub fn bind(addr: impl ToSocketAddrs + std::fmt::Debug) -> Result<Self> {
        let label = format!("{addr:?}");
        let listener = TcpListener::bind(&addr).map_err(|e| TransportError::Bind {
            addr: label.clone(),
            source: e,
        })?;
        let local_addr = listener.local_addr().map_err(|e| TransportError::Bind {
            addr: label,
            source: e,
        })?;

        info!(%local_addr, "listening for robot links");

        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Accept an incoming connection (blocking).
    pub fn accept(&self) -> Result<(LinkStream, SocketAddr)> {
        let (stream, addr) = self.listener.accept().map_err(TransportError::Accept)?;
        // Accepted sockets inherit non-blocking mode on some platforms.
        stream.set_nonblocking(false)?;
        debug!(%addr, "accepted link");
        Ok((LinkStream::from_tcp(stream), addr))
    }

    /// Accept an incoming connection if one is pending, without blocking.
    ///
    /// The listener is switched to non-blocking mode on first use.
    pub fn try_accept(&self) -> Result<Option<(LinkStream, SocketAddr)>> {
        self.listener.set_nonblocking(true)?;
        match self.listener.accept() {
            Ok((stream, addr)) => {
                stream.set_nonblocking(false)?;
                debug!(%addr, "accepted link");
                Ok(Some((LinkStream::from_tcp(stream), addr)))
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(err) if err.kind() == ErrorKind::Interrupted => Ok(None),
            Err(err) => Err(TransportError::Accept(err)),
        }
    }

    /// Connect to a listening host (blocking).
    pub fn connect(addr: impl ToSocketAddrs + std::fmt::Debug) -> Result<LinkStream> {
        let label = format!("{addr:?}");
        let stream = TcpStream::connect(&addr).map_err(|e| TransportError::Connect {
            addr: label.clone(),
            source: e,
        })?;
        debug!(addr = %label, "connected to host");
        Ok(LinkStream::from_tcp(stream))
    }

    /// The address this listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl std::fmt::Debug for LinkListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkListener")
            .field("local_addr", &self.local_addr)
            .finish()
    }
}
