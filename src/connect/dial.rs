//! Loopback TCP dialer.

use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::time::Duration;

use super::ConnectError;

/// Hard per-socket connect budget.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// An open, non-self-connected stream to a daemon. Exclusively owns the
/// socket.
#[derive(Debug)]
pub struct DaemonConnection {
    stream: TcpStream,
    peer: SocketAddr,
}

impl DaemonConnection {
    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn into_stream(self) -> TcpStream {
        self.stream
    }
}

/// Open a loopback connection to `port`.
///
/// Some OSes hand out a self-connect when no listener is bound and the
/// ephemeral local port happens to equal the target; that is detected and
/// reported as a failure, closing the socket.
pub fn dial(port: u16) -> Result<DaemonConnection, ConnectError> {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    tracing::debug!(%addr, "trying to connect");
    let io = |source| ConnectError::Dial { addr, source };

    let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT).map_err(io)?;
    let local = stream.local_addr().map_err(io)?;
    let peer = stream.peer_addr().map_err(io)?;
    if local == peer {
        return Err(ConnectError::SelfConnect { addr });
    }
    let _ = stream.set_nodelay(true);

    tracing::debug!(%peer, "connected");
    Ok(DaemonConnection { stream, peer })
}
