//! Socket helpers: name resolution, optional fixed client ports, Nagle.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpStream, ToSocketAddrs, UdpSocket};

use net2::{TcpBuilder, UdpBuilder};

use crate::config::ServerAddr;
use crate::error::{Error, Result};

pub fn resolve(saddr: &ServerAddr) -> Result<SocketAddr> {
    let ctx = || format!("resolve {}", saddr);
    let mut addrs = (saddr.host.as_str(), saddr.port)
        .to_socket_addrs()
        .map_err(|e| Error::io(ctx(), e))?;
    addrs
        .next()
        .ok_or_else(|| Error::config(format!("{} has no address", saddr)))
}

/// `base_port + work_id`, or 0 (ephemeral) when no base port is set.
fn client_port(base_port: u16, work_id: usize) -> Result<u16> {
    if base_port == 0 {
        return Ok(0);
    }
    u16::try_from(base_port as usize + work_id)
        .map_err(|_| Error::config(format!("client port {} + {} overflows", base_port, work_id)))
}

fn unspecified(peer: &SocketAddr, port: u16) -> SocketAddr {
    match peer {
        SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
        SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port),
    }
}

/// Connects (blocking), then switches the stream to non-blocking.
pub fn open_stream_sock(
    work_id: usize,
    saddr: &ServerAddr,
    base_port: u16,
    nagles: bool,
) -> Result<TcpStream> {
    let peer = resolve(saddr)?;
    let ctx = |what: &str| format!("open_stream_sock {}: {}", saddr, what);

    let builder = match peer {
        SocketAddr::V4(_) => TcpBuilder::new_v4(),
        SocketAddr::V6(_) => TcpBuilder::new_v6(),
    }
    .map_err(|e| Error::io(ctx("can't create sock"), e))?;
    builder
        .reuse_address(true)
        .map_err(|e| Error::io(ctx("SO_REUSEADDR"), e))?;

    let port = client_port(base_port, work_id)?;
    if port != 0 {
        builder
            .bind(unspecified(&peer, port))
            .map_err(|e| Error::io(ctx("can't bind"), e))?;
    }

    let stream = builder
        .connect(peer)
        .map_err(|e| Error::io(ctx("can't connect"), e))?;
    if !nagles {
        stream
            .set_nodelay(true)
            .map_err(|e| Error::io(ctx("can't turn off nagles"), e))?;
    }
    stream
        .set_nonblocking(true)
        .map_err(|e| Error::io(ctx("set_nonblocking"), e))?;
    Ok(stream)
}

/// Binds (fixed or ephemeral port) and connects a non-blocking UDP socket.
pub fn open_udp_sock(work_id: usize, saddr: &ServerAddr, base_port: u16) -> Result<UdpSocket> {
    let peer = resolve(saddr)?;
    let ctx = |what: &str| format!("open_udp_sock {}: {}", saddr, what);

    let builder = match peer {
        SocketAddr::V4(_) => UdpBuilder::new_v4(),
        SocketAddr::V6(_) => UdpBuilder::new_v6(),
    }
    .map_err(|e| Error::io(ctx("can't create socket"), e))?;
    builder
        .reuse_address(true)
        .map_err(|e| Error::io(ctx("SO_REUSEADDR"), e))?;

    let port = client_port(base_port, work_id)?;
    let sock = builder
        .bind(unspecified(&peer, port))
        .map_err(|e| Error::io(ctx("can't bind"), e))?;
    sock.connect(peer)
        .map_err(|e| Error::io(ctx("can't connect"), e))?;
    sock.set_nonblocking(true)
        .map_err(|e| Error::io(ctx("set_nonblocking"), e))?;
    Ok(sock)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn local(port: u16) -> ServerAddr {
        ServerAddr {
            host: "127.0.0.1".to_string(),
            port,
        }
    }

    #[test]
    fn client_ports() {
        assert_eq!(client_port(0, 7).unwrap(), 0);
        assert_eq!(client_port(40000, 7).unwrap(), 40007);
        assert!(client_port(65530, 10).is_err());
    }

    #[test]
    fn connects_tcp_non_blocking() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let stream = open_stream_sock(0, &local(port), 0, false).unwrap();
        assert!(stream.nodelay().unwrap());
        let (_server, client) = listener.accept().unwrap();
        assert_eq!(client, stream.local_addr().unwrap());

        let mut buf = [0u8; 8];
        let err = std::io::Read::read(&mut &stream, &mut buf).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::WouldBlock);
    }

    #[test]
    fn connects_udp() {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = server.local_addr().unwrap().port();
        let sock = open_udp_sock(3, &local(port), 0).unwrap();
        sock.send(b"ping").unwrap();
        let mut buf = [0u8; 8];
        let (n, from) = server.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping");
        assert_eq!(from.port(), sock.local_addr().unwrap().port());
    }

    #[test]
    fn unresolvable_host_fails() {
        let saddr = ServerAddr {
            host: "no such host".to_string(),
            port: 1,
        };
        assert!(resolve(&saddr).is_err());
    }
}
