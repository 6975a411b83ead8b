use log::*;
use mio::net::UdpSocket;
use nix::libc;
use std::io;
use std::mem;
use std::net::{self, IpAddr, SocketAddr};
use std::os::unix::io::AsRawFd;

mod ioctl {
    use nix::ioctl_read_bad;
    use nix::libc;
    ioctl_read_bad!(ifmtu, libc::SIOCGIFMTU, libc::ifreq);
}

/// A non-blocking UDP endpoint. `send`/`recv` report a full buffer or an
/// empty socket as `Ok(None)` rather than an error, so callers can yield
/// back to the event loop without special-casing `WouldBlock`.
pub struct TftpSocket {
    inner: UdpSocket,
}

impl TftpSocket {
    /// Binds to the given address; port 0 asks the OS for an ephemeral
    /// port, which becomes this endpoint's transfer ID.
    pub fn bind(ip: IpAddr, port: u16) -> io::Result<TftpSocket> {
        let socket = net::UdpSocket::bind((ip, port))?;
        socket.set_nonblocking(true)?;
        Ok(TftpSocket {
            inner: UdpSocket::from_socket(socket)?,
        })
    }

    /// Pins the peer; the kernel then drops datagrams from any other
    /// source, enforcing the transfer-ID check for us.
    pub fn connect(&self, peer: SocketAddr) -> io::Result<()> {
        self.inner.connect(peer)
    }

    pub fn send(&self, buf: &[u8]) -> io::Result<Option<usize>> {
        would_block(self.inner.send(buf))
    }

    pub fn recv(&self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        would_block(self.inner.recv(buf))
    }

    pub fn send_to(&self, buf: &[u8], target: &SocketAddr) -> io::Result<Option<usize>> {
        would_block(self.inner.send_to(buf, target))
    }

    pub fn recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        would_block(self.inner.recv_from(buf))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// The handle to register with the event loop.
    pub fn evented(&self) -> &UdpSocket {
        &self.inner
    }

    /// MTU of the interface this socket is bound to, if it can be
    /// determined. Sockets bound to the wildcard address have no single
    /// interface, so they report `None`.
    pub fn interface_mtu(&self) -> Option<u32> {
        let local_ip = self.inner.local_addr().ok()?.ip();
        if local_ip.is_unspecified() {
            return None;
        }
        let name = interface_for(local_ip)?;

        let mut req: libc::ifreq = unsafe { mem::zeroed() };
        for (dst, src) in req
            .ifr_name
            .iter_mut()
            .take(libc::IFNAMSIZ - 1)
            .zip(name.as_bytes())
        {
            *dst = *src as libc::c_char;
        }
        match unsafe { ioctl::ifmtu(self.inner.as_raw_fd(), &mut req) } {
            Ok(_) => {
                let mtu = unsafe { req.ifr_ifru.ifru_mtu };
                debug!("interface {} has mtu {}", name, mtu);
                Some(mtu as u32)
            }
            Err(e) => {
                debug!("SIOCGIFMTU failed for {}: {}", name, e);
                None
            }
        }
    }
}

/// Finds the interface carrying the given local address.
fn interface_for(ip: IpAddr) -> Option<String> {
    let addrs = nix::ifaddrs::getifaddrs().ok()?;
    for ifaddr in addrs {
        if let Some(storage) = ifaddr.address {
            if let Some(sin) = storage.as_sockaddr_in() {
                if IpAddr::V4(sin.ip()) == ip {
                    return Some(ifaddr.interface_name);
                }
            }
        }
    }
    None
}

fn would_block<T>(res: io::Result<T>) -> io::Result<Option<T>> {
    match res {
        Ok(v) => Ok(Some(v)),
        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn empty_socket_recv_is_none() {
        let sock = TftpSocket::bind(IpAddr::V4(Ipv4Addr::LOCALHOST), 0).unwrap();
        let mut buf = [0; 16];
        assert!(sock.recv_from(&mut buf).unwrap().is_none());
    }

    #[test]
    fn loopback_datagram_round_trip() {
        let a = TftpSocket::bind(IpAddr::V4(Ipv4Addr::LOCALHOST), 0).unwrap();
        let b = TftpSocket::bind(IpAddr::V4(Ipv4Addr::LOCALHOST), 0).unwrap();
        let b_addr = b.local_addr().unwrap();
        a.connect(b_addr).unwrap();
        assert!(a.send(b"ping").unwrap().is_some());

        // non-blocking receive may need a moment for loopback delivery
        let mut buf = [0; 16];
        for _ in 0..50 {
            if let Some((amt, src)) = b.recv_from(&mut buf).unwrap() {
                assert_eq!(&buf[..amt], b"ping");
                assert_eq!(src, a.local_addr().unwrap());
                return;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        panic!("datagram never arrived");
    }

    #[test]
    fn loopback_reports_an_mtu() {
        let sock = TftpSocket::bind(IpAddr::V4(Ipv4Addr::LOCALHOST), 0).unwrap();
        // loopback mtu is large on Linux; only its presence matters here
        if let Some(mtu) = sock.interface_mtu() {
            assert!(mtu >= 576);
        }
    }
}
