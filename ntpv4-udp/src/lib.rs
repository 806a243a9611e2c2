//! UDP sockets that capture a kernel receive timestamp for every datagram.
//! The protocol wants to know when a packet hit the machine, not when the
//! process got around to reading it.

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;

use ntpv4_proto::{NtpTimestamp, JAN_1970};
use tokio::io::Interest;
use tracing::{debug, instrument};

pub struct UdpSocket {
    io: tokio::net::UdpSocket,
}

impl UdpSocket {
    /// A socket connected to a single remote, as used for client and
    /// symmetric associations.
    #[instrument(level = "debug", err)]
    pub async fn client(listen_addr: SocketAddr, peer_addr: SocketAddr) -> io::Result<UdpSocket> {
        let socket = tokio::net::UdpSocket::bind(listen_addr).await?;
        debug!(local = ?socket.local_addr(), peer = ?peer_addr, "client socket bound");
        socket.connect(peer_addr).await?;

        let socket = UdpSocket { io: socket };
        socket.enable_timestamps()?;
        Ok(socket)
    }

    /// An unconnected socket receiving from arbitrary remotes, as used by
    /// the server side.
    #[instrument(level = "debug", err)]
    pub async fn server(listen_addr: SocketAddr) -> io::Result<UdpSocket> {
        let socket = tokio::net::UdpSocket::bind(listen_addr).await?;
        debug!(local = ?socket.local_addr(), "server socket bound");

        let socket = UdpSocket { io: socket };
        socket.enable_timestamps()?;
        Ok(socket)
    }

    /// Ask the kernel to attach a capture timestamp to every received
    /// datagram
    fn enable_timestamps(&self) -> io::Result<()> {
        let enable: libc::c_int = 1;

        // Safety: the fd is valid for the lifetime of self and the option
        // value outlives the call
        let status = unsafe {
            libc::setsockopt(
                self.io.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_TIMESTAMP,
                &enable as *const _ as *const libc::c_void,
                std::mem::size_of_val(&enable) as libc::socklen_t,
            )
        };

        if status == -1 {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    }

    pub async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        self.io.send(buf).await
    }

    pub async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        self.io.send_to(buf, addr).await
    }

    /// Receive a datagram along with its source address and, when the
    /// kernel provides one, its capture timestamp.
    pub async fn recv_from(
        &self,
        buf: &mut [u8],
    ) -> io::Result<(usize, SocketAddr, Option<NtpTimestamp>)> {
        self.io
            .async_io(Interest::READABLE, || recv_with_timestamp(&self.io, buf))
            .await
    }

    /// Receive from a connected socket
    pub async fn recv(&self, buf: &mut [u8]) -> io::Result<(usize, Option<NtpTimestamp>)> {
        let (size, _, timestamp) = self.recv_from(buf).await?;
        Ok((size, timestamp))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.io.local_addr()
    }
}

impl AsRef<tokio::net::UdpSocket> for UdpSocket {
    fn as_ref(&self) -> &tokio::net::UdpSocket {
        &self.io
    }
}

impl std::fmt::Debug for UdpSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpSocket")
            .field("local_addr", &self.io.local_addr())
            .finish()
    }
}

/// The control buffer must be aligned like a cmsghdr; a plain byte array
/// makes no such promise.
#[repr(C, align(8))]
struct ControlBuffer([u8; 256]);

fn recv_with_timestamp(
    socket: &tokio::net::UdpSocket,
    buf: &mut [u8],
) -> io::Result<(usize, SocketAddr, Option<NtpTimestamp>)> {
    let mut addr_storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut control = ControlBuffer([0; 256]);

    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };

    // Safety: zeroed is a valid msghdr; all pointers set below outlive
    // the recvmsg call
    let mut mhdr: libc::msghdr = unsafe { std::mem::zeroed() };
    mhdr.msg_name = &mut addr_storage as *mut _ as *mut libc::c_void;
    mhdr.msg_namelen = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    mhdr.msg_iov = &mut iov;
    mhdr.msg_iovlen = 1;
    mhdr.msg_control = control.0.as_mut_ptr() as *mut libc::c_void;
    mhdr.msg_controllen = control.0.len();

    // Safety: the socket fd is valid and mhdr is fully initialized
    let received = unsafe { libc::recvmsg(socket.as_raw_fd(), &mut mhdr, 0) };
    if received == -1 {
        // includes WouldBlock, on which the async wrapper retries
        return Err(io::Error::last_os_error());
    }

    let addr = sockaddr_to_socketaddr(&addr_storage)?;

    // Walk the control messages for the capture timestamp.
    let mut timestamp = None;
    // Safety: mhdr was filled in by a successful recvmsg
    let mut cmsg = unsafe { libc::CMSG_FIRSTHDR(&mhdr) };
    while !cmsg.is_null() {
        // Safety: CMSG_FIRSTHDR/CMSG_NXTHDR only produce valid pointers
        // within the control buffer
        let header = unsafe { &*cmsg };
        if header.cmsg_level == libc::SOL_SOCKET && header.cmsg_type == libc::SCM_TIMESTAMP {
            // Safety: for SCM_TIMESTAMP the payload is a timeval; it may
            // not be aligned, hence the unaligned read
            let timeval = unsafe {
                std::ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const libc::timeval)
            };
            timestamp = Some(timeval_to_timestamp(timeval));
        }
        cmsg = unsafe { libc::CMSG_NXTHDR(&mhdr, cmsg) };
    }

    Ok((received as usize, addr, timestamp))
}

fn sockaddr_to_socketaddr(storage: &libc::sockaddr_storage) -> io::Result<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            // Safety: the kernel set ss_family to AF_INET, so the storage
            // holds a sockaddr_in
            let addr = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = std::net::Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
            Ok(SocketAddr::from((ip, u16::from_be(addr.sin_port))))
        }
        libc::AF_INET6 => {
            // Safety: as above, for AF_INET6 and sockaddr_in6
            let addr = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = std::net::Ipv6Addr::from(addr.sin6_addr.s6_addr);
            Ok(SocketAddr::from((ip, u16::from_be(addr.sin6_port))))
        }
        family => Err(io::Error::new(
            io::ErrorKind::Other,
            format!("unsupported address family {family}"),
        )),
    }
}

fn timeval_to_timestamp(timeval: libc::timeval) -> NtpTimestamp {
    let seconds = (timeval.tv_sec as u32).wrapping_add(JAN_1970);
    let nanos = (timeval.tv_usec as u32) * 1000;
    NtpTimestamp::from_seconds_nanos_since_ntp_era(seconds, nanos)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn client_server_roundtrip() {
        let server = UdpSocket::server("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let server_addr = server.local_addr().unwrap();

        let client = UdpSocket::client("127.0.0.1:0".parse().unwrap(), server_addr)
            .await
            .unwrap();
        let client_addr = client.local_addr().unwrap();

        client.send(&[1; 48]).await.unwrap();

        let mut buf = [0; 48];
        let (size, addr, timestamp) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(size, 48);
        assert_eq!(addr, client_addr);
        assert_eq!(buf, [1; 48]);

        // loopback still goes through the kernel, which stamps it
        let timestamp = timestamp.unwrap();
        assert!(timestamp > NtpTimestamp::from_fixed_int((JAN_1970 as u64) << 32));
    }

    #[tokio::test]
    async fn connected_recv_roundtrip() {
        let server = UdpSocket::server("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let server_addr = server.local_addr().unwrap();

        let client = UdpSocket::client("127.0.0.1:0".parse().unwrap(), server_addr)
            .await
            .unwrap();

        client.send(&[2; 48]).await.unwrap();

        let mut buf = [0; 48];
        let (size, source, _) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(size, 48);

        server.send_to(&[3; 48], source).await.unwrap();
        let (size, timestamp) = client.recv(&mut buf).await.unwrap();
        assert_eq!(size, 48);
        assert_eq!(buf, [3; 48]);
        assert!(timestamp.is_some());
    }
}
