use crate::WsError;
use std::io;
use std::net::{Ipv4Addr, TcpListener};

/// Bind an IPv4 listen socket on `host:port` with `SO_REUSEADDR`, so a
/// restarted server can rebind while old connections sit in TIME_WAIT.
///
/// Accepted connections should have `TCP_NODELAY` enabled by the caller
/// before the handshake; frame writes are latency sensitive.
pub fn listen(host: &str, port: u16) -> Result<TcpListener, WsError> {
    let ip: Ipv4Addr = host
        .parse()
        .map_err(|_| WsError::InvalidAddress(host.to_string()))?;
    Ok(bind_listener(ip, port)?)
}

#[cfg(unix)]
fn bind_listener(ip: Ipv4Addr, port: u16) -> io::Result<TcpListener> {
    use std::os::fd::FromRawFd;

    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM, libc::IPPROTO_TCP);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let close_on_error = |fd: libc::c_int| {
            let err = io::Error::last_os_error();
            libc::close(fd);
            err
        };

        let opt: libc::c_int = 1;
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            std::ptr::addr_of!(opt).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        ) != 0
        {
            return Err(close_on_error(fd));
        }

        let mut addr: libc::sockaddr_in = std::mem::zeroed();
        addr.sin_family = libc::AF_INET as libc::sa_family_t;
        addr.sin_port = port.to_be();
        addr.sin_addr.s_addr = u32::from(ip).to_be();

        if libc::bind(
            fd,
            std::ptr::addr_of!(addr).cast(),
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        ) != 0
        {
            return Err(close_on_error(fd));
        }
        if libc::listen(fd, libc::SOMAXCONN) != 0 {
            return Err(close_on_error(fd));
        }

        Ok(TcpListener::from_raw_fd(fd))
    }
}

#[cfg(not(unix))]
fn bind_listener(ip: Ipv4Addr, port: u16) -> io::Result<TcpListener> {
    TcpListener::bind(std::net::SocketAddrV4::new(ip, port))
}
