//! TCP socket construction helpers.

use std::mem::ManuallyDrop;
use std::net::SocketAddr;

#[cfg(unix)]
use std::os::unix::io::{AsRawFd, FromRawFd};
#[cfg(windows)]
use std::os::windows::io::{AsRawSocket, FromRawSocket};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

pub fn new_tcp_listener(bind_address: SocketAddr, backlog: u32) -> std::io::Result<tokio::net::TcpListener> {
    let domain = if bind_address.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;

    socket.set_nonblocking(true)?;
    socket.set_reuse_address(true)?;

    socket.bind(&SockAddr::from(bind_address))?;
    socket.listen(backlog as i32)?;

    let std_listener: std::net::TcpListener = socket.into();
    tokio::net::TcpListener::from_std(std_listener)
}

pub fn new_tcp_socket(is_ipv6: bool) -> std::io::Result<tokio::net::TcpSocket> {
    if is_ipv6 {
        tokio::net::TcpSocket::new_v6()
    } else {
        tokio::net::TcpSocket::new_v4()
    }
}

pub fn set_tcp_keepalive(
    tcp_stream: &tokio::net::TcpStream,
    idle_time: std::time::Duration,
    send_interval: std::time::Duration,
) -> std::io::Result<()> {
    #[cfg(unix)]
    let socket = ManuallyDrop::new(unsafe { Socket::from_raw_fd(tcp_stream.as_raw_fd()) });
    #[cfg(windows)]
    let socket = ManuallyDrop::new(unsafe { Socket::from_raw_socket(tcp_stream.as_raw_socket()) });

    let keepalive = socket2::TcpKeepalive::new()
        .with_time(idle_time)
        .with_interval(send_interval);
    socket.set_keepalive(true)?;
    socket.set_tcp_keepalive(&keepalive)?;
    Ok(())
}
