use std::{
    io::{self, ErrorKind},
    net::TcpListener,
};

/// Picks a loopback TCP port for a daemon. A non-zero `preferred` port is
/// only checked for availability.
pub fn allocate_tcp_port(preferred: u16) -> io::Result<u16> {
    if preferred != 0 {
        return match TcpListener::bind(("127.0.0.1", preferred)) {
            Ok(_) => Ok(preferred),
            Err(e) if e.kind() == ErrorKind::AddrInUse => Err(io::Error::new(
                ErrorKind::AddrInUse,
                format!("port already in use: {preferred}"),
            )),
            Err(e) => Err(e),
        };
    }

    // Ask the OS for an ephemeral port.
    let listener = TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}
