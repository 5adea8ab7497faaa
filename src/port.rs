//! Ephemeral port allocation for new backends

use std::net::{Ipv4Addr, TcpListener};

/// Ask the OS for a free TCP port.
///
/// The probe socket is closed before returning, so the port is only reserved
/// until someone else binds it. Spawn the consumer right away.
pub fn allocate_free_port() -> std::io::Result<u16> {
    let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}
