//! Local address helpers

use std::net::{IpAddr, Ipv4Addr, UdpSocket};

/// LAN address of the default route, or loopback when there is none.
///
/// Connecting a UDP socket sends nothing; it only makes the OS pick the
/// outgoing interface.
pub fn local_ip() -> IpAddr {
    let probe = || -> std::io::Result<IpAddr> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect("8.8.8.8:80")?;
        Ok(socket.local_addr()?.ip())
    };

    match probe() {
        Ok(ip) if !ip.is_unspecified() => ip,
        Ok(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
        Err(e) => {
            tracing::debug!("No default route ({}), using loopback", e);
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_ip_is_usable() {
        let ip = local_ip();
        assert!(!ip.is_unspecified());
        assert!(ip.is_ipv4());
    }
}
