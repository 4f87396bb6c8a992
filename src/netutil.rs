use std::net::{IpAddr, Ipv4Addr, UdpSocket};

use anyhow::{Context, Result};

/// Any routable address works; no packet is sent on a connected UDP socket.
const PROBE_ADDR: &str = "8.8.8.8:80";

/// Returns the address of the interface used for outbound traffic.
pub fn local_ip() -> Result<IpAddr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).context("binding probe socket")?;
    socket
        .connect(PROBE_ADDR)
        .context("resolving outbound interface")?;
    let addr = socket.local_addr().context("reading probe socket address")?;

    Ok(addr.ip())
}

/// Like [`local_ip`], falling back to loopback when there is no route.
pub fn local_ip_or_loopback() -> IpAddr {
    local_ip().unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}
