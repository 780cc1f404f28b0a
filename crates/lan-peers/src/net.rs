use crate::model::InterfaceIp;
use if_addrs::IfAddr;
use std::io::Error;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

pub fn list_interface_ips_result() -> Result<Vec<InterfaceIp>, Error> {
    let ifs = if_addrs::get_if_addrs()?;

    let mut out: Vec<InterfaceIp> = ifs
        .into_iter()
        .map(|ifa| {
            let ip = ifa.ip();
            let broadcast = match &ifa.addr {
                IfAddr::V4(v4) => v4.broadcast.map(IpAddr::V4),
                IfAddr::V6(_) => None,
            };
            InterfaceIp {
                is_loopback: ifa.is_loopback(),
                name: ifa.name,
                ip,
                broadcast,
            }
        })
        .collect();

    out.sort_by(|a, b| (&a.name, &a.ip).cmp(&(&b.name, &b.ip)));
    out.dedup_by(|a, b| a.name == b.name && a.ip == b.ip);
    Ok(out)
}

/// Limited broadcast plus the directed broadcast address of every
/// non-loopback IPv4 interface.
pub fn broadcast_targets(port: u16) -> Vec<SocketAddr> {
    let mut out = vec![SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), port)];

    match list_interface_ips_result() {
        Ok(ips) => {
            for ifa in ips.iter().filter(|i| !i.is_loopback) {
                if let Some(b) = ifa.broadcast {
                    let target = SocketAddr::new(b, port);
                    if !out.contains(&target) {
                        out.push(target);
                    }
                }
            }
        }
        Err(e) => tracing::warn!("Could not enumerate interfaces: {}", e),
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limited_broadcast_is_always_targeted() {
        let targets = broadcast_targets(9940);
        assert_eq!(targets[0], SocketAddr::from(([255, 255, 255, 255], 9940)));
        assert!(targets.iter().all(|t| t.port() == 9940));
    }
}
