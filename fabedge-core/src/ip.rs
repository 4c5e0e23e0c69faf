use std::net::IpAddr;

use ipnet::IpNet;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IpError {
    #[error("Invalid CIDR '{}'!", .0)]
    InvalidCidr(String),
}

/// Parses a list of CIDR strings, failing on the first invalid entry.
pub fn parse_subnets<S: AsRef<str>>(subnets: &[S]) -> Result<Vec<IpNet>, IpError> {
    subnets
        .iter()
        .map(|subnet| {
            subnet
                .as_ref()
                .parse()
                .map_err(|_| IpError::InvalidCidr(subnet.as_ref().to_owned()))
        })
        .collect()
}

/// Whether two networks share any address.
pub fn nets_overlap(a: &IpNet, b: &IpNet) -> bool {
    a.contains(&b.network()) || b.contains(&a.network())
}

/// The host CIDR of an address (/32 for IPv4, /128 for IPv6).
pub fn host_cidr(addr: IpAddr) -> IpNet {
    match addr {
        IpAddr::V4(_) => IpNet::new(addr, 32).unwrap(),
        IpAddr::V6(_) => IpNet::new(addr, 128).unwrap(),
    }
}
