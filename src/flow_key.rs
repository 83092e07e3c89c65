//! Canonical 5-tuple flow key and direction resolution.

use std::net::IpAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
        }
    }
}

/// An ordered, hashable 5-tuple. "src" is whichever side sent the packet
/// that first created the flow; the reverse tuple is a distinct key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: Protocol,
}

impl FlowKey {
    pub fn new(
        src_ip: IpAddr,
        dst_ip: IpAddr,
        src_port: u16,
        dst_port: u16,
        protocol: Protocol,
    ) -> Self {
        Self {
            src_ip,
            dst_ip,
            src_port,
            dst_port,
            protocol,
        }
    }

    /// The key of the same conversation observed from the other side.
    pub fn reverse(&self) -> Self {
        Self {
            src_ip: self.dst_ip,
            dst_ip: self.src_ip,
            src_port: self.dst_port,
            dst_port: self.src_port,
            protocol: self.protocol,
        }
    }

    pub fn is_dns_port(&self) -> bool {
        self.src_port == 53 || self.dst_port == 53
    }
}

/// Result of looking a packet's addressing up against the active-flow
/// table: which key it should be filed under, and which direction it
/// represents relative to that key's own forward/backward sense.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

/// Checks the forward key first, then the reverse key, then falls back to
/// creating a new flow under the forward key.
pub fn resolve<'a, F>(fwd_key: &FlowKey, bwd_key: &FlowKey, contains: F) -> (FlowKey, Direction)
where
    F: Fn(&FlowKey) -> bool,
{
    if contains(fwd_key) {
        (*fwd_key, Direction::Forward)
    } else if contains(bwd_key) {
        (*bwd_key, Direction::Backward)
    } else {
        (*fwd_key, Direction::Forward)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn key(a: u8, ap: u16, b: u8, bp: u16) -> FlowKey {
        FlowKey::new(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, a)),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, b)),
            ap,
            bp,
            Protocol::Udp,
        )
    }

    #[test]
    fn reverse_swaps_both_sides() {
        let k = key(1, 1000, 2, 53);
        let r = k.reverse();
        assert_eq!(r.src_ip, k.dst_ip);
        assert_eq!(r.dst_port, k.src_port);
    }

    #[test]
    fn forward_checked_before_backward() {
        let fwd = key(1, 1000, 2, 53);
        let bwd = fwd.reverse();
        // both "present" — forward must win per the tie-break rule.
        let (resolved, dir) = resolve(&fwd, &bwd, |_| true);
        assert_eq!(resolved, fwd);
        assert_eq!(dir, Direction::Forward);
    }

    #[test]
    fn falls_back_to_reverse_when_only_reverse_present() {
        let fwd = key(1, 1000, 2, 53);
        let bwd = fwd.reverse();
        let (resolved, dir) = resolve(&fwd, &bwd, |k| *k == bwd);
        assert_eq!(resolved, bwd);
        assert_eq!(dir, Direction::Backward);
    }

    #[test]
    fn new_flow_created_under_forward_key_when_neither_present() {
        let fwd = key(1, 1000, 2, 53);
        let bwd = fwd.reverse();
        let (resolved, dir) = resolve(&fwd, &bwd, |_| false);
        assert_eq!(resolved, fwd);
        assert_eq!(dir, Direction::Forward);
    }

    #[test]
    fn is_dns_port_detects_either_side() {
        assert!(key(1, 53, 2, 4000).is_dns_port());
        assert!(key(1, 4000, 2, 53).is_dns_port());
        assert!(!key(1, 4000, 2, 4001).is_dns_port());
    }
}
