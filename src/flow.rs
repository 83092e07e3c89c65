//! Per-conversation state: counters, inter-arrival statistics, and the
//! optional DNS extractor, plus serialization to an output row.

use crate::dns::DnsExtractorState;
use crate::flow_key::{FlowKey, Protocol};
use crate::stats::OnlineStats;

#[derive(Debug, Clone, Default)]
struct DirectionCounters {
    packets: u64,
    bytes: u64,
    payload_bytes: u64,
    last_seen_ms: Option<i64>,
    iat: OnlineStats,
}

impl DirectionCounters {
    /// `globally_in_order` is the flow-wide out-of-order guard from
    /// out-of-order guard, which also suppresses directional IAT updates;
    /// a per-direction `timestamp_ms >= last_seen_ms` check is applied on
    /// top of it.
    fn record(&mut self, timestamp_ms: i64, wire_length: u64, payload_length: u64, globally_in_order: bool) {
        if globally_in_order && self.packets > 0 {
            if let Some(last) = self.last_seen_ms {
                if timestamp_ms >= last {
                    self.iat.add((timestamp_ms - last) as f64);
                }
            }
        }
        // last_seen_ms is assigned unconditionally, independent of the
        // directional IAT guard above.
        self.last_seen_ms = Some(timestamp_ms);
        self.payload_bytes += payload_length;
        self.bytes += wire_length;
        self.packets += 1;
    }
}

/// One bidirectional conversation. Owned exclusively by the active-flow
/// table while live; serialized rows are detached copies produced by
/// [`Flow::to_row`].
#[derive(Debug, Clone)]
pub struct Flow {
    key: FlowKey,
    start_time_ms: i64,
    last_packet_time_ms: i64,
    fwd: DirectionCounters,
    bwd: DirectionCounters,
    flow_iat: OnlineStats,
    flow_length: OnlineStats,
    total_packets: u64,
    dns: Option<DnsExtractorState>,
    label: Option<String>,
}

impl Flow {
    pub fn new(key: FlowKey, start_time_ms: i64, label: Option<String>) -> Self {
        let dns = if key.is_dns_port() {
            Some(DnsExtractorState::new())
        } else {
            None
        };
        Self {
            key,
            start_time_ms,
            last_packet_time_ms: start_time_ms,
            fwd: DirectionCounters::default(),
            bwd: DirectionCounters::default(),
            flow_iat: OnlineStats::new(),
            flow_length: OnlineStats::new(),
            total_packets: 0,
            dns,
            label,
        }
    }

    pub fn key(&self) -> &FlowKey {
        &self.key
    }

    pub fn last_packet_time_ms(&self) -> i64 {
        self.last_packet_time_ms
    }

    pub fn packet_count(&self) -> u64 {
        self.total_packets
    }

    /// `payload` is the transport-layer payload (used for DNS inspection);
    /// `wire_length` is the whole-packet length used for volumetric
    /// statistics.
    pub fn add_packet(
        &mut self,
        timestamp_ms: i64,
        wire_length: u64,
        payload: &[u8],
        is_forward: bool,
    ) {
        let in_order = timestamp_ms >= self.last_packet_time_ms || self.total_packets == 0;

        if in_order && self.total_packets > 0 {
            self.flow_iat
                .add((timestamp_ms - self.last_packet_time_ms) as f64);
        }
        self.flow_length.add(wire_length as f64);

        let payload_len = payload.len() as u64;
        if is_forward {
            self.fwd.record(timestamp_ms, wire_length, payload_len, in_order);
        } else {
            self.bwd.record(timestamp_ms, wire_length, payload_len, in_order);
        }

        if in_order {
            self.last_packet_time_ms = timestamp_ms;
        }
        self.total_packets += 1;

        if let Some(dns) = self.dns.as_mut() {
            dns.observe(payload, wire_length, timestamp_ms);
        }
    }

    fn duration_sec(&self) -> f64 {
        ((self.last_packet_time_ms - self.start_time_ms) as f64 / 1000.0).max(1.0)
    }

    fn total_bytes(&self) -> u64 {
        self.fwd.bytes + self.bwd.bytes
    }

    pub fn to_row(&self) -> FlowRow {
        let duration_ms = self.last_packet_time_ms - self.start_time_ms;
        let duration_sec = self.duration_sec();
        let total_bytes = self.total_bytes();
        let total_packets = self.fwd.packets + self.bwd.packets;

        let dns = self
            .dns
            .as_ref()
            .map(|d| d.derived(duration_sec, total_bytes))
            .unwrap_or_default();

        FlowRow {
            src_ip: self.key.src_ip.to_string(),
            dst_ip: self.key.dst_ip.to_string(),
            src_port: self.key.src_port,
            dst_port: self.key.dst_port,
            protocol: self.key.protocol,
            dns,
            flow_bytes_per_sec: total_bytes as f64 / duration_sec,
            flow_packets_per_sec: total_packets as f64 / duration_sec,
            fwd_packets_per_sec: self.fwd.packets as f64 / duration_sec,
            bwd_packets_per_sec: self.bwd.packets as f64 / duration_sec,
            flow_duration_ms: duration_ms.max(0),
            total_fwd_packets: self.fwd.packets,
            total_bwd_packets: self.bwd.packets,
            total_fwd_bytes: self.fwd.bytes,
            total_bwd_bytes: self.bwd.bytes,
            flow_iat_mean: self.flow_iat.mean(),
            flow_iat_std: self.flow_iat.stdev(),
            flow_iat_min: self.flow_iat.min(),
            flow_iat_max: self.flow_iat.max(),
            fwd_iat_mean: self.fwd.iat.mean(),
            bwd_iat_mean: self.bwd.iat.mean(),
            fwd_packet_length_mean: self.fwd.payload_bytes_mean(self.fwd.packets),
            bwd_packet_length_mean: self.bwd.payload_bytes_mean(self.bwd.packets),
            packet_size_std: self.flow_length.stdev(),
            flow_length_min: self.flow_length.min(),
            flow_length_max: self.flow_length.max(),
            average_packet_size: self.flow_length.mean(),
            label: self.label.clone(),
        }
    }
}

impl DirectionCounters {
    fn payload_bytes_mean(&self, packets: u64) -> f64 {
        if packets == 0 {
            0.0
        } else {
            self.payload_bytes as f64 / packets as f64
        }
    }
}

/// A detached, serializable snapshot of a flow, matching the output
/// schema's fixed column order.
#[derive(Debug, Clone)]
pub struct FlowRow {
    pub src_ip: String,
    pub dst_ip: String,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: Protocol,
    pub dns: crate::dns::DnsDerived,
    pub flow_bytes_per_sec: f64,
    pub flow_packets_per_sec: f64,
    pub fwd_packets_per_sec: f64,
    pub bwd_packets_per_sec: f64,
    pub flow_duration_ms: i64,
    pub total_fwd_packets: u64,
    pub total_bwd_packets: u64,
    pub total_fwd_bytes: u64,
    pub total_bwd_bytes: u64,
    pub flow_iat_mean: f64,
    pub flow_iat_std: f64,
    pub flow_iat_min: f64,
    pub flow_iat_max: f64,
    pub fwd_iat_mean: f64,
    pub bwd_iat_mean: f64,
    pub fwd_packet_length_mean: f64,
    pub bwd_packet_length_mean: f64,
    pub packet_size_std: f64,
    pub flow_length_min: f64,
    pub flow_length_max: f64,
    pub average_packet_size: f64,
    pub label: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::net::IpAddr;

    fn udp_dns_key() -> FlowKey {
        FlowKey::new(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
            40000,
            53,
            Protocol::Udp,
        )
    }

    #[test]
    fn single_query_response_matches_scenario_s1() {
        let mut flow = Flow::new(udp_dns_key(), 1000, None);
        let mut q = vec![0xAB, 0xCD, 0x01, 0x00, 0, 1, 0, 0, 0, 0, 0, 0];
        q.extend_from_slice(b"\x07example\x03com\x00");
        q.extend_from_slice(&1u16.to_be_bytes());
        q.extend_from_slice(&1u16.to_be_bytes());
        flow.add_packet(1000, 60, &q, true);

        let mut r = vec![0xAB, 0xCD, 0x81, 0x80, 0, 1, 0, 1, 0, 0, 0, 0];
        r.extend_from_slice(b"\x07example\x03com\x00");
        r.extend_from_slice(&1u16.to_be_bytes());
        r.extend_from_slice(&1u16.to_be_bytes());
        r.extend_from_slice(&0xC00Cu16.to_be_bytes());
        r.extend_from_slice(&1u16.to_be_bytes());
        r.extend_from_slice(&1u16.to_be_bytes());
        r.extend_from_slice(&60u32.to_be_bytes());
        r.extend_from_slice(&4u16.to_be_bytes());
        r.extend_from_slice(&[1, 2, 3, 4]);
        flow.add_packet(1060, 300, &r, false);

        let row = flow.to_row();
        assert_eq!(row.total_fwd_packets, 1);
        assert_eq!(row.total_bwd_packets, 1);
        assert_eq!(row.dns.dns_total_queries, 1);
        assert_eq!(row.dns.dns_total_responses, 1);
        assert_eq!(row.dns.query_response_ratio, 1.0);
        assert_eq!(row.dns.dns_amplification_factor, 5.0);
        assert_eq!(row.flow_iat_mean, 60.0);
        assert_eq!(row.flow_duration_ms, 60);
        assert!((row.packet_size_std - 120.0).abs() < 1e-9);
        assert_eq!(row.average_packet_size, 180.0);
    }

    #[test]
    fn out_of_order_packet_skips_iat_only() {
        let mut flow = Flow::new(udp_dns_key(), 1000, None);
        flow.add_packet(1000, 100, &[], true);
        flow.add_packet(1100, 100, &[], true);
        flow.add_packet(1050, 100, &[], true);
        let row = flow.to_row();
        assert_eq!(row.flow_duration_ms, 100);
        assert_eq!(row.total_fwd_packets, 3);
        // two in-order gaps feed flow_iat: 1000->1100 (100ms); the 1050
        // packet is out of order relative to last_packet_time (1100) and
        // must not contribute another sample.
        assert_eq!(row.flow_iat_mean, 100.0);
    }

    #[test]
    fn single_packet_flow_has_zero_duration_and_iat() {
        let mut flow = Flow::new(udp_dns_key(), 5000, None);
        flow.add_packet(5000, 64, &[], true);
        let row = flow.to_row();
        assert_eq!(row.flow_duration_ms, 0);
        assert_eq!(row.flow_iat_mean, 0.0);
        assert_eq!(row.dns.queries_per_second, 0.0);
    }

    #[test]
    fn length_bounds_hold_average_between_min_and_max() {
        let mut flow = Flow::new(udp_dns_key(), 0, None);
        flow.add_packet(0, 40, &[], true);
        flow.add_packet(10, 200, &[], false);
        let row = flow.to_row();
        assert!(row.flow_length_min <= row.average_packet_size);
        assert!(row.average_packet_size <= row.flow_length_max);
    }
}
