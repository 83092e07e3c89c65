//! DNS deep packet inspection for flows carrying a port-53 endpoint.
//!
//! Parsing is defensive by construction: [`parse`] never mutates anything
//! and returns `None` on any structural problem, so a malformed message
//! can never leave the extractor's counters in a half-updated state.
//! Any structural error aborts processing of that packet only, with no
//! state mutation.

use std::collections::HashMap;

use crate::stats::OnlineStats;

const ANY_QTYPE: u16 = 255;
const TXT_QTYPE: u16 = 16;
const OPT_RRTYPE: u16 = 41;
const PENDING_TABLE_CAP: usize = 10_000;
const PENDING_TABLE_MAX_AGE_MS: i64 = 5_000;

#[derive(Debug, Clone, Copy)]
struct Question {
    qtype: u16,
}

#[derive(Debug, Clone, Copy)]
struct Edns {
    udp_payload_size: u16,
}

#[derive(Debug, Clone)]
struct ParsedMessage {
    qr: bool,
    opcode: u8,
    tx_id: u16,
    qdcount: u16,
    ancount: u16,
    questions: Vec<Question>,
    edns: Option<Edns>,
}

fn be_u16(buf: &[u8], offset: usize) -> Option<u16> {
    buf.get(offset..offset + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
}

/// Advances past a (possibly compressed) domain name starting at `offset`,
/// returning the offset just past it. Does not resolve pointers — it only
/// needs to skip the name, never read it.
fn skip_name(buf: &[u8], mut offset: usize) -> Option<usize> {
    loop {
        let len = *buf.get(offset)?;
        if len & 0xC0 == 0xC0 {
            // compression pointer: two bytes total, then done.
            buf.get(offset + 1)?;
            return Some(offset + 2);
        }
        if len == 0 {
            return Some(offset + 1);
        }
        offset = offset.checked_add(1 + len as usize)?;
        if offset > buf.len() {
            return None;
        }
    }
}

/// Skips one resource record (name + fixed fields + RDATA), returning the
/// offset just past it, along with the record's type and the raw value of
/// its 16-bit class field (needed for EDNS's UDP-payload-size overload).
fn skip_rr(buf: &[u8], offset: usize) -> Option<(usize, u16, u16)> {
    let offset = skip_name(buf, offset)?;
    let rtype = be_u16(buf, offset)?;
    let rclass = be_u16(buf, offset + 2)?;
    let rdlength = be_u16(buf, offset + 8)? as usize;
    let after_fixed = offset.checked_add(10)?;
    let after_rdata = after_fixed.checked_add(rdlength)?;
    if after_rdata > buf.len() {
        return None;
    }
    Some((after_rdata, rtype, rclass))
}

fn parse(payload: &[u8]) -> Option<ParsedMessage> {
    if payload.len() < 12 {
        return None;
    }
    let tx_id = be_u16(payload, 0)?;
    let flags = be_u16(payload, 2)?;
    let qr = (flags >> 15) & 1 == 1;
    let opcode = ((flags >> 11) & 0x0F) as u8;
    let qdcount = be_u16(payload, 4)?;
    let ancount = be_u16(payload, 6)?;
    let nscount = be_u16(payload, 8)?;
    let arcount = be_u16(payload, 10)?;

    let mut offset = 12usize;
    let mut questions = Vec::with_capacity(qdcount as usize);
    for _ in 0..qdcount {
        offset = skip_name(payload, offset)?;
        let qtype = be_u16(payload, offset)?;
        be_u16(payload, offset + 2)?; // qclass, unused
        offset = offset.checked_add(4)?;
        if offset > payload.len() {
            return None;
        }
        questions.push(Question { qtype });
    }

    for _ in 0..ancount {
        let (next, _, _) = skip_rr(payload, offset)?;
        offset = next;
    }
    for _ in 0..nscount {
        let (next, _, _) = skip_rr(payload, offset)?;
        offset = next;
    }

    let mut edns = None;
    for _ in 0..arcount {
        let (next, rtype, rclass) = skip_rr(payload, offset)?;
        if rtype == OPT_RRTYPE {
            edns = Some(Edns {
                udp_payload_size: rclass,
            });
        }
        offset = next;
    }

    Some(ParsedMessage {
        qr,
        opcode,
        tx_id,
        qdcount,
        ancount,
        questions,
        edns,
    })
}

/// Per-flow DNS counters, maintained by [`DnsExtractorState::observe`] and
/// rendered to the output schema by [`DnsExtractorState::derived`].
#[derive(Debug, Clone, Default)]
pub struct DnsExtractorState {
    query_packets: u64,
    response_packets: u64,
    total_query_bytes: u64,
    total_response_bytes: u64,
    qdcount_total: u64,
    ancount_total: u64,
    last_opcode: Option<u8>,
    last_query_type: Option<u16>,
    query_type_distribution: HashMap<u16, u64>,
    any_query_count: u64,
    txt_query_count: u64,
    edns_present: bool,
    edns_udp_size_max: u16,
    pending_queries: HashMap<u16, i64>,
    response_time_sum_ms: f64,
    response_time_sum_sq_ms: f64,
    response_time_count: u64,
    ttl_violations: u64,
    packet_size: OnlineStats,
}

impl DnsExtractorState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses the header, question, and additional sections, updating
    /// every counter in one pass. Returns `false` (and mutates nothing)
    /// if `payload` does not carry a well-formed DNS message.
    pub fn observe(&mut self, payload: &[u8], wire_length: u64, timestamp_ms: i64) -> bool {
        let Some(msg) = parse(payload) else {
            return false;
        };

        if msg.qr {
            self.response_packets += 1;
            self.total_response_bytes += wire_length;
            if let Some(sent_at) = self.pending_queries.remove(&msg.tx_id) {
                let elapsed = (timestamp_ms - sent_at) as f64;
                self.response_time_sum_ms += elapsed;
                self.response_time_sum_sq_ms += elapsed * elapsed;
                self.response_time_count += 1;
            }
        } else {
            self.query_packets += 1;
            self.total_query_bytes += wire_length;
            self.pending_queries.insert(msg.tx_id, timestamp_ms);
            if self.pending_queries.len() > PENDING_TABLE_CAP {
                self.pending_queries
                    .retain(|_, sent_at| timestamp_ms - *sent_at < PENDING_TABLE_MAX_AGE_MS);
            }
        }

        self.packet_size.add(wire_length as f64);
        self.last_opcode = Some(msg.opcode);
        self.qdcount_total += msg.qdcount as u64;
        self.ancount_total += msg.ancount as u64;

        if let Some(edns) = msg.edns {
            self.edns_present = true;
            self.edns_udp_size_max = self.edns_udp_size_max.max(edns.udp_payload_size);
        }

        for q in &msg.questions {
            *self.query_type_distribution.entry(q.qtype).or_insert(0) += 1;
            self.last_query_type = Some(q.qtype);
            if q.qtype == ANY_QTYPE {
                self.any_query_count += 1;
            } else if q.qtype == TXT_QTYPE {
                self.txt_query_count += 1;
            }
        }

        true
    }

    pub fn pending_query_count(&self) -> usize {
        self.pending_queries.len()
    }

    pub fn last_opcode(&self) -> Option<u8> {
        self.last_opcode
    }

    pub fn last_query_type(&self) -> Option<u16> {
        self.last_query_type
    }

    pub fn edns_present(&self) -> bool {
        self.edns_present
    }

    /// Computes every export-time derived feature. `duration_sec` must
    /// already be clamped to >= 1.0 by the caller; `flow_total_bytes` is
    /// the owning flow's combined fwd+bwd byte sum.
    pub fn derived(&self, duration_sec: f64, flow_total_bytes: u64) -> DnsDerived {
        let amplification = if self.total_query_bytes == 0 && self.total_response_bytes > 0 {
            999.0
        } else if self.total_response_bytes == 0 {
            0.0
        } else {
            self.total_response_bytes as f64 / self.total_query_bytes as f64
        };

        let query_response_ratio = if self.response_packets == 0 {
            self.query_packets as f64
        } else {
            self.query_packets as f64 / self.response_packets as f64
        };

        let any_ratio = if self.query_packets == 0 {
            0.0
        } else {
            self.any_query_count as f64 / self.query_packets as f64
        };
        let txt_ratio = if self.query_packets == 0 {
            0.0
        } else {
            self.txt_query_count as f64 / self.query_packets as f64
        };

        let mean_answers_per_query = if self.response_packets == 0 {
            0.0
        } else {
            self.ancount_total as f64 / self.response_packets as f64
        };

        let response_time_variance = if self.response_time_count <= 1 {
            0.0
        } else {
            let n = self.response_time_count as f64;
            let mean = self.response_time_sum_ms / n;
            (self.response_time_sum_sq_ms / n - mean * mean).max(0.0)
        };

        let port_53_ratio = if flow_total_bytes == 0 {
            0.0
        } else {
            (self.total_query_bytes + self.total_response_bytes) as f64 / flow_total_bytes as f64
        };

        DnsDerived {
            dns_qr: if self.response_packets > 0 { 1 } else { 0 },
            dns_total_queries: self.query_packets,
            dns_total_responses: self.response_packets,
            dns_response_bytes: self.total_response_bytes,
            queries_per_second: self.query_packets as f64 / duration_sec.max(1.0),
            dns_amplification_factor: amplification,
            query_response_ratio,
            dns_any_query_ratio: any_ratio,
            dns_txt_query_ratio: txt_ratio,
            packet_size_stddev: self.packet_size.stdev(),
            dns_mean_answers_per_query: mean_answers_per_query,
            response_time_variance,
            dns_response_inconsistency: self
                .query_packets
                .abs_diff(self.response_packets),
            port_53_traffic_ratio: port_53_ratio,
            // Cross-server fanout would need cross-flow correlation, which
            // is an explicit non-goal; within a single flow we approximate
            // it with the diversity of query types observed (see DESIGN.md).
            dns_server_fanout: self.query_type_distribution.len() as u64,
            // Left unpopulated by design; see DESIGN.md.
            ttl_violation_rate: self.ttl_violations as f64,
        }
    }
}

/// The DNS-specific columns of an exported flow row.
#[derive(Debug, Clone, Copy, Default)]
pub struct DnsDerived {
    pub dns_qr: u8,
    pub dns_total_queries: u64,
    pub dns_total_responses: u64,
    pub dns_response_bytes: u64,
    pub queries_per_second: f64,
    pub dns_amplification_factor: f64,
    pub query_response_ratio: f64,
    pub dns_any_query_ratio: f64,
    pub dns_txt_query_ratio: f64,
    pub packet_size_stddev: f64,
    pub dns_mean_answers_per_query: f64,
    pub response_time_variance: f64,
    pub dns_response_inconsistency: u64,
    pub port_53_traffic_ratio: f64,
    pub dns_server_fanout: u64,
    pub ttl_violation_rate: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_query(tx_id: u16, qtype: u16, name: &str) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&tx_id.to_be_bytes());
        buf.extend_from_slice(&0x0100u16.to_be_bytes()); // QR=0, RD=1
        buf.extend_from_slice(&1u16.to_be_bytes()); // qdcount
        buf.extend_from_slice(&0u16.to_be_bytes()); // ancount
        buf.extend_from_slice(&0u16.to_be_bytes()); // nscount
        buf.extend_from_slice(&0u16.to_be_bytes()); // arcount
        for label in name.split('.') {
            buf.push(label.len() as u8);
            buf.extend_from_slice(label.as_bytes());
        }
        buf.push(0);
        buf.extend_from_slice(&qtype.to_be_bytes());
        buf.extend_from_slice(&1u16.to_be_bytes()); // qclass IN
        buf
    }

    fn build_response(tx_id: u16, ancount: u16, name: &str) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&tx_id.to_be_bytes());
        buf.extend_from_slice(&0x8180u16.to_be_bytes()); // QR=1
        buf.extend_from_slice(&1u16.to_be_bytes());
        buf.extend_from_slice(&ancount.to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes());
        for label in name.split('.') {
            buf.push(label.len() as u8);
            buf.extend_from_slice(label.as_bytes());
        }
        buf.push(0);
        buf.extend_from_slice(&1u16.to_be_bytes()); // A
        buf.extend_from_slice(&1u16.to_be_bytes());
        for _ in 0..ancount {
            // name as pointer to offset 12
            buf.extend_from_slice(&0xC00Cu16.to_be_bytes());
            buf.extend_from_slice(&1u16.to_be_bytes()); // type A
            buf.extend_from_slice(&1u16.to_be_bytes()); // class IN
            buf.extend_from_slice(&60u32.to_be_bytes()); // ttl
            buf.extend_from_slice(&4u16.to_be_bytes()); // rdlength
            buf.extend_from_slice(&[1, 2, 3, 4]);
        }
        buf
    }

    #[test]
    fn malformed_payload_mutates_nothing() {
        let mut state = DnsExtractorState::new();
        assert!(!state.observe(&[0u8; 3], 60, 1000));
        assert_eq!(state.query_packets, 0);
        assert_eq!(state.response_packets, 0);
    }

    #[test]
    fn query_then_response_computes_response_time() {
        let mut state = DnsExtractorState::new();
        let q = build_query(0xABCD, 1, "example.com");
        assert!(state.observe(&q, 60, 1000));
        let r = build_response(0xABCD, 1, "example.com");
        assert!(state.observe(&r, 300, 1060));
        let derived = state.derived(1.0, 360);
        assert_eq!(derived.dns_total_queries, 1);
        assert_eq!(derived.dns_total_responses, 1);
        assert_eq!(derived.query_response_ratio, 1.0);
        assert_eq!(derived.dns_amplification_factor, 5.0);
    }

    #[test]
    fn zero_query_bytes_with_responses_is_sentinel() {
        let mut state = DnsExtractorState::new();
        state.total_response_bytes = 500;
        state.response_packets = 1;
        let derived = state.derived(1.0, 500);
        assert_eq!(derived.dns_amplification_factor, 999.0);
    }

    #[test]
    fn any_query_ratio_tracks_qtype_255() {
        let mut state = DnsExtractorState::new();
        for i in 0..10u16 {
            let q = build_query(i, ANY_QTYPE, "flood.example");
            assert!(state.observe(&q, 60, 1000 + i as i64));
        }
        let derived = state.derived(1.0, 600);
        assert_eq!(derived.dns_any_query_ratio, 1.0);
    }

    #[test]
    fn pending_table_evicts_old_entries_past_cap() {
        let mut state = DnsExtractorState::new();
        for i in 0..PENDING_TABLE_CAP as u16 {
            let q = build_query(i, 1, "a.example");
            state.observe(&q, 10, 0);
            let _ = i;
        }
        assert_eq!(state.pending_query_count(), PENDING_TABLE_CAP);
        // one more insertion, far in the future, should trigger eviction of
        // everything older than 5000ms while leaving itself behind.
        let q = build_query(PENDING_TABLE_CAP as u16, 1, "a.example");
        state.observe(&q, 10, 10_000);
        assert!(state.pending_query_count() <= PENDING_TABLE_CAP);
        assert!(state.pending_query_count() >= 1);
    }

    #[test]
    fn query_flood_no_responses_sentinel_ratio() {
        let mut state = DnsExtractorState::new();
        for i in 0..1000u16 {
            let q = build_query(i, 1, "flood.example");
            state.observe(&q, 60, i as i64);
        }
        let derived = state.derived(1.0, 60_000);
        assert_eq!(derived.dns_total_queries, 1000);
        assert_eq!(derived.dns_total_responses, 0);
        assert_eq!(derived.query_response_ratio, 1000.0);
        assert_eq!(derived.dns_amplification_factor, 0.0);
        assert_eq!(derived.queries_per_second, 1000.0);
    }
}
