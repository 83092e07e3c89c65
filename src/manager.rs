//! Ingests packets, classifies direction, allocates/looks up flows,
//! enforces idle timeouts, and drives eviction and final flush.

use std::collections::HashMap;

use log::{debug, info, warn};

use crate::decoder::{decode_ethernet_frame, PacketView};
use crate::flow::Flow;
use crate::flow_key::{resolve, Direction, FlowKey};
use crate::sinks::Sink;

/// Flow idle timeout: the maximum observed gap tolerated within one
/// flow before it is evicted.
pub const FLOW_TIMEOUT_MS: i64 = 120_000;

/// Packets in the pending-query table notwithstanding, a flow's own
/// lifetime is bounded by this timestamp window: captures with
/// uninitialized or corrupted timestamps outside it are dropped rather
/// than poisoning duration statistics.
const MIN_TIMESTAMP_MS: i64 = 1_483_228_800_000; // 2017-01-01T00:00:00Z
const MAX_TIMESTAMP_MS: i64 = 1_893_456_000_000; // 2030-01-01T00:00:00Z

const SWEEP_PACKET_INTERVAL: u64 = 5_000;
const SWEEP_TIME_INTERVAL_MS: i64 = 30_000;

#[derive(Debug, Default, Clone, Copy)]
pub struct RunCounters {
    pub total_packets: u64,
    pub skipped_packets: u64,
}

/// Owns the active-flow table exclusively; no other component may mutate
/// it.
pub struct FlowManager {
    table: HashMap<FlowKey, Flow>,
    sinks: Vec<Box<dyn Sink>>,
    label: Option<String>,
    counters: RunCounters,
    last_timeout_check_ms: i64,
    last_sweep_packet_count: u64,
    flow_timeout_ms: i64,
    dumped: bool,
}

impl FlowManager {
    pub fn new(sinks: Vec<Box<dyn Sink>>, label: Option<String>, flow_timeout_ms: i64) -> Self {
        Self {
            table: HashMap::new(),
            sinks,
            label,
            counters: RunCounters::default(),
            last_timeout_check_ms: 0,
            last_sweep_packet_count: 0,
            flow_timeout_ms,
            dumped: false,
        }
    }

    pub fn counters(&self) -> RunCounters {
        self.counters
    }

    pub fn active_flow_count(&self) -> usize {
        self.table.len()
    }

    /// Decodes a raw link-layer frame and feeds it through the flow
    /// pipeline. Decode failures and out-of-window timestamps are
    /// absorbed here and only ever show up as a skip count. Every frame
    /// handed to this method counts toward `total_packets`, whether or
    /// not it ends up skipped, so `skipped_packets / total_packets` is a
    /// meaningful skip percentage.
    pub fn ingest(&mut self, frame: &[u8], timestamp_ms: i64) {
        self.counters.total_packets += 1;

        if !(MIN_TIMESTAMP_MS..=MAX_TIMESTAMP_MS).contains(&timestamp_ms) {
            warn!("dropping packet with out-of-window timestamp {timestamp_ms}");
            self.counters.skipped_packets += 1;
            return;
        }

        match decode_ethernet_frame(frame) {
            Ok(packet) => self.process_packet(&packet, timestamp_ms),
            Err(err) => {
                debug!("skipping malformed frame: {err:?}");
                self.counters.skipped_packets += 1;
            }
        }
    }

    fn process_packet(&mut self, packet: &PacketView, timestamp_ms: i64) {
        let fwd_key = FlowKey::new(
            packet.ip_src,
            packet.ip_dst,
            packet.src_port,
            packet.dst_port,
            packet.protocol,
        );
        let bwd_key = fwd_key.reverse();

        let (mut key, mut direction) = resolve(&fwd_key, &bwd_key, |k| self.table.contains_key(k));

        if let Some(existing) = self.table.get(&key) {
            if timestamp_ms - existing.last_packet_time_ms() > self.flow_timeout_ms {
                if let Some(flow) = self.table.remove(&key) {
                    debug!("evicting idle flow {key:?} before new packet");
                    self.export(flow);
                }
                // after an idle-timeout eviction the packet starts a
                // brand new flow under the forward key.
                key = fwd_key;
                direction = Direction::Forward;
            }
        }

        let flow = self.table.entry(key).or_insert_with(|| {
            debug!("creating new flow {key:?}");
            Flow::new(key, timestamp_ms, self.label.clone())
        });

        let is_forward = matches!(direction, Direction::Forward);
        flow.add_packet(timestamp_ms, packet.wire_length, &packet.payload, is_forward);

        self.maybe_sweep(timestamp_ms);
    }

    fn maybe_sweep(&mut self, timestamp_ms: i64) {
        let packets_since_sweep = self.counters.total_packets - self.last_sweep_packet_count;
        let time_since_sweep = timestamp_ms - self.last_timeout_check_ms;
        if packets_since_sweep < SWEEP_PACKET_INTERVAL && time_since_sweep < SWEEP_TIME_INTERVAL_MS
        {
            return;
        }
        self.last_sweep_packet_count = self.counters.total_packets;
        self.last_timeout_check_ms = timestamp_ms;

        let timeout = self.flow_timeout_ms;
        let expired: Vec<FlowKey> = self
            .table
            .iter()
            .filter(|(_, flow)| timestamp_ms - flow.last_packet_time_ms() > timeout)
            .map(|(key, _)| *key)
            .collect();

        if !expired.is_empty() {
            info!("sweep evicting {} idle flows", expired.len());
        }
        for key in expired {
            if let Some(flow) = self.table.remove(&key) {
                self.export(flow);
            }
        }
    }

    fn export(&mut self, flow: Flow) {
        let row = flow.to_row();
        for sink in &mut self.sinks {
            if let Err(err) = sink.write_row(&row) {
                warn!("sink write failed: {err}");
            }
        }
    }

    /// Drains every remaining flow and flushes both sinks. Idempotent:
    /// the second and later calls are no-ops.
    pub fn dump_all(&mut self) {
        if self.dumped {
            return;
        }
        self.dumped = true;

        let snapshot: Vec<FlowKey> = self.table.keys().copied().collect();
        info!("final flush: exporting {} flows", snapshot.len());
        for key in snapshot {
            if let Some(flow) = self.table.remove(&key) {
                self.export(flow);
            }
        }
        for sink in &mut self.sinks {
            if let Err(err) = sink.flush() {
                warn!("sink flush failed during final dump: {err}");
            }
        }
    }
}
