//! Header+row writers for exported flow rows. The core depends only on
//! the [`Sink`] trait; concrete sinks — a local CSV file and an optional
//! buffered remote batch uploader — are thin adapters around `csv` and
//! `reqwest` respectively.

use std::fs::File;
use std::io;
use std::path::Path;

use log::warn;
use serde::Serialize;

use crate::flow::FlowRow;

/// Everything the flow manager needs from an output destination.
pub trait Sink {
    fn write_row(&mut self, row: &FlowRow) -> io::Result<()>;
    fn flush(&mut self) -> io::Result<()>;
}

/// Serializable projection of [`FlowRow`] matching the output schema's
/// fixed column order. `label` is only present when the run was started
/// with `-a`/`-b`.
#[derive(Debug, Serialize)]
struct SerializableRow {
    src_ip: String,
    dst_ip: String,
    src_port: u16,
    dst_port: u16,
    protocol: String,

    dns_amplification_factor: f64,
    query_response_ratio: f64,
    dns_any_query_ratio: f64,
    dns_txt_query_ratio: f64,
    dns_server_fanout: u64,
    dns_response_inconsistency: u64,
    ttl_violation_rate: f64,
    dns_queries_per_second: f64,
    dns_mean_answers_per_query: f64,
    port_53_traffic_ratio: f64,

    flow_bytes_per_sec: f64,
    flow_packets_per_sec: f64,
    fwd_packets_per_sec: f64,
    bwd_packets_per_sec: f64,

    flow_duration: i64,
    total_fwd_packets: u64,
    total_bwd_packets: u64,
    total_fwd_bytes: u64,
    total_bwd_bytes: u64,

    dns_total_queries: u64,
    dns_total_responses: u64,
    dns_response_bytes: u64,

    flow_iat_mean: f64,
    flow_iat_std: f64,
    flow_iat_min: f64,
    flow_iat_max: f64,
    fwd_iat_mean: f64,
    bwd_iat_mean: f64,

    fwd_packet_length_mean: f64,
    bwd_packet_length_mean: f64,
    packet_size_std: f64,
    flow_length_min: f64,
    flow_length_max: f64,

    response_time_variance: f64,
    average_packet_size: f64,

    #[serde(skip_serializing_if = "Option::is_none")]
    label: Option<String>,
}

impl From<&FlowRow> for SerializableRow {
    fn from(row: &FlowRow) -> Self {
        Self {
            src_ip: row.src_ip.clone(),
            dst_ip: row.dst_ip.clone(),
            src_port: row.src_port,
            dst_port: row.dst_port,
            protocol: row.protocol.as_str().to_string(),
            dns_amplification_factor: row.dns.dns_amplification_factor,
            query_response_ratio: row.dns.query_response_ratio,
            dns_any_query_ratio: row.dns.dns_any_query_ratio,
            dns_txt_query_ratio: row.dns.dns_txt_query_ratio,
            dns_server_fanout: row.dns.dns_server_fanout,
            dns_response_inconsistency: row.dns.dns_response_inconsistency,
            ttl_violation_rate: row.dns.ttl_violation_rate,
            dns_queries_per_second: row.dns.queries_per_second,
            dns_mean_answers_per_query: row.dns.dns_mean_answers_per_query,
            port_53_traffic_ratio: row.dns.port_53_traffic_ratio,
            flow_bytes_per_sec: row.flow_bytes_per_sec,
            flow_packets_per_sec: row.flow_packets_per_sec,
            fwd_packets_per_sec: row.fwd_packets_per_sec,
            bwd_packets_per_sec: row.bwd_packets_per_sec,
            flow_duration: row.flow_duration_ms,
            total_fwd_packets: row.total_fwd_packets,
            total_bwd_packets: row.total_bwd_packets,
            total_fwd_bytes: row.total_fwd_bytes,
            total_bwd_bytes: row.total_bwd_bytes,
            dns_total_queries: row.dns.dns_total_queries,
            dns_total_responses: row.dns.dns_total_responses,
            dns_response_bytes: row.dns.dns_response_bytes,
            flow_iat_mean: row.flow_iat_mean,
            flow_iat_std: row.flow_iat_std,
            flow_iat_min: row.flow_iat_min,
            flow_iat_max: row.flow_iat_max,
            fwd_iat_mean: row.fwd_iat_mean,
            bwd_iat_mean: row.bwd_iat_mean,
            fwd_packet_length_mean: row.fwd_packet_length_mean,
            bwd_packet_length_mean: row.bwd_packet_length_mean,
            packet_size_std: row.packet_size_std,
            flow_length_min: row.flow_length_min,
            flow_length_max: row.flow_length_max,
            response_time_variance: row.dns.response_time_variance,
            average_packet_size: row.average_packet_size,
            label: row.label.clone(),
        }
    }
}

/// Primary file sink: one CSV row per flow, header written once.
pub struct CsvSink {
    writer: csv::Writer<File>,
}

impl CsvSink {
    pub fn create(path: &Path) -> csv::Result<Self> {
        Ok(Self {
            writer: csv::Writer::from_path(path)?,
        })
    }
}

impl Sink for CsvSink {
    fn write_row(&mut self, row: &FlowRow) -> io::Result<()> {
        let serializable: SerializableRow = row.into();
        self.writer
            .serialize(&serializable)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

/// Buffered remote sink, batching rows before a single HTTP POST — the
/// narrow shape a "Google Sheets"-style append API needs. The actual
/// spreadsheet/auth wiring is an external collaborator; this type only
/// owns the batching, header-once, and idempotent-flush contract, and
/// its HTTP transport is pluggable via [`RowTransport`].
pub trait RowTransport: Send {
    fn send_batch(&mut self, rows: &[String]) -> io::Result<()>;
}

pub struct HttpRowTransport {
    client: reqwest::blocking::Client,
    endpoint: String,
    spreadsheet_id: String,
}

impl HttpRowTransport {
    pub fn new(endpoint: String, spreadsheet_id: String) -> Self {
        Self {
            client: reqwest::blocking::Client::new(),
            endpoint,
            spreadsheet_id,
        }
    }
}

impl RowTransport for HttpRowTransport {
    fn send_batch(&mut self, rows: &[String]) -> io::Result<()> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&serde_json::json!({
                "spreadsheetId": self.spreadsheet_id,
                "rows": rows,
            }))
            .send()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        if response.status() == reqwest::StatusCode::FORBIDDEN {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!(
                    "sheet {} rejected the batch (check sharing permissions)",
                    self.spreadsheet_id
                ),
            ));
        }
        if !response.status().is_success() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("remote sink returned {}", response.status()),
            ));
        }
        Ok(())
    }
}

const BATCH_SIZE: usize = 100;

/// Column names in the same order as [`SerializableRow`]'s fields, used
/// to build the remote sink's one-time header payload. `CsvSink` gets its
/// header for free from `csv::Writer`'s serialize-on-first-row behavior;
/// the remote transport has no such built-in, so this sink has to build
/// and send that row itself.
const REMOTE_SINK_COLUMNS: &[&str] = &[
    "src_ip",
    "dst_ip",
    "src_port",
    "dst_port",
    "protocol",
    "dns_amplification_factor",
    "query_response_ratio",
    "dns_any_query_ratio",
    "dns_txt_query_ratio",
    "dns_server_fanout",
    "dns_response_inconsistency",
    "ttl_violation_rate",
    "dns_queries_per_second",
    "dns_mean_answers_per_query",
    "port_53_traffic_ratio",
    "flow_bytes_per_sec",
    "flow_packets_per_sec",
    "fwd_packets_per_sec",
    "bwd_packets_per_sec",
    "flow_duration",
    "total_fwd_packets",
    "total_bwd_packets",
    "total_fwd_bytes",
    "total_bwd_bytes",
    "dns_total_queries",
    "dns_total_responses",
    "dns_response_bytes",
    "flow_iat_mean",
    "flow_iat_std",
    "flow_iat_min",
    "flow_iat_max",
    "fwd_iat_mean",
    "bwd_iat_mean",
    "fwd_packet_length_mean",
    "bwd_packet_length_mean",
    "packet_size_std",
    "flow_length_min",
    "flow_length_max",
    "response_time_variance",
    "average_packet_size",
    "label",
];

pub struct RemoteSink {
    transport: Box<dyn RowTransport>,
    url: String,
    buffer: Vec<String>,
    header_written: bool,
    permission_error_shown: bool,
}

impl RemoteSink {
    pub fn new(transport: Box<dyn RowTransport>, url: String) -> Self {
        Self {
            transport,
            url,
            buffer: Vec::new(),
            header_written: false,
            permission_error_shown: false,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn drain(&mut self) -> io::Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut self.buffer);
        match self.transport.send_batch(&batch) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::PermissionDenied => {
                if !self.permission_error_shown {
                    warn!("{err}");
                    self.permission_error_shown = true;
                }
                Err(err)
            }
            Err(err) => {
                // transient failure: logged, buffer already drained — the
                // batch already handed to the transport can't be recovered.
                warn!("remote sink batch failed: {err}");
                Err(err)
            }
        }
    }
}

impl Sink for RemoteSink {
    fn write_row(&mut self, row: &FlowRow) -> io::Result<()> {
        if !self.header_written {
            let header = serde_json::to_string(REMOTE_SINK_COLUMNS)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
            self.buffer.push(header);
            self.header_written = true;
        }
        let serializable: SerializableRow = row.into();
        let line = serde_json::to_string(&serializable)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        self.buffer.push(line);
        if self.buffer.len() >= BATCH_SIZE {
            self.drain()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.drain()
    }
}

/// In-memory sink used by tests to assert on exported rows directly.
#[cfg(test)]
pub struct VecSink {
    rows: std::sync::Arc<std::sync::Mutex<Vec<FlowRow>>>,
}

#[cfg(test)]
impl VecSink {
    pub fn new(rows: std::sync::Arc<std::sync::Mutex<Vec<FlowRow>>>) -> Self {
        Self { rows }
    }
}

#[cfg(test)]
impl Sink for VecSink {
    fn write_row(&mut self, row: &FlowRow) -> io::Result<()> {
        self.rows.lock().unwrap().push(row.clone());
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct FakeTransport {
        batches: Arc<Mutex<Vec<Vec<String>>>>,
        fail_with_permission: bool,
    }

    impl RowTransport for FakeTransport {
        fn send_batch(&mut self, rows: &[String]) -> io::Result<()> {
            if self.fail_with_permission {
                return Err(io::Error::new(io::ErrorKind::PermissionDenied, "nope"));
            }
            self.batches.lock().unwrap().push(rows.to_vec());
            Ok(())
        }
    }

    fn sample_row() -> FlowRow {
        let key = crate::flow_key::FlowKey::new(
            "10.0.0.1".parse().unwrap(),
            "8.8.8.8".parse().unwrap(),
            4000,
            53,
            crate::flow_key::Protocol::Udp,
        );
        crate::flow::Flow::new(key, 0, None).to_row()
    }

    #[test]
    fn remote_sink_batches_at_100_rows() {
        let fake = FakeTransport {
            batches: Arc::new(Mutex::new(Vec::new())),
            fail_with_permission: false,
        };
        let mut sink = RemoteSink::new(Box::new(fake), "https://example/sheet".into());
        for _ in 0..250 {
            sink.write_row(&sample_row()).unwrap();
        }
        sink.flush().unwrap();
        // two full batches drained during write_row, one partial at flush
        assert_eq!(sink.buffer.len(), 0);
    }

    #[test]
    fn first_batch_carries_a_header_row() {
        let batches = Arc::new(Mutex::new(Vec::new()));
        let fake = FakeTransport {
            batches: batches.clone(),
            fail_with_permission: false,
        };
        let mut sink = RemoteSink::new(Box::new(fake), "https://example/sheet".into());
        sink.write_row(&sample_row()).unwrap();
        sink.flush().unwrap();

        {
            let sent = batches.lock().unwrap();
            let first_batch = sent.first().expect("one batch sent");
            assert_eq!(first_batch.len(), 2); // header + one data row
            let header: Vec<String> = serde_json::from_str(&first_batch[0]).unwrap();
            assert_eq!(header, REMOTE_SINK_COLUMNS);
        }

        // a second row must not carry another header.
        sink.write_row(&sample_row()).unwrap();
        sink.flush().unwrap();
        let sent = batches.lock().unwrap();
        assert_eq!(sent[1].len(), 1);
    }

    #[test]
    fn flush_is_idempotent_when_buffer_empty() {
        let fake = FakeTransport {
            batches: Arc::new(Mutex::new(Vec::new())),
            fail_with_permission: false,
        };
        let mut sink = RemoteSink::new(Box::new(fake), "https://example/sheet".into());
        sink.flush().unwrap();
        sink.flush().unwrap();
    }

    #[test]
    fn permission_error_surfaced_once() {
        let fake = FakeTransport {
            batches: Arc::new(Mutex::new(Vec::new())),
            fail_with_permission: true,
        };
        let mut sink = RemoteSink::new(Box::new(fake), "https://example/sheet".into());
        sink.write_row(&sample_row()).unwrap();
        assert!(sink.flush().is_err());
        assert!(sink.permission_error_shown);
    }

    #[test]
    fn url_accessor_returns_configured_url() {
        let fake = FakeTransport {
            batches: Arc::new(Mutex::new(Vec::new())),
            fail_with_permission: false,
        };
        let sink = RemoteSink::new(Box::new(fake), "https://example/sheet".into());
        assert_eq!(sink.url(), "https://example/sheet");
    }

    #[test]
    fn vec_sink_collects_rows_for_assertions() {
        let rows = Arc::new(Mutex::new(Vec::new()));
        let mut sink = VecSink::new(rows.clone());
        sink.write_row(&sample_row()).unwrap();
        assert_eq!(rows.lock().unwrap().len(), 1);
    }
}
