//! Command-line surface: offline/live capture selection, output path,
//! interface listing, row labeling, the remote-sink flags, plus a couple
//! of operator-tunable escape hatches over otherwise-fixed constants.

use clap::Parser;

use crate::manager::FLOW_TIMEOUT_MS;

#[derive(Debug, Parser)]
#[command(
    name = "dnsflow_meter",
    about = "Offline and live DNS-aware network flow analyzer",
    group(
        clap::ArgGroup::new("label")
            .args(["attack", "benign"])
            .multiple(false)
    )
)]
pub struct Cli {
    /// Offline pcap file to read.
    #[arg(short = 'f', long = "file", value_name = "PATH")]
    pub file: Option<String>,

    /// Live interface to capture from.
    #[arg(short = 'i', long = "interface", value_name = "IFACE")]
    pub interface: Option<String>,

    /// Output CSV path.
    #[arg(short = 'o', long = "output", default_value = "flow_output.csv")]
    pub output: String,

    /// List capture interfaces and exit.
    #[arg(short = 'l', long = "list-interfaces")]
    pub list_interfaces: bool,

    /// Label every exported row ATTACK.
    #[arg(short = 'a', long = "attack")]
    pub attack: bool,

    /// Label every exported row BENIGN.
    #[arg(short = 'b', long = "benign")]
    pub benign: bool,

    /// Remote sink credentials path (Sheets-style buffered sink).
    #[arg(short = 'g', long = "creds", value_name = "PATH")]
    pub remote_creds: Option<String>,

    /// Remote sink spreadsheet/identity id.
    #[arg(short = 's', long = "sheet-id", value_name = "ID")]
    pub remote_sheet_id: Option<String>,

    /// Flow idle timeout, in milliseconds.
    #[arg(long = "flow-timeout-ms", default_value_t = FLOW_TIMEOUT_MS)]
    pub flow_timeout_ms: i64,

    /// Capture snapshot length for live interfaces.
    #[arg(long = "snaplen", default_value_t = 65535)]
    pub snaplen: i32,
}

impl Cli {
    pub fn label(&self) -> Option<String> {
        if self.attack {
            Some("ATTACK".to_string())
        } else if self.benign {
            Some("BENIGN".to_string())
        } else {
            None
        }
    }

    pub fn wants_remote_sink(&self) -> bool {
        self.remote_creds.is_some() || self.remote_sheet_id.is_some()
    }
}
