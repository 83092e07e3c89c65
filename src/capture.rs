//! Thin adapter around `pcap`: opens an offline file or a live interface
//! and yields `(timestamp_ms, raw_frame_bytes)` pairs. This module owns
//! no flow state; it only gets bytes in front of `decoder`/`manager`.

use pcap::{Active, Capture, Device, Offline};

use crate::error::{CoreError, Result};

const DEFAULT_SNAPLEN: i32 = 65535;

/// A packet source abstracting over libpcap's offline-file and
/// live-interface handles.
pub enum PacketSource {
    File(Capture<Offline>),
    Live(Capture<Active>),
}

impl PacketSource {
    pub fn open_file(path: &str) -> Result<Self> {
        let capture = Capture::from_file(path).map_err(|e| {
            CoreError::CaptureSource(format!("opening capture file {path}: {e}"))
        })?;
        Ok(PacketSource::File(capture))
    }

    pub fn open_live(interface: &str, snaplen: i32) -> Result<Self> {
        let device = Device::list()
            .map_err(CoreError::from)?
            .into_iter()
            .find(|d| d.name == interface)
            .ok_or_else(|| {
                CoreError::CaptureSource(format!("no such interface: {interface}"))
            })?;

        let capture = Capture::from_device(device)
            .map_err(CoreError::from)?
            .snaplen(if snaplen > 0 { snaplen } else { DEFAULT_SNAPLEN })
            .promisc(true)
            .immediate_mode(true)
            .open()
            .map_err(CoreError::from)?;
        Ok(PacketSource::Live(capture))
    }

    /// Pulls the next frame. Returns `Ok(None)` on clean end-of-file for
    /// offline captures; live captures only return `Err` or `Ok(Some)`.
    pub fn next_frame(&mut self) -> Result<Option<(i64, Vec<u8>)>> {
        let result = match self {
            PacketSource::File(cap) => cap.next_packet(),
            PacketSource::Live(cap) => cap.next_packet(),
        };
        match result {
            Ok(packet) => {
                let ts_ms = packet.header.ts.tv_sec as i64 * 1000
                    + packet.header.ts.tv_usec as i64 / 1000;
                Ok(Some((ts_ms, packet.data.to_vec())))
            }
            Err(pcap::Error::NoMorePackets) => Ok(None),
            Err(err) => Err(CoreError::from(err)),
        }
    }
}

/// Lists capture-capable interfaces as `(name, description, addresses)`
/// triples, backing the `-l` CLI flag.
pub fn list_interfaces() -> Result<Vec<(String, String, Vec<String>)>> {
    let devices = Device::list().map_err(CoreError::from)?;
    Ok(devices
        .into_iter()
        .map(|d| {
            let description = d.desc.unwrap_or_default();
            let addrs = d.addresses.iter().map(|a| a.addr.to_string()).collect();
            (d.name, description, addrs)
        })
        .collect())
}
