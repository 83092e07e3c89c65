//! Contract for extracting IP + transport + payload from a link-layer
//! frame. This is the narrow interface the flow manager consumes; the
//! capture source that hands it raw bytes lives outside the core
//! (`crate::capture`).

use std::net::IpAddr;

use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::ipv6::Ipv6Packet;
use pnet::packet::tcp::TcpPacket;
use pnet::packet::udp::UdpPacket;
use pnet::packet::Packet;

use crate::flow_key::Protocol;

/// A single decoded packet, detached from the underlying frame buffer.
#[derive(Debug, Clone)]
pub struct PacketView {
    pub ip_src: IpAddr,
    pub ip_dst: IpAddr,
    pub protocol: Protocol,
    pub src_port: u16,
    pub dst_port: u16,
    pub wire_length: u64,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// No IPv4/IPv6 header found, or it was truncated.
    NotIp,
    /// IP payload did not decode as TCP or UDP (or was truncated).
    UnsupportedTransport,
}

/// Decodes an Ethernet frame (as captured by libpcap) into a
/// [`PacketView`]. Non-IP frames and non-TCP/UDP transports are rejected
/// with [`DecodeError`] so the caller can count them as skipped without
/// ever seeing a partially-built view.
pub fn decode_ethernet_frame(frame: &[u8]) -> Result<PacketView, DecodeError> {
    use pnet::packet::ethernet::{EtherTypes, EthernetPacket};

    let eth = EthernetPacket::new(frame).ok_or(DecodeError::NotIp)?;
    match eth.get_ethertype() {
        EtherTypes::Ipv4 => decode_ipv4(eth.payload()),
        EtherTypes::Ipv6 => decode_ipv6(eth.payload()),
        _ => Err(DecodeError::NotIp),
    }
}

fn decode_ipv4(data: &[u8]) -> Result<PacketView, DecodeError> {
    let ipv4 = Ipv4Packet::new(data).ok_or(DecodeError::NotIp)?;
    let src = IpAddr::V4(ipv4.get_source());
    let dst = IpAddr::V4(ipv4.get_destination());
    let wire_length = ipv4.get_total_length() as u64;
    match ipv4.get_next_level_protocol() {
        IpNextHeaderProtocols::Tcp => decode_tcp(src, dst, wire_length, ipv4.payload()),
        IpNextHeaderProtocols::Udp => decode_udp(src, dst, wire_length, ipv4.payload()),
        _ => Err(DecodeError::UnsupportedTransport),
    }
}

fn decode_ipv6(data: &[u8]) -> Result<PacketView, DecodeError> {
    let ipv6 = Ipv6Packet::new(data).ok_or(DecodeError::NotIp)?;
    let src = IpAddr::V6(ipv6.get_source());
    let dst = IpAddr::V6(ipv6.get_destination());
    let wire_length = ipv6.payload().len() as u64 + 40;
    match ipv6.get_next_header() {
        IpNextHeaderProtocols::Tcp => decode_tcp(src, dst, wire_length, ipv6.payload()),
        IpNextHeaderProtocols::Udp => decode_udp(src, dst, wire_length, ipv6.payload()),
        _ => Err(DecodeError::UnsupportedTransport),
    }
}

fn decode_tcp(
    src: IpAddr,
    dst: IpAddr,
    wire_length: u64,
    data: &[u8],
) -> Result<PacketView, DecodeError> {
    let tcp = TcpPacket::new(data).ok_or(DecodeError::UnsupportedTransport)?;
    Ok(PacketView {
        ip_src: src,
        ip_dst: dst,
        protocol: Protocol::Tcp,
        src_port: tcp.get_source(),
        dst_port: tcp.get_destination(),
        wire_length,
        payload: tcp.payload().to_vec(),
    })
}

fn decode_udp(
    src: IpAddr,
    dst: IpAddr,
    wire_length: u64,
    data: &[u8],
) -> Result<PacketView, DecodeError> {
    let udp = UdpPacket::new(data).ok_or(DecodeError::UnsupportedTransport)?;
    Ok(PacketView {
        ip_src: src,
        ip_dst: dst,
        protocol: Protocol::Udp,
        src_port: udp.get_source(),
        dst_port: udp.get_destination(),
        wire_length,
        payload: udp.payload().to_vec(),
    })
}
