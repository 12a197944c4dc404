//! Frame building utilities for tests

use smoltcp::wire::{
    ArpOperation, ArpPacket, ArpRepr, EthernetAddress, EthernetFrame, EthernetProtocol,
    EthernetRepr, Ipv4Address,
};

/// Local experimental ethertype carrying a sequence number
pub const TEST_ETHERTYPE: u16 = 0x88b5;

pub const SIM_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x01];
pub const PEER_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x02];

/// Build a raw Ethernet frame
pub fn ethernet_frame(dst: [u8; 6], src: [u8; 6], ethertype: u16, payload: &[u8]) -> Vec<u8> {
    let repr = EthernetRepr {
        src_addr: EthernetAddress::from_bytes(&src),
        dst_addr: EthernetAddress::from_bytes(&dst),
        ethertype: EthernetProtocol::from(ethertype),
    };

    let mut buffer = vec![0u8; repr.buffer_len() + payload.len()];
    let mut frame = EthernetFrame::new_unchecked(&mut buffer);
    repr.emit(&mut frame);
    frame.payload_mut().copy_from_slice(payload);
    buffer
}

/// Frame whose payload is `seq` followed by `pad` filler bytes
pub fn sequenced_frame(src: [u8; 6], seq: u32, pad: usize) -> Vec<u8> {
    let mut payload = seq.to_be_bytes().to_vec();
    payload.resize(4 + pad, seq as u8);
    ethernet_frame(EthernetAddress::BROADCAST.0, src, TEST_ETHERTYPE, &payload)
}

/// Extract the sequence number from a frame built by `sequenced_frame`
pub fn frame_seq(frame: &[u8]) -> Option<u32> {
    let eth = EthernetFrame::new_checked(frame).ok()?;
    if eth.ethertype() != EthernetProtocol::from(TEST_ETHERTYPE) {
        return None;
    }
    let bytes = eth.payload().get(..4)?;
    Some(u32::from_be_bytes(bytes.try_into().ok()?))
}

/// Build an ARP request packet
pub fn arp_request(sender_mac: [u8; 6], sender_ip: [u8; 4], target_ip: [u8; 4]) -> Vec<u8> {
    let [a, b, c, d] = sender_ip;
    let [w, x, y, z] = target_ip;
    let arp_repr = ArpRepr::EthernetIpv4 {
        operation: ArpOperation::Request,
        source_hardware_addr: EthernetAddress::from_bytes(&sender_mac),
        source_protocol_addr: Ipv4Address::new(a, b, c, d),
        target_hardware_addr: EthernetAddress::from_bytes(&[0, 0, 0, 0, 0, 0]),
        target_protocol_addr: Ipv4Address::new(w, x, y, z),
    };

    let eth_repr = EthernetRepr {
        src_addr: EthernetAddress::from_bytes(&sender_mac),
        dst_addr: EthernetAddress::BROADCAST,
        ethertype: EthernetProtocol::Arp,
    };

    let mut buffer = vec![0u8; eth_repr.buffer_len() + arp_repr.buffer_len()];
    let mut frame = EthernetFrame::new_unchecked(&mut buffer);
    eth_repr.emit(&mut frame);

    let mut arp_packet = ArpPacket::new_unchecked(frame.payload_mut());
    arp_repr.emit(&mut arp_packet);

    buffer
}

/// Check that a frame is an ARP request from `sender_mac`
pub fn is_arp_request_from(frame: &[u8], sender_mac: [u8; 6]) -> bool {
    let Ok(eth) = EthernetFrame::new_checked(frame) else {
        return false;
    };
    if eth.ethertype() != EthernetProtocol::Arp {
        return false;
    }
    let Ok(packet) = ArpPacket::new_checked(eth.payload()) else {
        return false;
    };
    matches!(
        ArpRepr::parse(&packet),
        Ok(ArpRepr::EthernetIpv4 {
            operation: ArpOperation::Request,
            source_hardware_addr,
            ..
        }) if source_hardware_addr == EthernetAddress::from_bytes(&sender_mac)
    )
}
