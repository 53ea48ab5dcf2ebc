//! 82599 (ixgbe) register offsets, control bitflags, and advanced
//! descriptor layouts.

use bitflags::bitflags;

// ---------------------------------------------------------------------------
// Fixed-offset registers
// ---------------------------------------------------------------------------

/// Device Control Register.
pub const CTRL: u32 = 0x00000;
/// Extended Device Control Register.
pub const CTRL_EXT: u32 = 0x00018;
/// Extended Interrupt Mask Clear.
pub const EIMC: u32 = 0x00888;
/// EEPROM/Flash Control Register.
pub const EEC: u32 = 0x10010;
/// Receive DMA Control Register.
pub const RDRXCTL: u32 = 0x02F00;
/// Receive Control Register.
pub const RXCTRL: u32 = 0x03000;
/// Filter Control Register.
pub const FCTRL: u32 = 0x05080;
/// MAC Core Control 0 Register.
pub const HLREG0: u32 = 0x04240;
/// Auto Negotiation Control Register.
pub const AUTOC: u32 = 0x042A0;
/// Link Status Register.
pub const LINKS: u32 = 0x042A4;
/// DMA Tx Control.
pub const DMATXCTL: u32 = 0x04A80;
/// DCA Tx Descriptor Control Register, per-queue.
pub const RTTDCS: u32 = 0x04900;
/// DMA Tx Max Size Request Register.
pub const DTXMXSZRQ: u32 = 0x08100;

/// Good Packets Received Count.
pub const GPRC: u32 = 0x04074;
/// Good Packets Transmitted Count.
pub const GPTC: u32 = 0x04080;
/// Good Octets Received Count Low.
pub const GORCL: u32 = 0x04088;
/// Good Octets Received Count High.
pub const GORCH: u32 = 0x0408C;
/// Good Octets Transmitted Count Low.
pub const GOTCL: u32 = 0x04090;
/// Good Octets Transmitted Count High.
pub const GOTCH: u32 = 0x04094;

// ---------------------------------------------------------------------------
// Per-queue register index helpers
// ---------------------------------------------------------------------------

/// Receive Packet Buffer Size, queue `n` (n < 8).
pub fn rxpbsize(n: u32) -> u32 {
    0x03C00 + n * 4
}

/// Transmit Packet Buffer Size, queue `n` (n < 8).
pub fn txpbsize(n: u32) -> u32 {
    0x0CC00 + n * 4
}

/// Rx DCA Control Register, queue `n`. Bit 12 must be cleared on 82599 to
/// work around a DCA erratum; the feature itself is otherwise unused here.
pub fn dca_rxctrl(n: u32) -> u32 {
    if n <= 15 {
        0x02200 + n * 4
    } else if n < 64 {
        0x0100C + n * 0x40
    } else {
        0x0D00C + (n - 64) * 0x40
    }
}

/// Split Receive Control Register, queue `n`.
pub fn srrctl(n: u32) -> u32 {
    if n < 64 {
        0x01014 + n * 0x40
    } else {
        0x0D014 + (n - 64) * 0x40
    }
}

/// Receive Descriptor Base Address Low, queue `n`.
pub fn rdbal(n: u32) -> u32 {
    if n < 64 {
        0x01000 + n * 0x40
    } else {
        0x0D000 + (n - 64) * 0x40
    }
}

/// Receive Descriptor Base Address High, queue `n`.
pub fn rdbah(n: u32) -> u32 {
    if n < 64 {
        0x01004 + n * 0x40
    } else {
        0x0D004 + (n - 64) * 0x40
    }
}

/// Receive Descriptor Length, queue `n`.
pub fn rdlen(n: u32) -> u32 {
    if n < 64 {
        0x01008 + n * 0x40
    } else {
        0x0D008 + (n - 64) * 0x40
    }
}

/// Receive Descriptor Head, queue `n`.
pub fn rdh(n: u32) -> u32 {
    if n < 64 {
        0x01010 + n * 0x40
    } else {
        0x0D010 + (n - 64) * 0x40
    }
}

/// Receive Descriptor Tail, queue `n`.
pub fn rdt(n: u32) -> u32 {
    if n < 64 {
        0x01018 + n * 0x40
    } else {
        0x0D018 + (n - 64) * 0x40
    }
}

/// Receive Descriptor Control, queue `n`.
pub fn rxdctl(n: u32) -> u32 {
    if n < 64 {
        0x01028 + n * 0x40
    } else {
        0x0D028 + (n - 64) * 0x40
    }
}

/// Transmit Descriptor Base Address Low, queue `n`.
pub fn tdbal(n: u32) -> u32 {
    0x06000 + n * 0x40
}

/// Transmit Descriptor Base Address High, queue `n`.
pub fn tdbah(n: u32) -> u32 {
    0x06004 + n * 0x40
}

/// Transmit Descriptor Length, queue `n`.
pub fn tdlen(n: u32) -> u32 {
    0x06008 + n * 0x40
}

/// Transmit Descriptor Head, queue `n`.
pub fn tdh(n: u32) -> u32 {
    0x06010 + n * 0x40
}

/// Transmit Descriptor Tail, queue `n`.
pub fn tdt(n: u32) -> u32 {
    0x06018 + n * 0x40
}

/// Transmit Descriptor Control, queue `n`.
pub fn txdctl(n: u32) -> u32 {
    0x06028 + n * 0x40
}

// ---------------------------------------------------------------------------
// Control / status bitflags
// ---------------------------------------------------------------------------

bitflags! {
    /// CTRL register bits relevant to reset.
    #[derive(Debug, Clone, Copy)]
    pub struct Ctrl: u32 {
        /// Link Reset.
        const LNK_RST = 1 << 3;
        /// Device Reset.
        const RST = 1 << 26;
    }
}

impl Ctrl {
    /// Both reset bits, as section 4.6.3.2 of the datasheet requires setting
    /// together.
    pub const RST_MASK: u32 = Self::LNK_RST.bits() | Self::RST.bits();
}

bitflags! {
    /// EEC (EEPROM control) register bits.
    #[derive(Debug, Clone, Copy)]
    pub struct Eec: u32 {
        /// Auto Read Done.
        const ARD = 1 << 9;
    }
}

bitflags! {
    /// RDRXCTL register bits.
    #[derive(Debug, Clone, Copy)]
    pub struct RdrxCtl: u32 {
        /// DMA Init Done.
        const DMAIDONE = 1 << 3;
        /// Strip Ethernet CRC from received packets.
        const CRCSTRIP = 1 << 1;
    }
}

bitflags! {
    /// RXCTRL register bits.
    #[derive(Debug, Clone, Copy)]
    pub struct RxCtrl: u32 {
        /// Receive Enable.
        const RXEN = 1 << 0;
    }
}

bitflags! {
    /// FCTRL register bits.
    #[derive(Debug, Clone, Copy)]
    pub struct FCtrl: u32 {
        /// Broadcast Accept Mode.
        const BAM = 1 << 10;
        /// Unicast Promiscuous Enable.
        const UPE = 1 << 9;
        /// Multicast Promiscuous Enable.
        const MPE = 1 << 8;
    }
}

bitflags! {
    /// HLREG0 register bits.
    #[derive(Debug, Clone, Copy)]
    pub struct Hlreg0: u32 {
        /// Strip CRC from received packets.
        const RXCRCSTRP = 1 << 1;
        /// Append CRC to transmitted packets.
        const TXCRCEN = 1 << 0;
        /// Pad short transmitted packets to 64 bytes.
        const TXPADEN = 1 << 10;
    }
}

bitflags! {
    /// CTRL_EXT register bits.
    #[derive(Debug, Clone, Copy)]
    pub struct CtrlExt: u32 {
        /// No Snoop Disable.
        const NS_DIS = 1 << 16;
    }
}

bitflags! {
    /// SRRCTL register bits.
    #[derive(Debug, Clone, Copy)]
    pub struct Srrctl: u32 {
        /// Descriptor type mask (bits 27:25).
        const DESCTYPE_MASK = 0b111 << 25;
        /// Advanced descriptor, one buffer per packet.
        const DESCTYPE_ADV_ONEBUF = 1 << 25;
        /// Drop packets instead of stalling when no descriptor is free.
        const DROP_EN = 1 << 28;
    }
}

bitflags! {
    /// RXDCTL / TXDCTL register bits.
    #[derive(Debug, Clone, Copy)]
    pub struct Dctl: u32 {
        /// Queue Enable.
        const ENABLE = 1 << 25;
    }
}

bitflags! {
    /// RTTDCS register bits.
    #[derive(Debug, Clone, Copy)]
    pub struct Rttdcs: u32 {
        /// Arbiter Disable.
        const ARBDIS = 1 << 6;
    }
}

bitflags! {
    /// DMATXCTL register bits.
    #[derive(Debug, Clone, Copy)]
    pub struct DmaTxCtl: u32 {
        /// Transmit Enable.
        const TE = 1 << 0;
    }
}

bitflags! {
    /// AUTOC register bits.
    #[derive(Debug, Clone, Copy)]
    pub struct Autoc: u32 {
        /// Link Mode Select mask.
        const LMS_MASK = 0b111 << 13;
        /// 10G serial (KX4/KR backplane) link mode.
        const LMS_10G_SERIAL = 0b011 << 13;
        /// 10G PMA/PMD mask.
        const PMA_PMD_10G_MASK = 0b11 << 7;
        /// XAUI PMA/PMD.
        const PMA_PMD_10G_XAUI = 0b00 << 7;
        /// Restart autonegotiation.
        const AN_RESTART = 1 << 12;
    }
}

bitflags! {
    /// LINKS register bits.
    #[derive(Debug, Clone, Copy)]
    pub struct Links: u32 {
        /// Link Up.
        const UP = 1 << 30;
        /// Link speed mask (82599 encoding).
        const SPEED_MASK = 0b11 << 28;
        /// 100 Mbit/s.
        const SPEED_100M = 0b01 << 28;
        /// 1 Gbit/s.
        const SPEED_1G = 0b10 << 28;
        /// 10 Gbit/s.
        const SPEED_10G = 0b11 << 28;
    }
}

// ---------------------------------------------------------------------------
// Buffer-size magic constants (section 4.6.11.3.4)
// ---------------------------------------------------------------------------

/// Single receive packet buffer holding all traffic: 128 KB.
pub const RXPBSIZE_128KB: u32 = 0x0002_0000;
/// Single transmit packet buffer holding all traffic: 40 KB.
pub const TXPBSIZE_40KB: u32 = 0x0000_A000;

// ---------------------------------------------------------------------------
// Advanced descriptor command / status bits
// ---------------------------------------------------------------------------

/// Descriptor Done (write-back status).
pub const RXDADV_STAT_DD: u32 = 1 << 0;
/// End Of Packet (write-back status).
pub const RXDADV_STAT_EOP: u32 = 1 << 1;

/// End Of Packet (transmit command).
pub const TXDADV_DCMD_EOP: u32 = 1 << 24;
/// Report Status (transmit command).
pub const TXDADV_DCMD_RS: u32 = 1 << 27;
/// Insert FCS (transmit command).
pub const TXDADV_DCMD_IFCS: u32 = 1 << 25;
/// Descriptor Extension (advanced format marker).
pub const TXDADV_DCMD_DEXT: u32 = 1 << 29;
/// Advanced data descriptor type (bits 23:20 of cmd_type_len = 0x3).
pub const TXDADV_DTYP_DATA: u32 = 0x3 << 20;
/// Descriptor Done (transmit write-back status).
pub const TXDADV_STAT_DD: u32 = 1 << 0;
/// Shift of the payload length field in `olinfo_status`.
pub const TXDADV_PAYLEN_SHIFT: u32 = 14;

// ---------------------------------------------------------------------------
// Advanced descriptor layouts (16 bytes, two overlaid views)
// ---------------------------------------------------------------------------

/// Advanced RX descriptor, read format (posted to the NIC).
#[repr(C)]
#[derive(Clone, Copy)]
pub struct AdvRxDescRead {
    /// Physical address of the packet data buffer.
    pub pkt_addr: u64,
    /// Physical address of the header buffer (unused in one-buffer mode).
    pub hdr_addr: u64,
}

/// Advanced RX descriptor, write-back format (filled in by the NIC).
///
/// Datasheet section 7.1.6.1: the lower 8 bytes carry RSS/fragment-checksum
/// data this driver doesn't use, `status_error` sits at byte offset 8,
/// `length` at offset 12, VLAN tag at offset 14.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct AdvRxDescWb {
    _lower: u64,
    /// Status and error bits, including DD and EOP.
    pub status_error: u32,
    /// Length of the received packet.
    pub length: u16,
    _vlan: u16,
}

/// Advanced RX descriptor: the same 16 bytes viewed either as what the
/// driver posts to the NIC or what the NIC writes back on completion. Which
/// view is valid is decided entirely by the NIC via the DD bit, never by
/// software state, so this is a true hardware union rather than a checked
/// enum.
#[repr(C)]
pub union AdvRxDesc {
    /// Driver-written view: buffer addresses to receive into.
    pub read: AdvRxDescRead,
    /// NIC-written view: completion status once DD is set.
    pub wb: AdvRxDescWb,
}

/// Advanced TX descriptor, read format (posted to the NIC).
#[repr(C)]
#[derive(Clone, Copy)]
pub struct AdvTxDescRead {
    /// Physical address of the packet data buffer.
    pub buffer_addr: u64,
    /// Command bits (EOP/RS/IFCS/DEXT/DTYP) and packet length in bits 15:0.
    pub cmd_type_len: u32,
    /// Payload length (bits 31:14) and offload status.
    pub olinfo_status: u32,
}

/// Advanced TX descriptor, write-back format (filled in by the NIC).
#[repr(C)]
#[derive(Clone, Copy)]
pub struct AdvTxDescWb {
    _reserved: u64,
    _reserved2: u32,
    /// Status bits, including DD once the NIC has sent this descriptor.
    pub status: u32,
}

/// Advanced TX descriptor union, analogous to [`AdvRxDesc`].
#[repr(C)]
pub union AdvTxDesc {
    /// Driver-written view: buffer address, length, and command bits.
    pub read: AdvTxDescRead,
    /// NIC-written view: completion status once DD is set.
    pub wb: AdvTxDescWb,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::size_of;

    #[test]
    fn descriptors_are_sixteen_bytes() {
        assert_eq!(size_of::<AdvRxDesc>(), 16);
        assert_eq!(size_of::<AdvTxDesc>(), 16);
    }

    #[test]
    fn rx_writeback_fields_match_datasheet_offsets() {
        assert_eq!(core::mem::offset_of!(AdvRxDescWb, status_error), 8);
        assert_eq!(core::mem::offset_of!(AdvRxDescWb, length), 12);
    }

    #[test]
    fn queue_offset_formulas_split_at_64() {
        assert_eq!(rdbal(0), 0x01000);
        assert_eq!(rdbal(63), 0x01000 + 63 * 0x40);
        assert_eq!(rdbal(64), 0x0D000);
        assert_eq!(tdbal(0), 0x06000);
        assert_eq!(tdbal(5), 0x06000 + 5 * 0x40);
    }
}
