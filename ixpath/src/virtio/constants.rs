//! Legacy virtio-net PCI layout: config-space offsets, feature bits, and the
//! split-virtqueue wire structures.

/// Offset of the 32-bit host-features bitmap.
pub const VIRTIO_PCI_HOST_FEATURES: u64 = 0;
/// Offset of the 32-bit guest-features bitmap (driver writes its selection).
pub const VIRTIO_PCI_GUEST_FEATURES: u64 = 4;
/// Offset of the 32-bit queue address, in units of 4096-byte pages.
pub const VIRTIO_PCI_QUEUE_PFN: u64 = 8;
/// Offset of the 16-bit queue size of the currently selected queue.
pub const VIRTIO_PCI_QUEUE_NUM: u64 = 12;
/// Offset of the 16-bit queue selector.
pub const VIRTIO_PCI_QUEUE_SEL: u64 = 14;
/// Offset of the 16-bit queue notify (doorbell) register.
pub const VIRTIO_PCI_QUEUE_NOTIFY: u64 = 16;
/// Offset of the 8-bit device status register.
pub const VIRTIO_PCI_STATUS: u64 = 18;
/// Offset of the 8-bit interrupt status register.
pub const VIRTIO_PCI_ISR: u64 = 19;

/// Shift applied to a guest virtual page number before writing `QUEUE_PFN`.
pub const VIRTIO_PCI_QUEUE_ADDR_SHIFT: u32 = 12;

/// Status byte: reset the device.
pub const VIRTIO_CONFIG_STATUS_RESET: u8 = 0x00;
/// Status byte: the driver has noticed the device.
pub const VIRTIO_CONFIG_STATUS_ACK: u8 = 0x01;
/// Status byte: the driver knows how to drive the device.
pub const VIRTIO_CONFIG_STATUS_DRIVER: u8 = 0x02;
/// Status byte: the driver is ready to drive the device.
pub const VIRTIO_CONFIG_STATUS_DRIVER_OK: u8 = 0x04;
/// Status byte: feature negotiation is complete (modern spec only; legacy
/// devices never require this bit, but it's harmless to not set it).
pub const VIRTIO_CONFIG_STATUS_FEATURES_OK: u8 = 0x08;
/// Status byte: something went wrong and the driver gave up.
pub const VIRTIO_CONFIG_STATUS_FAILED: u8 = 0x80;

/// Descriptor continues via `next`.
pub const VIRTQ_DESC_F_NEXT: u16 = 1;
/// Descriptor is device-write-only (as opposed to device-read-only).
pub const VIRTQ_DESC_F_WRITE: u16 = 2;
/// Descriptor refers to an indirect descriptor table (unused here).
pub const VIRTQ_DESC_F_INDIRECT: u16 = 4;

/// Device provides checksum offload capability.
pub const VIRTIO_NET_F_CSUM: u32 = 1 << 0;
/// Driver can accept packets with partial checksums from the device.
pub const VIRTIO_NET_F_GUEST_CSUM: u32 = 1 << 1;
/// Device supports the control queue's `VIRTIO_NET_CTRL_RX` class.
pub const VIRTIO_NET_F_CTRL_RX: u32 = 1 << 18;
/// Device has a control queue.
pub const VIRTIO_NET_F_CTRL_VQ: u32 = 1 << 17;

/// Control-queue command class: receive filtering.
pub const VIRTIO_NET_CTRL_RX: u8 = 0;
/// Control-queue command: toggle promiscuous mode.
pub const VIRTIO_NET_CTRL_RX_PROMISC: u8 = 0;

/// Control-queue command succeeded.
pub const VIRTIO_NET_OK: u8 = 0;
/// Control-queue command failed.
pub const VIRTIO_NET_ERR: u8 = 1;

/// The legacy virtio-net per-packet header, prefixed to every buffer handed
/// to the device on both rx and tx.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct VirtioNetHdr {
    pub flags: u8,
    pub gso_type: u8,
    pub hdr_len: u16,
    pub gso_size: u16,
    pub csum_start: u16,
    pub csum_offset: u16,
}

/// One entry of the shared descriptor table.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct VirtqDesc {
    pub addr: u64,
    pub len: u32,
    pub flags: u16,
    pub next: u16,
}

/// Fixed header fields of the available ring; `ring[qsize]` follows
/// immediately in memory (a C flexible array member, not representable as a
/// Rust field, so callers compute the ring's address by pointer arithmetic).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct VirtqAvailHeader {
    pub flags: u16,
    pub idx: u16,
}

/// One entry of the used ring.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct VirtqUsedElem {
    pub id: u32,
    pub len: u32,
}

/// Fixed header fields of the used ring; `ring[qsize]` of [`VirtqUsedElem`]
/// follows immediately in memory.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct VirtqUsedHeader {
    pub flags: u16,
    pub idx: u16,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::size_of;

    #[test]
    fn static_type_sizes() {
        assert_eq!(size_of::<VirtioNetHdr>(), 10);
        assert_eq!(size_of::<VirtqDesc>(), 16);
        assert_eq!(size_of::<VirtqAvailHeader>(), 4);
        assert_eq!(size_of::<VirtqUsedElem>(), 8);
        assert_eq!(size_of::<VirtqUsedHeader>(), 4);
    }
}
