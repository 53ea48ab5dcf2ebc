//! Legacy virtio-net backend: PCI I/O-port configuration, split virtqueues,
//! and the control-queue commands used to toggle promiscuous mode.

pub mod constants;
mod queue;

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs::File;
use std::rc::Rc;

use crate::error::IxyError;
use crate::memory::{self, Mempool, PacketBuffer};
use crate::pci;
use crate::stats::DeviceStats;
use crate::Device;

use constants::*;
use queue::Virtqueue;

const DRIVER_NAME: &str = "virtio";

const QUEUE_RX: u16 = 0;
const QUEUE_TX: u16 = 1;
const QUEUE_CTRL: u16 = 2;

const VIRTIO_NET_HDR_SIZE: usize = std::mem::size_of::<VirtioNetHdr>();

/// A legacy virtio-net device: the raw BAR0 resource handle plus its three
/// split virtqueues and the buffer pools feeding rx and tx.
pub struct VirtioDevice {
    pci_addr: String,
    bar0: File,
    rx_queue: Virtqueue,
    tx_queue: Virtqueue,
    ctrl_queue: Virtqueue,
    rx_pool: Rc<RefCell<Mempool>>,
    tx_pool: Rc<RefCell<Mempool>>,
    rx_bufs: Vec<Option<PacketBuffer>>,
    tx_inflight: VecDeque<(u16, usize, PacketBuffer, PacketBuffer)>,
    reported: DeviceStats,
    current: DeviceStats,
}

impl VirtioDevice {
    /// Attaches to the legacy virtio-net device at `pci_addr`. `num_rx_descs`
    /// and `num_tx_descs` (both mempool sizes) are chosen independent of the
    /// device's own reported virtqueue sizes, which are read during setup.
    pub fn init(pci_addr: &str) -> Result<Self, IxyError> {
        let (addr, _len) = pci::map_resource(pci_addr)?;
        let _ = addr; // BAR0 here is legacy I/O-port space; accessed via pread/pwrite below.
        let bar0 = pci::open_resource(pci_addr, "resource0")?;

        let mut dev = VirtioDevice {
            pci_addr: pci_addr.to_string(),
            bar0,
            rx_queue: Virtqueue::allocate(1)?,
            tx_queue: Virtqueue::allocate(1)?,
            ctrl_queue: Virtqueue::allocate(1)?,
            rx_pool: Mempool::allocate(4096, memory::DEFAULT_BUF_SIZE)?,
            tx_pool: Mempool::allocate(4096, memory::DEFAULT_BUF_SIZE)?,
            rx_bufs: Vec::new(),
            tx_inflight: VecDeque::new(),
            reported: DeviceStats::default(),
            current: DeviceStats::default(),
        };

        dev.reset()?;
        dev.negotiate_features()?;
        dev.setup_queue(QUEUE_RX)?;
        dev.setup_queue(QUEUE_TX)?;
        dev.setup_queue(QUEUE_CTRL)?;
        dev.post_rx_buffers()?;
        dev.write_status(VIRTIO_CONFIG_STATUS_DRIVER_OK)?;
        dev.set_promisc(true);

        Ok(dev)
    }

    fn write_status(&self, status: u8) -> Result<(), IxyError> {
        Ok(pci::write_io8(&self.bar0, status, VIRTIO_PCI_STATUS)?)
    }

    fn reset(&mut self) -> Result<(), IxyError> {
        log::info!("resetting virtio device {}", self.pci_addr);
        self.write_status(VIRTIO_CONFIG_STATUS_RESET)?;
        self.write_status(VIRTIO_CONFIG_STATUS_ACK)?;
        self.write_status(VIRTIO_CONFIG_STATUS_ACK | VIRTIO_CONFIG_STATUS_DRIVER)?;
        Ok(())
    }

    fn negotiate_features(&self) -> Result<(), IxyError> {
        let host_features = pci::read_io32(&self.bar0, VIRTIO_PCI_HOST_FEATURES)?;
        // Legacy virtio-net: accept only what this driver actually implements.
        let wanted =
            VIRTIO_NET_F_CSUM | VIRTIO_NET_F_GUEST_CSUM | VIRTIO_NET_F_CTRL_VQ | VIRTIO_NET_F_CTRL_RX;
        let guest_features = host_features & wanted;
        pci::write_io32(&self.bar0, guest_features, VIRTIO_PCI_GUEST_FEATURES)?;
        Ok(())
    }

    fn setup_queue(&mut self, index: u16) -> Result<(), IxyError> {
        pci::write_io16(&self.bar0, index, VIRTIO_PCI_QUEUE_SEL)?;
        let qsize = pci::read_io16(&self.bar0, VIRTIO_PCI_QUEUE_NUM)?;
        if qsize == 0 {
            return Err(IxyError::UnsupportedFeature(format!(
                "virtio queue {index} reports size 0"
            )));
        }

        let vq = Virtqueue::allocate(qsize)?;
        pci::write_io32(&self.bar0, vq.pfn(), VIRTIO_PCI_QUEUE_PFN)?;

        match index {
            QUEUE_RX => self.rx_queue = vq,
            QUEUE_TX => self.tx_queue = vq,
            QUEUE_CTRL => self.ctrl_queue = vq,
            _ => unreachable!(),
        }
        Ok(())
    }

    fn post_rx_buffers(&mut self) -> Result<(), IxyError> {
        let qsize = self.rx_queue.queue_size();
        self.rx_bufs.clear();
        self.rx_bufs.resize_with(qsize as usize, || None);

        for i in 0..qsize {
            let buf = memory::alloc_pkt(&self.rx_pool, memory::DEFAULT_BUF_SIZE - memory::PACKET_HEADROOM)
                .ok_or(IxyError::MempoolExhausted {
                    requested: qsize as usize,
                    available: i as usize,
                })?;

            // The header sits immediately before the payload, inside the
            // buffer's headroom, so one descriptor covers header and data.
            let addr = buf.phys_addr() - VIRTIO_NET_HDR_SIZE as u64;
            let len = (memory::DEFAULT_BUF_SIZE - memory::PACKET_HEADROOM + VIRTIO_NET_HDR_SIZE) as u32;
            self.rx_queue.set_desc(i, addr, len, VIRTQ_DESC_F_WRITE, 0);
            self.rx_bufs[i as usize] = Some(buf);
        }

        self.rx_queue.set_avail_idx(qsize);
        self.notify_queue(QUEUE_RX)?;
        Ok(())
    }

    fn notify_queue(&self, queue_index: u16) -> Result<(), IxyError> {
        Ok(pci::write_io16(&self.bar0, queue_index, VIRTIO_PCI_QUEUE_NOTIFY)?)
    }

    fn set_promisc(&mut self, enabled: bool) {
        if let Err(e) = self.send_command(VIRTIO_NET_CTRL_RX, VIRTIO_NET_CTRL_RX_PROMISC, &[enabled as u8]) {
            log::warn!("failed to set promiscuous mode: {e}");
        }
    }

    /// Sends a three-descriptor control-queue command: a read-only class
    /// header, a read-only payload, and a device-written one-byte ack.
    fn send_command(&mut self, class: u8, cmd: u8, payload: &[u8]) -> Result<(), IxyError> {
        let header_buf = memory::alloc_pkt(&self.tx_pool, 2).ok_or(IxyError::MempoolExhausted {
            requested: 1,
            available: 0,
        })?;
        let mut payload_buf = memory::alloc_pkt(&self.tx_pool, payload.len())
            .ok_or(IxyError::MempoolExhausted { requested: 1, available: 0 })?;
        let mut ack_buf = memory::alloc_pkt(&self.tx_pool, 1).ok_or(IxyError::MempoolExhausted {
            requested: 1,
            available: 0,
        })?;

        unsafe {
            let h = header_buf.virt_addr();
            *h = class;
            *h.add(1) = cmd;
        }
        payload_buf.copy_from_slice(payload);
        ack_buf[0] = 0xff;

        let head = self
            .ctrl_queue
            .alloc_chain(3)
            .ok_or(IxyError::UnsupportedFeature("control queue full".into()))?;
        let second = self.ctrl_queue.descriptor(head).next;
        let third = self.ctrl_queue.descriptor(second).next;

        self.ctrl_queue
            .set_desc(head, header_buf.phys_addr(), 2, VIRTQ_DESC_F_NEXT, second);
        self.ctrl_queue.set_desc(
            second,
            payload_buf.phys_addr(),
            payload.len() as u32,
            VIRTQ_DESC_F_NEXT,
            third,
        );
        self.ctrl_queue.set_desc(third, ack_buf.phys_addr(), 1, VIRTQ_DESC_F_WRITE, 0);

        self.ctrl_queue.publish_avail(head);
        self.notify_queue(QUEUE_CTRL)?;

        // The control queue completes synchronously from the driver's point
        // of view in every real hypervisor implementation; poll briefly.
        let mut spins = 0;
        loop {
            if let Some((id, _len)) = self.ctrl_queue.pop_used() {
                debug_assert_eq!(id as u16, head);
                self.ctrl_queue.free_chain(head, 3);
                break;
            }
            spins += 1;
            if spins > 1_000_000 {
                return Err(IxyError::UnsupportedFeature(
                    "control queue command timed out".into(),
                ));
            }
        }

        if ack_buf[0] != VIRTIO_NET_OK {
            return Err(IxyError::UnsupportedFeature(format!(
                "control queue command rejected (status {})",
                ack_buf[0]
            )));
        }
        Ok(())
    }
}

impl Device for VirtioDevice {
    fn get_name(&self) -> &str {
        DRIVER_NAME
    }

    fn rx_batch(&mut self, queue_id: u16, buffer: &mut VecDeque<PacketBuffer>, max: usize) -> usize {
        debug_assert_eq!(queue_id, QUEUE_RX);
        let mut received = 0;

        for _ in 0..max {
            let (id, len) = match self.rx_queue.pop_used() {
                Some(v) => v,
                None => break,
            };

            let new_buf = match memory::alloc_pkt(&self.rx_pool, memory::DEFAULT_BUF_SIZE - memory::PACKET_HEADROOM) {
                Some(b) => b,
                None => crate::error::fatal("rx mempool exhausted during refill, application is leaking buffers"),
            };
            let addr = new_buf.phys_addr() - VIRTIO_NET_HDR_SIZE as u64;
            let buf_len = (memory::DEFAULT_BUF_SIZE - memory::PACKET_HEADROOM + VIRTIO_NET_HDR_SIZE) as u32;
            self.rx_queue
                .set_desc(id as u16, addr, buf_len, VIRTQ_DESC_F_WRITE, 0);

            let mut old = std::mem::replace(&mut self.rx_bufs[id as usize], Some(new_buf))
                .expect("descriptor slot had no posted buffer");
            let payload_len = (len as usize).saturating_sub(VIRTIO_NET_HDR_SIZE);
            old.len = payload_len;

            self.current.rx_pkts = self.current.rx_pkts.wrapping_add(1);
            self.current.rx_bytes = self.current.rx_bytes.wrapping_add(payload_len as u64);

            buffer.push_back(old);
            self.rx_queue.publish_avail(id as u16);
            received += 1;
        }

        if received > 0 {
            let _ = self.notify_queue(QUEUE_RX);
        }

        received
    }

    fn tx_batch(&mut self, queue_id: u16, packets: &mut VecDeque<PacketBuffer>) -> usize {
        debug_assert_eq!(queue_id, QUEUE_TX);

        while !self.tx_inflight.is_empty() {
            if self.tx_queue.pop_used().is_none() {
                break;
            }
            // Dropping the tuple returns both the header and payload buffers
            // to their pool; the device only ever completes chains in order.
            let (head, descs, _hdr, _payload) = self.tx_inflight.pop_front().unwrap();
            self.tx_queue.free_chain(head, descs);
        }

        let mut sent = 0;
        while let Some(packet) = packets.pop_front() {
            let hdr_buf = match memory::alloc_pkt(&self.tx_pool, VIRTIO_NET_HDR_SIZE) {
                Some(b) => b,
                None => {
                    packets.push_front(packet);
                    break;
                }
            };
            unsafe {
                std::ptr::write_bytes(hdr_buf.virt_addr(), 0, VIRTIO_NET_HDR_SIZE);
            }

            let head = match self.tx_queue.alloc_chain(2) {
                Some(h) => h,
                None => {
                    packets.push_front(packet);
                    break;
                }
            };
            let second = self.tx_queue.descriptor(head).next;

            self.tx_queue.set_desc(
                head,
                hdr_buf.phys_addr(),
                VIRTIO_NET_HDR_SIZE as u32,
                VIRTQ_DESC_F_NEXT,
                second,
            );
            self.tx_queue
                .set_desc(second, packet.phys_addr(), packet.len as u32, 0, 0);

            self.current.tx_pkts = self.current.tx_pkts.wrapping_add(1);
            self.current.tx_bytes = self.current.tx_bytes.wrapping_add(packet.len as u64);

            self.tx_queue.publish_avail(head);
            self.tx_inflight.push_back((head, 2, hdr_buf, packet));
            sent += 1;
        }

        if sent > 0 {
            let _ = self.notify_queue(QUEUE_TX);
        }

        sent
    }

    fn read_stats(&mut self, stats: &mut DeviceStats) {
        stats.rx_pkts = stats.rx_pkts.wrapping_add(self.current.rx_pkts.wrapping_sub(self.reported.rx_pkts));
        stats.tx_pkts = stats.tx_pkts.wrapping_add(self.current.tx_pkts.wrapping_sub(self.reported.tx_pkts));
        stats.rx_bytes = stats
            .rx_bytes
            .wrapping_add(self.current.rx_bytes.wrapping_sub(self.reported.rx_bytes));
        stats.tx_bytes = stats
            .tx_bytes
            .wrapping_add(self.current.tx_bytes.wrapping_sub(self.reported.tx_bytes));
        self.reported = self.current;
    }

    fn link_speed(&self) -> u16 {
        // The legacy virtio-net device has no link-speed register; a
        // paravirtualized link is either up or doesn't exist, so report a
        // nominal 1 Gbit/s once the device has completed setup.
        1000
    }
}
