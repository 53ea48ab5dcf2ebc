//! Intel 82599 (ixgbe) 10GbE controller driver.
//!
//! Implements the controller reset/init sequence (datasheet section 4.6)
//! and the advanced-descriptor receive/transmit hot paths (section 7.1/7.2)
//! on top of [`crate::mmio::Mmio`] and [`crate::memory`].

pub mod regs;

use std::collections::VecDeque;
use std::mem;
use std::ptr;
use std::rc::Rc;
use std::cell::RefCell;
use std::time::{Duration, Instant};

use crate::error::{fatal, IxyError};
use crate::memory::{self, Dma, Mempool, PacketBuffer};
use crate::mmio::Mmio;
use crate::pci;
use crate::stats::DeviceStats;
use crate::Device;

use regs::{AdvRxDesc, AdvTxDesc};

const DRIVER_NAME: &str = "ixgbe";

const NUM_RX_QUEUE_ENTRIES: usize = 512;
const NUM_TX_QUEUE_ENTRIES: usize = 512;
const TX_CLEAN_BATCH: usize = 32;

fn wrap_ring(index: usize, ring_size: usize) -> usize {
    (index + 1) & (ring_size - 1)
}

struct RxQueue {
    descriptors: Dma<AdvRxDesc>,
    num_descriptors: usize,
    pool: Rc<RefCell<Mempool>>,
    bufs_in_use: Vec<Option<PacketBuffer>>,
    rx_index: usize,
}

struct TxQueue {
    descriptors: Dma<AdvTxDesc>,
    num_descriptors: usize,
    bufs_in_use: VecDeque<PacketBuffer>,
    clean_index: usize,
    tx_index: usize,
}

/// A fully initialized 82599 device: MMIO register access plus its receive
/// and transmit queues.
pub struct IxgbeDevice {
    pci_addr: String,
    mmio: Mmio,
    rx_queues: Vec<RxQueue>,
    tx_queues: Vec<TxQueue>,
}

impl IxgbeDevice {
    /// Attaches to the NIC at `pci_addr` and brings up `num_rx_queues`
    /// receive queues and `num_tx_queues` transmit queues.
    pub fn init(pci_addr: &str, num_rx_queues: u16, num_tx_queues: u16) -> Result<Self, IxyError> {
        if unsafe { libc::getuid() } != 0 {
            log::warn!("not running as root, this will probably fail");
        }

        let (addr, len) = pci::map_resource(pci_addr)?;
        let mmio = Mmio::new(addr, len);

        let mut dev = IxgbeDevice {
            pci_addr: pci_addr.to_string(),
            mmio,
            rx_queues: Vec::with_capacity(num_rx_queues as usize),
            tx_queues: Vec::with_capacity(num_tx_queues as usize),
        };

        dev.reset_and_init(num_rx_queues, num_tx_queues)?;
        Ok(dev)
    }

    fn reset_and_init(&mut self, num_rx_queues: u16, num_tx_queues: u16) -> Result<(), IxyError> {
        log::info!("resetting device {}", self.pci_addr);

        // section 4.6.3.1 - disable all interrupts
        self.mmio.write32(regs::EIMC, 0x7fff_ffff);

        // section 4.6.3.2 - global reset
        self.mmio.write32(regs::CTRL, regs::Ctrl::RST_MASK);
        self.mmio.wait_clear32(regs::CTRL, regs::Ctrl::RST_MASK);
        std::thread::sleep(Duration::from_millis(10));

        // disable interrupts again, they come back enabled after reset
        self.mmio.write32(regs::EIMC, 0x7fff_ffff);

        log::info!("initializing device {}", self.pci_addr);

        // section 4.6.3 - wait for EEPROM auto-read and DMA init
        self.mmio.wait_set32(regs::EEC, regs::Eec::ARD.bits());
        self.mmio
            .wait_set32(regs::RDRXCTL, regs::RdrxCtl::DMAIDONE.bits());

        // section 4.6.4 - initialize link (autonegotiation)
        self.init_link();

        // section 4.6.5 - reset-on-read stat counters, read once to clear
        self.reset_stats();

        // section 4.6.7 / 4.6.8
        self.init_rx(num_rx_queues)?;
        self.init_tx(num_tx_queues)?;

        for i in 0..num_rx_queues {
            self.start_rx_queue(i)?;
        }
        for i in 0..num_tx_queues {
            self.start_tx_queue(i)?;
        }

        // enable promisc mode by default, matching the reference driver's
        // "make testing easier" stance
        self.set_promisc(true);

        self.wait_for_link();

        Ok(())
    }

    fn init_rx(&mut self, num_rx_queues: u16) -> Result<(), IxyError> {
        self.mmio
            .clear_flags32(regs::RXCTRL, regs::RxCtrl::RXEN.bits());

        // section 4.6.11.3.4 - allocate all queues and traffic to PB0
        self.mmio
            .write32(regs::rxpbsize(0), regs::RXPBSIZE_128KB);
        for i in 1..8 {
            self.mmio.write32(regs::rxpbsize(i), 0);
        }

        self.mmio
            .set_flags32(regs::HLREG0, regs::Hlreg0::RXCRCSTRP.bits());
        self.mmio
            .set_flags32(regs::RDRXCTL, regs::RdrxCtl::CRCSTRIP.bits());
        self.mmio
            .set_flags32(regs::FCTRL, regs::FCtrl::BAM.bits());

        for i in 0..num_rx_queues {
            log::debug!("initializing rx queue {i}");
            let q = u32::from(i);

            let srrctl = self.mmio.read32(regs::srrctl(q));
            self.mmio.write32(
                regs::srrctl(q),
                (srrctl & !regs::Srrctl::DESCTYPE_MASK.bits())
                    | regs::Srrctl::DESCTYPE_ADV_ONEBUF.bits(),
            );
            self.mmio
                .set_flags32(regs::srrctl(q), regs::Srrctl::DROP_EN.bits());

            let ring_size_bytes = NUM_RX_QUEUE_ENTRIES * mem::size_of::<AdvRxDesc>();
            let dma: Dma<AdvRxDesc> = Dma::allocate(ring_size_bytes, true)?;
            unsafe {
                ptr::write_bytes(dma.virt as *mut u8, 0xff, ring_size_bytes);
            }

            self.mmio
                .write32(regs::rdbal(q), (dma.phys & 0xffff_ffff) as u32);
            self.mmio.write32(regs::rdbah(q), (dma.phys >> 32) as u32);
            self.mmio.write32(regs::rdlen(q), ring_size_bytes as u32);

            self.mmio.write32(regs::rdh(q), 0);
            self.mmio.write32(regs::rdt(q), 0);

            let mempool_size = (NUM_RX_QUEUE_ENTRIES + NUM_TX_QUEUE_ENTRIES).max(4096);
            let pool = Mempool::allocate(mempool_size, memory::DEFAULT_BUF_SIZE)?;

            self.rx_queues.push(RxQueue {
                descriptors: dma,
                num_descriptors: NUM_RX_QUEUE_ENTRIES,
                pool,
                bufs_in_use: Vec::new(),
                rx_index: 0,
            });
        }

        // last sentence of section 4.6.7 - set some magic bits
        self.mmio
            .set_flags32(regs::CTRL_EXT, regs::CtrlExt::NS_DIS.bits());

        // probably a broken feature, this flag is initialized with 1 but has to be set to 0
        for i in 0..num_rx_queues {
            self.mmio.clear_flags32(regs::dca_rxctrl(u32::from(i)), 1 << 12);
        }

        self.mmio.set_flags32(regs::RXCTRL, regs::RxCtrl::RXEN.bits());

        Ok(())
    }

    fn init_tx(&mut self, num_tx_queues: u16) -> Result<(), IxyError> {
        self.mmio.set_flags32(
            regs::HLREG0,
            regs::Hlreg0::TXCRCEN.bits() | regs::Hlreg0::TXPADEN.bits(),
        );

        self.mmio.write32(regs::txpbsize(0), regs::TXPBSIZE_40KB);
        for i in 1..8 {
            self.mmio.write32(regs::txpbsize(i), 0);
        }

        self.mmio.write32(regs::DTXMXSZRQ, 0xffff);
        self.mmio
            .clear_flags32(regs::RTTDCS, regs::Rttdcs::ARBDIS.bits());

        for i in 0..num_tx_queues {
            log::debug!("initializing tx queue {i}");
            let q = u32::from(i);

            let ring_size_bytes = NUM_TX_QUEUE_ENTRIES * mem::size_of::<AdvTxDesc>();
            let dma: Dma<AdvTxDesc> = Dma::allocate(ring_size_bytes, true)?;
            unsafe {
                ptr::write_bytes(dma.virt as *mut u8, 0xff, ring_size_bytes);
            }

            self.mmio
                .write32(regs::tdbal(q), (dma.phys & 0xffff_ffff) as u32);
            self.mmio.write32(regs::tdbah(q), (dma.phys >> 32) as u32);
            self.mmio.write32(regs::tdlen(q), ring_size_bytes as u32);

            // descriptor write-back thresholds; defaults taken from DPDK,
            // see datasheet 7.2.3.4.1 / 7.2.3.5 for the tuning rationale
            let mut txdctl = self.mmio.read32(regs::txdctl(q));
            txdctl &= !(0x3F | (0x3F << 8) | (0x3F << 16));
            txdctl |= 36 | (8 << 8) | (4 << 16);
            self.mmio.write32(regs::txdctl(q), txdctl);

            self.tx_queues.push(TxQueue {
                descriptors: dma,
                num_descriptors: NUM_TX_QUEUE_ENTRIES,
                bufs_in_use: VecDeque::with_capacity(NUM_TX_QUEUE_ENTRIES),
                clean_index: 0,
                tx_index: 0,
            });
        }

        self.mmio
            .set_flags32(regs::DMATXCTL, regs::DmaTxCtl::TE.bits());

        Ok(())
    }

    fn start_rx_queue(&mut self, queue_id: u16) -> Result<(), IxyError> {
        log::debug!("starting rx queue {queue_id}");

        let num_descriptors = {
            let queue = &mut self.rx_queues[queue_id as usize];

            if queue.num_descriptors & (queue.num_descriptors - 1) != 0 {
                return Err(IxyError::NotPowerOfTwo {
                    what: "rx",
                    size: queue.num_descriptors,
                });
            }

            queue.bufs_in_use.clear();
            queue.bufs_in_use.resize_with(queue.num_descriptors, || None);

            for i in 0..queue.num_descriptors {
                let buf = memory::alloc_pkt(&queue.pool, memory::DEFAULT_BUF_SIZE - memory::PACKET_HEADROOM)
                    .ok_or(IxyError::MempoolExhausted {
                        requested: queue.num_descriptors,
                        available: i,
                    })?;

                unsafe {
                    let desc = queue.descriptors.virt.add(i);
                    ptr::write_volatile(&mut (*desc).read.pkt_addr as *mut u64, buf.phys_addr());
                    ptr::write_volatile(&mut (*desc).read.hdr_addr as *mut u64, 0);
                }

                queue.bufs_in_use[i] = Some(buf);
            }

            queue.num_descriptors
        };

        let q = u32::from(queue_id);
        self.mmio.set_flags32(regs::rxdctl(q), regs::Dctl::ENABLE.bits());
        self.mmio.wait_set32(regs::rxdctl(q), regs::Dctl::ENABLE.bits());

        self.mmio.write32(regs::rdh(q), 0);
        self.mmio.write32(regs::rdt(q), (num_descriptors - 1) as u32);

        Ok(())
    }

    fn start_tx_queue(&mut self, queue_id: u16) -> Result<(), IxyError> {
        log::debug!("starting tx queue {queue_id}");
        let queue = &self.tx_queues[queue_id as usize];
        if queue.num_descriptors & (queue.num_descriptors - 1) != 0 {
            return Err(IxyError::NotPowerOfTwo {
                what: "tx",
                size: queue.num_descriptors,
            });
        }

        let q = u32::from(queue_id);
        self.mmio.write32(regs::tdh(q), 0);
        self.mmio.write32(regs::tdt(q), 0);

        self.mmio.set_flags32(regs::txdctl(q), regs::Dctl::ENABLE.bits());
        self.mmio.wait_set32(regs::txdctl(q), regs::Dctl::ENABLE.bits());

        Ok(())
    }

    fn init_link(&self) {
        let autoc = self.mmio.read32(regs::AUTOC);
        self.mmio.write32(
            regs::AUTOC,
            (autoc & !regs::Autoc::LMS_MASK.bits()) | regs::Autoc::LMS_10G_SERIAL.bits(),
        );
        let autoc = self.mmio.read32(regs::AUTOC);
        self.mmio.write32(
            regs::AUTOC,
            (autoc & !regs::Autoc::PMA_PMD_10G_MASK.bits()) | regs::Autoc::PMA_PMD_10G_XAUI.bits(),
        );
        self.mmio
            .set_flags32(regs::AUTOC, regs::Autoc::AN_RESTART.bits());
    }

    fn wait_for_link(&self) {
        log::info!("waiting for link");
        let start = Instant::now();
        let mut speed = self.link_speed();
        while speed == 0 && start.elapsed().as_secs() < 10 {
            std::thread::sleep(Duration::from_millis(100));
            speed = self.link_speed();
        }
        log::info!("link speed is {} Mbit/s", self.link_speed());
    }

    fn set_promisc(&self, enabled: bool) {
        let mask = regs::FCtrl::MPE.bits() | regs::FCtrl::UPE.bits();
        if enabled {
            log::info!("enabling promiscuous mode");
            self.mmio.set_flags32(regs::FCTRL, mask);
        } else {
            log::info!("disabling promiscuous mode");
            self.mmio.clear_flags32(regs::FCTRL, mask);
        }
    }

    fn reset_stats(&self) {
        self.mmio.read32(regs::GPRC);
        self.mmio.read32(regs::GPTC);
        self.mmio.read32(regs::GORCL);
        self.mmio.read32(regs::GORCH);
        self.mmio.read32(regs::GOTCL);
        self.mmio.read32(regs::GOTCH);
    }

    fn clean_tx_queue(queue: &mut TxQueue) {
        let mut clean_index = queue.clean_index;
        let cur_index = queue.tx_index;

        loop {
            let mut cleanable = cur_index as i64 - clean_index as i64;
            if cleanable < 0 {
                cleanable += queue.num_descriptors as i64;
            }
            if cleanable < TX_CLEAN_BATCH as i64 {
                break;
            }

            let mut cleanup_to = clean_index + TX_CLEAN_BATCH - 1;
            if cleanup_to >= queue.num_descriptors {
                cleanup_to -= queue.num_descriptors;
            }

            let status = unsafe {
                ptr::read_volatile(&(*queue.descriptors.virt.add(cleanup_to)).wb.status as *const u32)
            };

            if status & regs::TXDADV_STAT_DD == 0 {
                break;
            }

            // Dropping these PacketBuffers returns them to their mempool.
            queue.bufs_in_use.drain(..TX_CLEAN_BATCH.min(queue.bufs_in_use.len()));
            clean_index = wrap_ring(cleanup_to, queue.num_descriptors);
        }

        queue.clean_index = clean_index;
    }
}

impl Device for IxgbeDevice {
    fn get_name(&self) -> &str {
        DRIVER_NAME
    }

    fn rx_batch(&mut self, queue_id: u16, buffer: &mut VecDeque<PacketBuffer>, max: usize) -> usize {
        let queue = &mut self.rx_queues[queue_id as usize];
        let mut rx_index = queue.rx_index;
        let mut last_rx_index = rx_index;
        let mut received = 0;

        for i in 0..max {
            let desc = unsafe { queue.descriptors.virt.add(rx_index) };
            let status = unsafe { ptr::read_volatile(&(*desc).wb.status_error as *const u32) };

            if status & regs::RXDADV_STAT_DD == 0 {
                break;
            }
            if status & regs::RXDADV_STAT_EOP == 0 {
                fatal("received descriptor without EOP bit set: increase buffer size or decrease MTU");
            }

            let length = unsafe { ptr::read_volatile(&(*desc).wb.length as *const u16) };

            let new_buf = match memory::alloc_pkt(&queue.pool, memory::DEFAULT_BUF_SIZE - memory::PACKET_HEADROOM) {
                Some(b) => b,
                None => fatal("rx mempool exhausted during refill, application is leaking buffers"),
            };

            unsafe {
                ptr::write_volatile(&mut (*desc).read.pkt_addr as *mut u64, new_buf.phys_addr());
                ptr::write_volatile(&mut (*desc).read.hdr_addr as *mut u64, 0);
            }

            let mut old_buf = mem::replace(&mut queue.bufs_in_use[rx_index], Some(new_buf))
                .expect("descriptor slot had no posted buffer");
            old_buf.len = length as usize;
            buffer.push_back(old_buf);

            last_rx_index = rx_index;
            rx_index = wrap_ring(rx_index, queue.num_descriptors);
            received = i + 1;
        }

        if received > 0 {
            let q = u32::from(queue_id);
            self.mmio.write32(regs::rdt(q), last_rx_index as u32);
            self.rx_queues[queue_id as usize].rx_index = rx_index;
        }

        received
    }

    fn tx_batch(&mut self, queue_id: u16, packets: &mut VecDeque<PacketBuffer>) -> usize {
        let queue = &mut self.tx_queues[queue_id as usize];
        Self::clean_tx_queue(queue);

        let mut cur_index = queue.tx_index;
        let mut sent = 0;

        while let Some(packet) = packets.pop_front() {
            let next_index = wrap_ring(cur_index, queue.num_descriptors);
            if next_index == queue.clean_index {
                packets.push_front(packet);
                break;
            }

            unsafe {
                let desc = queue.descriptors.virt.add(cur_index);
                ptr::write_volatile(&mut (*desc).read.buffer_addr as *mut u64, packet.phys_addr());
                ptr::write_volatile(
                    &mut (*desc).read.cmd_type_len as *mut u32,
                    regs::TXDADV_DCMD_EOP
                        | regs::TXDADV_DCMD_RS
                        | regs::TXDADV_DCMD_IFCS
                        | regs::TXDADV_DCMD_DEXT
                        | regs::TXDADV_DTYP_DATA
                        | packet.len as u32,
                );
                ptr::write_volatile(
                    &mut (*desc).read.olinfo_status as *mut u32,
                    (packet.len as u32) << regs::TXDADV_PAYLEN_SHIFT,
                );
            }

            queue.bufs_in_use.push_back(packet);
            queue.tx_index = next_index;
            cur_index = next_index;
            sent += 1;
        }

        if sent > 0 {
            self.mmio.write32(regs::tdt(u32::from(queue_id)), queue.tx_index as u32);
        }

        sent
    }

    fn read_stats(&mut self, stats: &mut DeviceStats) {
        let rx_pkts = u64::from(self.mmio.read32(regs::GPRC));
        let tx_pkts = u64::from(self.mmio.read32(regs::GPTC));
        let rx_bytes = u64::from(self.mmio.read32(regs::GORCL))
            + (u64::from(self.mmio.read32(regs::GORCH)) << 32);
        let tx_bytes = u64::from(self.mmio.read32(regs::GOTCL))
            + (u64::from(self.mmio.read32(regs::GOTCH)) << 32);

        stats.rx_pkts += rx_pkts;
        stats.tx_pkts += tx_pkts;
        stats.rx_bytes += rx_bytes;
        stats.tx_bytes += tx_bytes;
    }

    fn link_speed(&self) -> u16 {
        let links = self.mmio.read32(regs::LINKS);
        if links & regs::Links::UP.bits() == 0 {
            return 0;
        }
        match links & regs::Links::SPEED_MASK.bits() {
            x if x == regs::Links::SPEED_100M.bits() => 100,
            x if x == regs::Links::SPEED_1G.bits() => 1000,
            x if x == regs::Links::SPEED_10G.bits() => 10000,
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_ring_wraps_at_power_of_two_boundary() {
        assert_eq!(wrap_ring(0, 512), 1);
        assert_eq!(wrap_ring(511, 512), 0);
    }
}
