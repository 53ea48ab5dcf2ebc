//! Fixed-frame packet generator.
//!
//! Usage:
//!   ixpath-gen <pci-address> [--queue N] [--count N]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;

use ixpath::memory::{self, Mempool};
use ixpath::stats::{self, DeviceStats};
use ixpath::Device;

/// Number of buffers kept queued for transmit at any given time.
const BATCH_SIZE: usize = 64;

/// Size of the generated frame, including the 14-byte Ethernet header.
const FRAME_SIZE: usize = 60;

#[derive(Parser)]
#[command(name = "ixpath-gen")]
#[command(about = "Generates fixed-size frames on a single NIC queue until interrupted")]
struct Cli {
    /// PCI address of the device to transmit on, e.g. 0000:03:00.0
    pci_addr: String,

    /// Queue to transmit on.
    #[arg(short, long, default_value_t = 0)]
    queue: u16,

    /// Number of buffers in the generator's private send pool.
    #[arg(short, long, default_value_t = 2048)]
    count: usize,
}

/// Destination MAC address stamped on every generated frame.
const DST_MAC: [u8; 6] = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06];

/// Writes a minimal Ethernet/IPv4 frame: fixed destination MAC, a locally
/// administered source MAC, an IPv4 ethertype, zeroed IP/UDP header space,
/// and an incrementing 32-bit sequence number at bytes [42..46].
fn fill_frame(buf: &mut [u8], seq: u32) {
    buf[0..6].copy_from_slice(&DST_MAC);
    buf[6..12].copy_from_slice(&[0x02, 0x00, 0x00, 0x00, 0x00, 0x01]);
    buf[12..14].copy_from_slice(&[0x08, 0x00]);
    for b in &mut buf[14..42] {
        *b = 0;
    }
    buf[42..46].copy_from_slice(&seq.to_be_bytes());
    for b in &mut buf[46..FRAME_SIZE] {
        *b = 0;
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let mut device =
        ixpath::ixy_init(&cli.pci_addr, 1, 1).with_context(|| format!("failed to attach to {}", cli.pci_addr))?;

    let pool =
        Mempool::allocate(cli.count, memory::DEFAULT_BUF_SIZE).context("failed to allocate send pool")?;

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        ctrlc::set_handler(move || running.store(false, Ordering::SeqCst))
            .context("failed to install signal handler")?;
    }

    log::info!("transmitting on {} queue {}", cli.pci_addr, cli.queue);

    let mut seq: u32 = 0;
    let mut to_send = VecDeque::with_capacity(BATCH_SIZE);
    let start = Instant::now();

    while running.load(Ordering::SeqCst) {
        while to_send.len() < BATCH_SIZE {
            match memory::alloc_pkt(&pool, FRAME_SIZE) {
                Some(mut buf) => {
                    fill_frame(&mut buf, seq);
                    seq = seq.wrapping_add(1);
                    to_send.push_back(buf);
                }
                None => break,
            }
        }

        device.tx_batch(cli.queue, &mut to_send);
    }

    let mut stats = DeviceStats::default();
    device.read_stats(&mut stats);
    let rate = stats::diff(&DeviceStats::default(), &stats, start.elapsed());
    stats::log_rate("ixpath-gen", &rate);

    Ok(())
}
