//! Bidirectional packet forwarder between two NICs.
//!
//! Usage:
//!   ixpath-fwd <pci-address-a> <pci-address-b>

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;

use ixpath::stats::{self, DeviceStats};
use ixpath::Device;

/// Receive/transmit batch size per direction, per poll.
const BATCH_SIZE: usize = 64;

/// Interval between stats-rate log lines.
const STATS_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Parser)]
#[command(name = "ixpath-fwd")]
#[command(about = "Forwards packets between two NICs until interrupted")]
struct Cli {
    /// PCI address of the first device, e.g. 0000:03:00.0
    pci_addr_a: String,
    /// PCI address of the second device, e.g. 0000:04:00.0
    pci_addr_b: String,
}

fn forward_direction(
    from: &mut dyn Device,
    to: &mut dyn Device,
    queue_id: u16,
    buffer: &mut VecDeque<ixpath::memory::PacketBuffer>,
) {
    from.rx_batch(queue_id, buffer, BATCH_SIZE);
    to.tx_batch(queue_id, buffer);
    // Anything that didn't fit in the transmit ring is dropped here rather
    // than retried, matching the batched, no-backpressure hot path.
    buffer.clear();
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let mut device_a = ixpath::ixy_init(&cli.pci_addr_a, 1, 1)
        .with_context(|| format!("failed to attach to {}", cli.pci_addr_a))?;
    let mut device_b = ixpath::ixy_init(&cli.pci_addr_b, 1, 1)
        .with_context(|| format!("failed to attach to {}", cli.pci_addr_b))?;

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        ctrlc::set_handler(move || running.store(false, Ordering::SeqCst))
            .context("failed to install signal handler")?;
    }

    log::info!(
        "forwarding between {} and {}",
        cli.pci_addr_a,
        cli.pci_addr_b
    );

    let mut buffer = VecDeque::with_capacity(BATCH_SIZE);
    // Running totals accumulated across the device's lifetime; each
    // `read_stats` call adds in whatever the backend observed since the
    // previous call (a hardware latch-and-clear delta for ixgbe, a software
    // counter delta for virtio).
    let mut total_a = DeviceStats::default();
    let mut total_b = DeviceStats::default();
    let mut last_report = Instant::now();

    while running.load(Ordering::SeqCst) {
        forward_direction(device_a.as_mut(), device_b.as_mut(), 0, &mut buffer);
        forward_direction(device_b.as_mut(), device_a.as_mut(), 0, &mut buffer);

        if last_report.elapsed() >= STATS_INTERVAL {
            let prev_a = total_a;
            let prev_b = total_b;
            device_a.read_stats(&mut total_a);
            device_b.read_stats(&mut total_b);

            let elapsed = last_report.elapsed();
            stats::log_rate(&cli.pci_addr_a, &stats::diff(&prev_a, &total_a, elapsed));
            stats::log_rate(&cli.pci_addr_b, &stats::diff(&prev_b, &total_b, elapsed));

            last_report = Instant::now();
        }
    }

    Ok(())
}
