//! Per-device packet/byte counters and rate reporting.

use std::time::Duration;

/// A snapshot of a device's cumulative rx/tx packet and byte counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceStats {
    /// Total packets received.
    pub rx_pkts: u64,
    /// Total packets transmitted.
    pub tx_pkts: u64,
    /// Total payload bytes received (excludes the 4-byte Ethernet CRC,
    /// which is stripped by the NIC before the driver ever sees it).
    pub rx_bytes: u64,
    /// Total payload bytes transmitted.
    pub tx_bytes: u64,
}

/// Packet and bit rates computed between two [`DeviceStats`] snapshots.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatsRate {
    /// Received packets per second.
    pub rx_pps: f64,
    /// Transmitted packets per second.
    pub tx_pps: f64,
    /// Received megabits per second.
    pub rx_mbps: f64,
    /// Transmitted megabits per second.
    pub tx_mbps: f64,
}

/// Computes the rate of change between `before` and `after`, given the
/// elapsed wall-clock time.
///
/// Uses `wrapping_sub` so a hardware counter that rolled over between the
/// two readings produces a (still meaningful, if approximate) rate rather
/// than panicking in debug builds or silently underflowing in release.
pub fn diff(before: &DeviceStats, after: &DeviceStats, elapsed: Duration) -> StatsRate {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return StatsRate::default();
    }

    let rx_pkts = after.rx_pkts.wrapping_sub(before.rx_pkts) as f64;
    let tx_pkts = after.tx_pkts.wrapping_sub(before.tx_pkts) as f64;
    let rx_bytes = after.rx_bytes.wrapping_sub(before.rx_bytes) as f64;
    let tx_bytes = after.tx_bytes.wrapping_sub(before.tx_bytes) as f64;

    StatsRate {
        rx_pps: rx_pkts / secs,
        tx_pps: tx_pkts / secs,
        rx_mbps: rx_bytes * 8.0 / secs / 1_000_000.0,
        tx_mbps: tx_bytes * 8.0 / secs / 1_000_000.0,
    }
}

/// Logs a human-readable rate line for `name` at info level.
pub fn log_rate(name: &str, rate: &StatsRate) {
    log::info!(
        "{name}: rx {:.2} Mpps / {:.2} Mbit/s, tx {:.2} Mpps / {:.2} Mbit/s",
        rate.rx_pps / 1_000_000.0,
        rate.rx_mbps,
        rate.tx_pps / 1_000_000.0,
        rate.tx_mbps,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diff_computes_simple_rate() {
        let before = DeviceStats::default();
        let after = DeviceStats {
            rx_pkts: 1_000_000,
            tx_pkts: 500_000,
            rx_bytes: 1_000_000 * 64,
            tx_bytes: 500_000 * 64,
        };
        let rate = diff(&before, &after, Duration::from_secs(1));
        assert!((rate.rx_pps - 1_000_000.0).abs() < 1.0);
        assert!((rate.tx_pps - 500_000.0).abs() < 1.0);
    }

    #[test]
    fn diff_survives_counter_rollover() {
        let before = DeviceStats {
            rx_pkts: u64::MAX - 10,
            ..Default::default()
        };
        let after = DeviceStats {
            rx_pkts: 5,
            ..Default::default()
        };
        let rate = diff(&before, &after, Duration::from_secs(1));
        // wrapping_sub(MAX - 10, 5) = 16, not a panic and not a huge number.
        assert_eq!(rate.rx_pps, 16.0);
    }

    #[test]
    fn zero_elapsed_time_yields_default() {
        let s = DeviceStats::default();
        let rate = diff(&s, &s, Duration::from_secs(0));
        assert_eq!(rate.rx_pps, 0.0);
    }
}
