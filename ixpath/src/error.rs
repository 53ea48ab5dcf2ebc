//! Driver error types.

use std::io;

/// Errors that can occur while attaching to or configuring a device.
///
/// Hot-path failures (buffer leaks, unsupported jumbo frames) are not
/// represented here; they are unrecoverable by design and go through
/// [`fatal`] instead of propagating a `Result`.
#[derive(Debug, thiserror::Error)]
pub enum IxyError {
    /// Underlying system call (sysfs read, mmap, pagemap lookup) failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// The device at the given PCI address is not an Ethernet controller.
    #[error("{0} is not a NIC (PCI class != 0x02)")]
    NotANic(String),
    /// The device's vendor/device ID doesn't match any supported backend.
    #[error("unsupported device {vendor:#06x}:{device:#06x} at {pci_addr}")]
    UnsupportedDevice {
        /// PCI address that was probed.
        pci_addr: String,
        /// 16-bit PCI vendor ID read from config space.
        vendor: u16,
        /// 16-bit PCI device ID read from config space.
        device: u16,
    },
    /// A contiguous allocation was requested larger than one hugepage.
    #[error("cannot allocate {requested} contiguous bytes: larger than a hugepage ({hugepage})")]
    ContiguousAllocationTooLarge {
        /// Bytes requested.
        requested: usize,
        /// Size of a single hugepage on this system.
        hugepage: usize,
    },
    /// A ring size that must be a power of two was not.
    #[error("{what} size {size} is not a power of two")]
    NotPowerOfTwo {
        /// Which ring failed the check (`"rx"` or `"tx"`).
        what: &'static str,
        /// The offending size.
        size: usize,
    },
    /// The process is missing the privileges the operation requires.
    #[error("insufficient permissions: {0}")]
    Permission(String),
    /// A required hardware feature was not advertised by the device.
    #[error("device does not support required feature: {0}")]
    UnsupportedFeature(String),
    /// A queue's mempool ran dry while posting the initial set of receive
    /// descriptors (as opposed to a mid-`rx_batch` refill failure, which is
    /// unrecoverable and goes through [`fatal`] instead).
    #[error("mempool exhausted while initializing queue (requested {requested}, pool holds {available})")]
    MempoolExhausted {
        /// Number of buffers the caller tried to post.
        requested: usize,
        /// Number of buffers the pool actually had available.
        available: usize,
    },
}

/// Logs `msg` at error level and terminates the process.
///
/// Used exclusively for the hot-path conditions the driver documents as
/// unrecoverable: a mempool refill failure mid-`rx_batch`, or a receive
/// descriptor missing the end-of-packet bit (an unsupported jumbo frame).
/// Both indicate a bug in the calling application rather than a condition
/// the driver could safely continue past.
pub fn fatal(msg: &str) -> ! {
    log::error!("{msg}");
    std::process::exit(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        assert_eq!(
            format!("{}", IxyError::NotANic("0000:03:00.0".into())),
            "0000:03:00.0 is not a NIC (PCI class != 0x02)"
        );
        assert_eq!(
            format!(
                "{}",
                IxyError::NotPowerOfTwo {
                    what: "rx",
                    size: 500
                }
            ),
            "rx size 500 is not a power of two"
        );
    }

    #[test]
    fn io_error_converts() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "missing");
        let err: IxyError = io_err.into();
        assert!(matches!(err, IxyError::Io(_)));
    }
}
