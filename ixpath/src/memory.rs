//! Hugepage-backed DMA memory and the fixed-size packet-buffer pool.
//!
//! Every buffer the NIC touches must have a virtual address the driver
//! controls and a physical address that is stable for the buffer's entire
//! lifetime. Ordinary heap memory can be paged out or moved by the
//! allocator; a hugepage mapping backed by a file in `hugetlbfs` gives both
//! guarantees as long as the mapping is never unmapped.

use std::cell::RefCell;
use std::fs::OpenOptions;
use std::io::{self, Read, Seek, SeekFrom};
use std::ops::{Deref, DerefMut};
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::ptr;
use std::rc::Rc;
use std::slice;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::IxyError;

/// Size in bytes of a single hugepage on this system (2 MiB).
pub const HUGEPAGE_SIZE: usize = 2 * 1024 * 1024;

/// Default mount point of the hugetlbfs filesystem.
const DEFAULT_HUGEPAGE_PATH: &str = "/mnt/huge";

/// Bytes reserved at the front of every packet buffer so that protocols
/// needing to prepend a header (the legacy virtio-net header is 10 bytes)
/// can do so without a second allocation or a memmove.
pub const PACKET_HEADROOM: usize = 64;

/// Default size of one packet buffer's usable data area, matching the
/// receive descriptor's programmed buffer size.
pub const DEFAULT_BUF_SIZE: usize = 2048;

static ALLOCATION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A single contiguous DMA-capable allocation.
///
/// `phys` is valid for as long as `virt` stays mapped; this type never
/// unmaps, by design, since nothing in this driver needs to reclaim DMA
/// memory before process exit.
pub struct Dma<T> {
    /// Virtual address of the allocation.
    pub virt: *mut T,
    /// Physical address of the allocation, suitable for posting to the NIC.
    pub phys: u64,
    /// Size of the allocation in bytes.
    pub size: usize,
}

impl<T> Dma<T> {
    /// Allocates `size` bytes of hugepage-backed memory.
    ///
    /// When `require_contiguous` is set, `size` must not exceed one
    /// hugepage, since contiguity is only guaranteed within a single page.
    pub fn allocate(size: usize, require_contiguous: bool) -> Result<Self, IxyError> {
        if require_contiguous && size > HUGEPAGE_SIZE {
            return Err(IxyError::ContiguousAllocationTooLarge {
                requested: size,
                hugepage: HUGEPAGE_SIZE,
            });
        }

        let hugepage_path = std::env::var("IXPATH_HUGEPAGE_PATH")
            .unwrap_or_else(|_| DEFAULT_HUGEPAGE_PATH.to_string());

        let id = ALLOCATION_COUNTER.fetch_add(1, Ordering::Relaxed);
        let path: PathBuf = PathBuf::from(hugepage_path)
            .join(format!("ixpath-{}-{}", unsafe { libc::getpid() }, id));

        let aligned_size = align_up(size, HUGEPAGE_SIZE);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        file.set_len(aligned_size as u64)?;

        let virt = unsafe {
            libc::mmap(
                ptr::null_mut(),
                aligned_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if virt == libc::MAP_FAILED {
            let _ = std::fs::remove_file(&path);
            return Err(io::Error::last_os_error().into());
        }

        // Don't leave a file lying around; the mapping keeps the pages alive.
        let _ = std::fs::remove_file(&path);

        unsafe {
            libc::mlock(virt, aligned_size);
        }

        let phys = virt_to_phys(virt as usize)?;

        Ok(Dma {
            virt: virt as *mut T,
            phys,
            size: aligned_size,
        })
    }
}

fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Resolves the physical address backing a mapped virtual address by
/// reading `/proc/self/pagemap`.
pub fn virt_to_phys(addr: usize) -> io::Result<u64> {
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;

    let mut pagemap = OpenOptions::new().read(true).open("/proc/self/pagemap")?;
    pagemap.seek(SeekFrom::Start((addr / page_size * 8) as u64))?;

    let mut buf = [0u8; 8];
    pagemap.read_exact(&mut buf)?;
    let entry = u64::from_le_bytes(buf);

    if entry & (1 << 63) == 0 {
        return Err(io::Error::new(
            io::ErrorKind::Other,
            "page not present in pagemap",
        ));
    }

    let pfn = entry & 0x007f_ffff_ffff_ffff;
    Ok(pfn * page_size as u64 + (addr % page_size) as u64)
}

/// A fixed-size pool of pre-allocated, DMA-addressable packet buffers.
///
/// Owned by exactly one thread for its entire lifetime: every buffer handed
/// out holds a strong [`Rc`] back to its pool, and `Rc` is `!Send`, so the
/// compiler rejects moving a buffer — or the pool itself — across threads.
pub struct Mempool {
    base_virt: *mut u8,
    entry_size: usize,
    num_entries: usize,
    // Physical address of each entry, resolved individually at construction
    // time. A pool spanning more than one hugepage has no single linear
    // phys-address formula — hugetlbfs does not promise that consecutive
    // hugepages backing one file are physically adjacent — so each entry's
    // address is looked up once via the pagemap rather than extrapolated
    // from a single base address.
    phys_addrs: Vec<u64>,
    free_stack: Vec<usize>,
    // Keeps the backing allocation alive for the pool's lifetime.
    _dma: Dma<u8>,
}

impl Mempool {
    /// Allocates `num_entries` buffers of `entry_size` bytes each.
    pub fn allocate(num_entries: usize, entry_size: usize) -> Result<Rc<RefCell<Mempool>>, IxyError> {
        let dma: Dma<u8> = Dma::allocate(num_entries * entry_size, false)?;

        let mut phys_addrs = Vec::with_capacity(num_entries);
        for i in 0..num_entries {
            let virt = unsafe { dma.virt.add(i * entry_size) } as usize;
            phys_addrs.push(virt_to_phys(virt)?);
        }

        let pool = Mempool {
            base_virt: dma.virt,
            entry_size,
            num_entries,
            phys_addrs,
            free_stack: (0..num_entries).collect(),
            _dma: dma,
        };

        Ok(Rc::new(RefCell::new(pool)))
    }

    /// Pops one buffer index from the free stack, or `None` if exhausted.
    pub fn alloc_buf(&mut self) -> Option<usize> {
        self.free_stack.pop()
    }

    /// Returns a buffer index to the free stack.
    pub fn free_buf(&mut self, index: usize) {
        debug_assert!(index < self.num_entries);
        self.free_stack.push(index);
    }

    /// Number of buffers currently available for allocation.
    pub fn free_count(&self) -> usize {
        self.free_stack.len()
    }

    /// Total capacity of the pool.
    pub fn capacity(&self) -> usize {
        self.num_entries
    }

    /// Size in bytes of each buffer's full entry (including headroom).
    pub fn entry_size(&self) -> usize {
        self.entry_size
    }

    fn virt_addr(&self, index: usize) -> *mut u8 {
        unsafe { self.base_virt.add(index * self.entry_size) }
    }

    fn phys_addr(&self, index: usize) -> u64 {
        self.phys_addrs[index]
    }
}

/// A single packet buffer checked out of a [`Mempool`].
///
/// `addr_virt`/`addr_phys` point past [`PACKET_HEADROOM`] bytes of spare
/// room at the front of the entry, so protocols that need to prepend a
/// header (virtio-net) can post a physical address `offset` bytes before
/// the payload instead of copying it.
pub struct PacketBuffer {
    addr_virt: *mut u8,
    addr_phys: u64,
    /// Length of the packet payload currently held in this buffer.
    pub len: usize,
    pool: Rc<RefCell<Mempool>>,
    pool_entry: usize,
}

impl PacketBuffer {
    /// Physical address of the payload (not the headroom).
    pub fn phys_addr(&self) -> u64 {
        self.addr_phys
    }

    /// Virtual address of the payload.
    pub fn virt_addr(&self) -> *mut u8 {
        self.addr_virt
    }

    /// Index of this buffer within its originating mempool.
    pub fn pool_entry(&self) -> usize {
        self.pool_entry
    }

    /// Returns the originating mempool.
    pub fn pool(&self) -> &Rc<RefCell<Mempool>> {
        &self.pool
    }
}

impl Deref for PacketBuffer {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.addr_virt, self.len) }
    }
}

impl DerefMut for PacketBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.addr_virt, self.len) }
    }
}

impl Drop for PacketBuffer {
    fn drop(&mut self) {
        self.pool.borrow_mut().free_buf(self.pool_entry);
    }
}

/// Allocates one buffer from `pool` with payload capacity `len` (which must
/// leave room for [`PACKET_HEADROOM`] bytes of spare space ahead of it).
pub fn alloc_pkt(pool: &Rc<RefCell<Mempool>>, len: usize) -> Option<PacketBuffer> {
    let index = pool.borrow_mut().alloc_buf()?;
    let (virt_base, phys_base) = {
        let p = pool.borrow();
        (p.virt_addr(index), p.phys_addr(index))
    };
    Some(PacketBuffer {
        addr_virt: unsafe { virt_base.add(PACKET_HEADROOM) },
        addr_phys: phys_base + PACKET_HEADROOM as u64,
        len,
        pool: pool.clone(),
        pool_entry: index,
    })
}

/// Allocates up to `count` buffers, stopping early if the pool is exhausted.
/// Returns however many were actually allocated.
pub fn alloc_pkt_batch(
    pool: &Rc<RefCell<Mempool>>,
    out: &mut Vec<PacketBuffer>,
    count: usize,
    len: usize,
) -> usize {
    let mut allocated = 0;
    for _ in 0..count {
        match alloc_pkt(pool, len) {
            Some(buf) => {
                out.push(buf);
                allocated += 1;
            }
            None => break,
        }
    }
    allocated
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_boundary() {
        assert_eq!(align_up(1, HUGEPAGE_SIZE), HUGEPAGE_SIZE);
        assert_eq!(align_up(HUGEPAGE_SIZE, HUGEPAGE_SIZE), HUGEPAGE_SIZE);
        assert_eq!(align_up(HUGEPAGE_SIZE + 1, HUGEPAGE_SIZE), 2 * HUGEPAGE_SIZE);
    }
}
