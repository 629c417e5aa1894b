//! Frames and page-granular address spaces.

use log::trace;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tandem_user::memory::{USER_TOP, WORDS_PER_PAGE, WORD_SIZE};
use tandem_user::{KernelError, Perm, VirtAddr, PAGE_SIZE};

/// Counts live frames against a fixed budget.
#[derive(Debug)]
pub struct FramePool {
    limit: usize,
    live: AtomicUsize,
}

impl FramePool {
    pub fn new(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            limit,
            live: AtomicUsize::new(0),
        })
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// A fresh zeroed frame, or `NoMemory` once the budget is spent.
    pub fn alloc(self: &Arc<Self>) -> Result<Arc<Frame>, KernelError> {
        let previous = self.live.fetch_add(1, Ordering::SeqCst);
        if previous >= self.limit {
            self.live.fetch_sub(1, Ordering::SeqCst);
            return Err(KernelError::NoMemory);
        }
        let words = (0..WORDS_PER_PAGE).map(|_| AtomicU32::new(0)).collect();
        Ok(Arc::new(Frame {
            words,
            pool: Arc::clone(self),
        }))
    }
}

/// One physical page.
#[derive(Debug)]
pub struct Frame {
    words: Box<[AtomicU32]>,
    pool: Arc<FramePool>,
}

impl Frame {
    fn word(&self, addr: VirtAddr) -> &AtomicU32 {
        &self.words[((addr.val() % PAGE_SIZE) / WORD_SIZE) as usize]
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        self.pool.live.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone)]
pub struct PageTableEntry {
    pub frame: Arc<Frame>,
    pub perm: Perm,
}

/// Why a user access could not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessError {
    Unmapped,
    ReadOnly,
    Misaligned,
}

pub type SharedSpace = Arc<Mutex<AddressSpace>>;

/// Lock a space, ignoring poisoning: a panicking context never leaves a
/// page table half-updated.
pub fn lock(space: &SharedSpace) -> MutexGuard<'_, AddressSpace> {
    space.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Default)]
pub struct AddressSpace {
    pages: BTreeMap<u32, PageTableEntry>,
}

impl AddressSpace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedSpace {
        Arc::new(Mutex::new(Self::new()))
    }

    pub fn perm(&self, addr: VirtAddr) -> Option<Perm> {
        self.pages.get(&addr.page_number()).map(|pte| pte.perm)
    }

    pub fn load(&self, addr: VirtAddr) -> Result<u32, AccessError> {
        Ok(self.entry(addr)?.frame.word(addr).load(Ordering::SeqCst))
    }

    pub fn store(&self, addr: VirtAddr, value: u32) -> Result<(), AccessError> {
        self.writable(addr)?.word(addr).store(value, Ordering::SeqCst);
        Ok(())
    }

    pub fn swap(&self, addr: VirtAddr, value: u32) -> Result<u32, AccessError> {
        Ok(self.writable(addr)?.word(addr).swap(value, Ordering::SeqCst))
    }

    /// Back `[addr, addr + len)` with fresh frames, replacing old mappings.
    pub fn alloc(
        &mut self,
        pool: &Arc<FramePool>,
        addr: VirtAddr,
        len: u32,
        perm: Perm,
    ) -> Result<(), KernelError> {
        let pages = check_range(addr, len)?;
        check_perm(perm)?;
        let perm = perm - Perm::LAZY - Perm::COMBINE;
        for vpn in pages {
            let frame = pool.alloc()?;
            self.pages.insert(vpn, PageTableEntry { frame, perm });
        }
        trace!("alloc {} + {:#x} ({:?})", addr, len, perm);
        Ok(())
    }

    pub fn unmap(&mut self, addr: VirtAddr, len: u32) -> Result<(), KernelError> {
        let pages = check_range(addr, len)?;
        self.pages.retain(|vpn, _| !pages.contains(vpn));
        Ok(())
    }

    fn entry(&self, addr: VirtAddr) -> Result<&PageTableEntry, AccessError> {
        if addr.val() % WORD_SIZE != 0 {
            return Err(AccessError::Misaligned);
        }
        self.pages
            .get(&addr.page_number())
            .ok_or(AccessError::Unmapped)
    }

    fn writable(&self, addr: VirtAddr) -> Result<&Frame, AccessError> {
        let pte = self.entry(addr)?;
        if !pte.perm.allows_store() {
            return Err(AccessError::ReadOnly);
        }
        Ok(&pte.frame)
    }
}

/// Map `len` bytes of `src` at `src_addr` into `dst` at `dst_addr`.
///
/// With `Perm::LAZY`, every writable source page becomes copy-on-write on
/// both sides; read-only pages are simply shared. `src` and `dst` may be the
/// same space.
pub fn map_range(
    src: &SharedSpace,
    src_addr: VirtAddr,
    dst: &SharedSpace,
    dst_addr: VirtAddr,
    len: u32,
    perm: Perm,
) -> Result<(), KernelError> {
    let src_pages = check_range(src_addr, len)?;
    let dst_pages = check_range(dst_addr, len)?;
    check_perm(perm)?;
    let lazy = perm.contains(Perm::LAZY);
    let base_perm = perm - Perm::LAZY - Perm::COMBINE;

    let mut incoming = Vec::new();
    {
        let mut src = lock(src);
        for (vpn, pte) in src.pages.range_mut(src_pages) {
            let shared_perm = if !lazy {
                base_perm
            } else if pte.perm.contains(Perm::WRITE) {
                pte.perm |= Perm::LAZY;
                base_perm | Perm::LAZY
            } else {
                base_perm - Perm::WRITE
            };
            let offset = vpn - src_addr.page_number();
            incoming.push((offset, Arc::clone(&pte.frame), shared_perm));
        }
    }

    let mut dst = lock(dst);
    if !perm.contains(Perm::COMBINE) {
        dst.pages.retain(|vpn, _| !dst_pages.contains(vpn));
    }
    let shared = incoming.len();
    for (offset, frame, perm) in incoming {
        dst.pages.insert(
            dst_addr.page_number() + offset,
            PageTableEntry { frame, perm },
        );
    }
    trace!(
        "map {} -> {} + {:#x}: {} pages ({:?})",
        src_addr,
        dst_addr,
        len,
        shared,
        perm
    );
    Ok(())
}

fn check_range(addr: VirtAddr, len: u32) -> Result<std::ops::Range<u32>, KernelError> {
    let invalid = KernelError::InvalidRange { addr, len };
    if !addr.is_page_aligned() || len % PAGE_SIZE != 0 {
        return Err(invalid);
    }
    let end = addr.val().checked_add(len).ok_or(invalid)?;
    if end > USER_TOP {
        return Err(invalid);
    }
    Ok(addr.page_number()..end / PAGE_SIZE)
}

fn check_perm(perm: Perm) -> Result<(), KernelError> {
    if !perm.contains(Perm::READ | Perm::USER) {
        return Err(KernelError::InvalidPermission);
    }
    Ok(())
}
