use crate::error::KernelError;
use bitflags::bitflags;
use core::fmt;

pub const PAGE_SIZE: u32 = 4096;
pub const WORD_SIZE: u32 = 4;
pub const WORDS_PER_PAGE: u32 = PAGE_SIZE / WORD_SIZE;

/// Top of the user-reachable address range. Fork shares `[0, USER_TOP)`.
pub const USER_TOP: u32 = 0x8000_0000;

/// Fixed user-space locations used by the library itself.
pub mod layout {
    use super::VirtAddr;

    /// Page holding the owning process id of an address space.
    pub const SELF_SLOT: VirtAddr = VirtAddr::new(0x7FFF_E000);

    /// Scratch page used while materialising a copy-on-write page.
    pub const FAULT_SCRATCH: VirtAddr = VirtAddr::new(0x7FFF_D000);

    /// Conventional start of the region programs carve mutexes out of.
    pub const SYNC_BASE: VirtAddr = VirtAddr::new(0x4000_0000);

    /// Conventional start of ordinary program data.
    pub const DATA_BASE: VirtAddr = VirtAddr::new(0x1000_0000);
}

/// Virtual memory address
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtAddr(u32);

impl VirtAddr {
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    pub const fn val(&self) -> u32 {
        self.0
    }

    pub const fn page_base(&self) -> Self {
        Self(self.0 & !(PAGE_SIZE - 1))
    }

    pub const fn page_number(&self) -> u32 {
        self.0 / PAGE_SIZE
    }

    pub const fn is_page_aligned(&self) -> bool {
        self.0 & (PAGE_SIZE - 1) == 0
    }

    /// Address of the `index`th 32-bit word after this one.
    pub const fn word(&self, index: u32) -> Self {
        Self(self.0 + index * WORD_SIZE)
    }

    pub const fn offset(&self, bytes: u32) -> Self {
        Self(self.0 + bytes)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

bitflags! {
    /// Mapping permissions and mapping modifiers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Perm: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const USER = 1 << 2;
        /// Copy-on-write: the page is shared until one side writes to it.
        const LAZY = 1 << 3;
        /// Keep existing destination pages the source range does not cover.
        const COMBINE = 1 << 4;

        const USER_RW = Self::READ.bits() | Self::WRITE.bits() | Self::USER.bits();
    }
}

impl Perm {
    /// Whether a store through a mapping with these bits succeeds without a fault.
    pub fn allows_store(&self) -> bool {
        self.contains(Perm::WRITE) && !self.contains(Perm::LAZY)
    }
}

/// Word-granular access to the calling context's address space.
///
/// On hardware these are plain loads, stores and `amoswap`; a simulator
/// routes them through its page tables. Faults are delivered to the
/// context's upcall before an error is reported.
pub trait UserMemory {
    fn load(&self, addr: VirtAddr) -> Result<u32, KernelError>;

    fn store(&self, addr: VirtAddr, value: u32) -> Result<(), KernelError>;

    /// Atomically replace the word at `addr`, returning the previous value.
    fn swap(&self, addr: VirtAddr, value: u32) -> Result<u32, KernelError>;
}

/// Copy one page of words from `src` to `dst`.
pub fn copy_page<M: UserMemory + ?Sized>(
    mem: &M,
    dst: VirtAddr,
    src: VirtAddr,
) -> Result<(), KernelError> {
    for i in 0..WORDS_PER_PAGE {
        let word = mem.load(src.word(i))?;
        mem.store(dst.word(i), word)?;
    }
    Ok(())
}
