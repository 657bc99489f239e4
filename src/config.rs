/// Number of offset bits of a virtual address within a 4 KiB base page.
pub const PAGE_BITS: usize = 12;

/// Size of a base page.
pub const PAGE_SIZE: usize = 1 << PAGE_BITS;

/// Number of entries in one page table.
pub const PTRS_PER_PTE: usize = 512;

/// Upper bound on supported CPUs; a CPU set is a single machine word.
pub const MAX_CPUS: usize = usize::BITS as usize;
