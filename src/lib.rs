//! Generation-based ASID allocation and TLB shootdown glue for RISC-V.
//!
//! Hardware tags TLB entries with a small ASID drawn from `2^ASIDLEN`
//! values shared by all harts; this crate multiplexes an unbounded number
//! of address spaces onto that space. ASID slots carry a software
//! generation in their high bits: exhausting the space advances the
//! generation and invalidates every outstanding slot at once, instead of
//! tracking individual frees. Switching to an address space whose slot is
//! still current costs one relaxed compare-and-swap on a per-CPU slot;
//! everything else funnels into a slow path under a single spinlock.
//!
//! Around the allocator sit the pieces that keep remote harts coherent:
//! the `flush_tlb_*` family with a configurable page-vs-full threshold
//! and boot-selectable IPI or SBI remote-fence delivery, and the deferred
//! icache invalidation protocol driven by per-address-space CPU masks.
//!
//! The embedding kernel provides its SMP services through
//! [`smp::register`] and drives the subsystem through [`init`]/[`get`]:
//! probe on the boot CPU, [`MmContext::verify_cpu_asidlen`] on secondary
//! bring-up, [`MmContext::switch_mm`] from the context switch.

#![no_std]

#[macro_use]
extern crate alloc;
#[macro_use]
extern crate log;
#[cfg(all(test, not(target_os = "none")))]
extern crate std;

pub mod arch;
mod config;
mod context;
pub mod cpumask;
mod icache;
mod params;
pub mod smp;
mod tlbflush;

pub use crate::config::{MAX_CPUS, PAGE_SIZE, PTRS_PER_PTE};
pub use crate::context::{AddressSpace, MmContext, get, init};
pub use crate::cpumask::CpuSet;
pub use crate::params::FlushMethod;
