//! Deferred instruction-cache invalidation.
//!
//! There is no remote icache shootdown instruction: `fence.i` only covers
//! the executing hart. When instruction memory of an address space
//! changes, the modifying hart fences itself, fences the harts currently
//! executing the address space, and marks every other hart stale in the
//! address space's mask. A stale hart picks the bit up on its next switch
//! into the address space and fences locally before user code resumes.
//! Harts that never enter the address space never get an interrupt, which
//! keeps a machine full of single-hart processes from drowning in IPIs.

use core::sync::atomic::{Ordering, fence};

use crate::context::{AddressSpace, MmContext};
use crate::cpumask::CpuSet;
use crate::params::FlushMethod;
use crate::{arch, smp};

impl MmContext {
	/// Propagates a modification of the address space's instruction
	/// memory to every hart. With `local` set the caller only needs the
	/// executing hart to be coherent; the others are still marked stale.
	pub fn flush_icache_mm(&self, address_space: &AddressSpace, local: bool) {
		let cpu = smp::processor_id();

		// Every hart must invalidate before its next user-mode entry;
		// this one does so now.
		address_space
			.icache_stale_mask
			.copy_from(CpuSet::all(self.num_cpus()));
		address_space.icache_stale_mask.clear(cpu);
		arch::local_flush_icache();

		// Publish the instruction writes before the stale bits are
		// consumed. Pairs with the fence in `flush_icache_deferred`.
		fence(Ordering::SeqCst);

		let others = address_space.cpu_mask.load().without(cpu);
		if local || others.is_empty() {
			return;
		}

		// Harts running the address space right now cannot wait for
		// their next switch.
		address_space.icache_stale_mask.clear_set(others);
		match self.flush_params().method {
			FlushMethod::Sbi => arch::remote_fence_i(smp::hart_mask(others)),
			FlushMethod::Ipi => {
				if let Some(on_each_cpu) = smp::on_each_cpu() {
					on_each_cpu(others, &arch::local_flush_icache);
				} else {
					panic!("icache shootdown without a cross-CPU call primitive");
				}
			}
		}
	}

	/// Runs on every switch into `address_space`: a stale hart fences
	/// before execution returns to user mode.
	pub(crate) fn flush_icache_deferred(&self, cpu: usize, address_space: &AddressSpace) {
		if address_space.icache_stale_mask.test_and_clear(cpu) {
			// The modifying hart's writes must be visible before the
			// invalidation. Pairs with the fence in `flush_icache_mm`.
			fence(Ordering::SeqCst);
			arch::local_flush_icache();
		}
	}
}
