//! Glue to the embedding kernel's SMP layer.
//!
//! The allocator needs a handful of services only the surrounding kernel
//! can provide: the index of the executing CPU, the CPU-index-to-hart-id
//! translation for firmware calls, a synchronous cross-CPU call for
//! IPI-mode shootdowns, and a way to visit every live address space for
//! the 32-bit generation-wrap fixup. The kernel registers them once at
//! boot; before registration (and on uniprocessor configurations that
//! never register) the fallbacks below apply.

use hermit_sync::OnceCell;

use crate::context::AddressSpace;
use crate::cpumask::CpuSet;

#[derive(Clone, Copy, Debug)]
pub struct SmpOps {
	/// Index of the executing CPU, in `[0, num_cpus)`.
	pub processor_id: fn() -> usize,
	/// Translates a CPU index into the platform hart id.
	pub cpu_to_hart: fn(usize) -> usize,
	/// Executes `op` on every CPU in the set and waits for completion.
	pub on_each_cpu: Option<fn(CpuSet, &(dyn Fn() + Sync))>,
	/// Visits every live address space.
	pub for_each_address_space: Option<fn(&mut dyn FnMut(&AddressSpace))>,
}

static SMP_OPS: OnceCell<SmpOps> = OnceCell::new();

/// Registers the kernel's SMP services. Must happen before the first
/// address-space switch on a multiprocessor system.
pub fn register(ops: SmpOps) -> Result<(), SmpOps> {
	SMP_OPS.set(ops)
}

pub(crate) fn processor_id() -> usize {
	SMP_OPS.get().map_or(0, |ops| (ops.processor_id)())
}

fn cpu_to_hart(cpu: usize) -> usize {
	SMP_OPS.get().map_or(cpu, |ops| (ops.cpu_to_hart)(cpu))
}

/// Hart mask naming every CPU in `set`, in the form the firmware takes.
pub(crate) fn hart_mask(set: CpuSet) -> usize {
	set.into_iter().fold(0, |mask, cpu| mask | 1 << cpu_to_hart(cpu))
}

pub(crate) fn on_each_cpu() -> Option<fn(CpuSet, &(dyn Fn() + Sync))> {
	SMP_OPS.get().and_then(|ops| ops.on_each_cpu)
}

/// Runs `f` over every live address space. Reports whether a walker was
/// registered at all.
pub(crate) fn for_each_address_space(f: &mut dyn FnMut(&AddressSpace)) -> bool {
	match SMP_OPS.get().and_then(|ops| ops.for_each_address_space) {
		Some(walk) => {
			walk(f);
			true
		}
		None => false,
	}
}
