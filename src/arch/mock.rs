//! Recording stand-ins for the hardware maintenance primitives.
//!
//! Hosted builds have no `satp` and no `sfence.vma`; every primitive
//! instead appends an [`Event`] to a process-global log that the unit
//! tests inspect. The module also provides an [`SmpOps`] table whose
//! cross-call runs the operation inline on each target CPU, so IPI-mode
//! shootdowns are observable per target.
//!
//! The log, the simulated CPU id and the address-space registry are
//! process-global; tests serialize themselves through [`test_guard`].

use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use hermit_sync::{SpinMutex, SpinMutexGuard};

use crate::context::AddressSpace;
use crate::cpumask::CpuSet;
use crate::smp::SmpOps;

/// One recorded hardware maintenance operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
	FlushAll { cpu: usize },
	FlushAsid { cpu: usize, asid: usize },
	FlushPage { cpu: usize, addr: usize, asid: usize },
	FlushKernelPage { cpu: usize, addr: usize },
	FenceI { cpu: usize },
	SatpWrite { cpu: usize, root_pfn: usize, asid: usize },
	RemoteSfenceVma { hart_mask: usize, start: usize, size: usize },
	RemoteSfenceVmaAsid { hart_mask: usize, start: usize, size: usize, asid: usize },
	RemoteFenceI { hart_mask: usize },
}

static EVENTS: SpinMutex<Vec<Event>> = SpinMutex::new(Vec::new());
static ADDRESS_SPACES: SpinMutex<Vec<&'static AddressSpace>> = SpinMutex::new(Vec::new());
static CURRENT_CPU: AtomicUsize = AtomicUsize::new(0);
static BOOT_ASID_BITS: AtomicUsize = AtomicUsize::new(0xffff);
static TEST_LOCK: SpinMutex<()> = SpinMutex::new(());

fn record(event: Event) {
	EVENTS.lock().push(event);
}

/// Serializes tests that touch the process-global mock state.
pub fn test_guard() -> SpinMutexGuard<'static, ()> {
	TEST_LOCK.lock()
}

/// Drops all recorded state and restores the defaults.
pub fn reset() {
	EVENTS.lock().clear();
	ADDRESS_SPACES.lock().clear();
	CURRENT_CPU.store(0, Ordering::Relaxed);
	BOOT_ASID_BITS.store(0xffff, Ordering::Relaxed);
}

/// Removes and returns everything recorded so far.
pub fn take_events() -> Vec<Event> {
	core::mem::take(&mut *EVENTS.lock())
}

pub fn current_cpu() -> usize {
	CURRENT_CPU.load(Ordering::Relaxed)
}

/// Moves the simulated execution to another CPU.
pub fn set_current_cpu(cpu: usize) {
	CURRENT_CPU.store(cpu, Ordering::Relaxed);
}

/// Sets the value the next ASIDLEN probe reads.
pub fn set_boot_asid_bits(bits: usize) {
	BOOT_ASID_BITS.store(bits, Ordering::Relaxed);
}

/// Makes an address space visible to the registered walker.
pub fn register_address_space(address_space: &'static AddressSpace) {
	ADDRESS_SPACES.lock().push(address_space);
}

/// SMP services for the unit tests: the cross-call executes the operation
/// inline on every CPU in the set.
pub fn smp_ops() -> SmpOps {
	SmpOps {
		processor_id: current_cpu,
		cpu_to_hart: |cpu| cpu,
		on_each_cpu: Some(on_each_cpu),
		for_each_address_space: Some(for_each_address_space),
	}
}

fn on_each_cpu(targets: CpuSet, op: &(dyn Fn() + Sync)) {
	let caller = current_cpu();
	for cpu in targets {
		set_current_cpu(cpu);
		op();
	}
	set_current_cpu(caller);
}

fn for_each_address_space(f: &mut dyn FnMut(&AddressSpace)) {
	for address_space in ADDRESS_SPACES.lock().iter() {
		f(address_space);
	}
}

pub fn read_boot_asid_bits() -> usize {
	BOOT_ASID_BITS.load(Ordering::Relaxed)
}

pub fn write_satp(root_pfn: usize, asid: usize) {
	record(Event::SatpWrite {
		cpu: current_cpu(),
		root_pfn,
		asid,
	});
}

pub fn local_flush_tlb_all() {
	record(Event::FlushAll { cpu: current_cpu() });
}

pub fn local_flush_tlb_asid(asid: usize) {
	record(Event::FlushAsid {
		cpu: current_cpu(),
		asid,
	});
}

pub fn local_flush_tlb_page(addr: usize, asid: usize) {
	record(Event::FlushPage {
		cpu: current_cpu(),
		addr,
		asid,
	});
}

pub fn local_flush_tlb_kernel_page(addr: usize) {
	record(Event::FlushKernelPage {
		cpu: current_cpu(),
		addr,
	});
}

pub fn local_flush_icache() {
	record(Event::FenceI { cpu: current_cpu() });
}

pub fn remote_sfence_vma(hart_mask: usize, start: usize, size: usize) {
	record(Event::RemoteSfenceVma {
		hart_mask,
		start,
		size,
	});
}

pub fn remote_sfence_vma_asid(hart_mask: usize, start: usize, size: usize, asid: usize) {
	record(Event::RemoteSfenceVmaAsid {
		hart_mask,
		start,
		size,
		asid,
	});
}

pub fn remote_fence_i(hart_mask: usize) {
	record(Event::RemoteFenceI { hart_mask });
}
