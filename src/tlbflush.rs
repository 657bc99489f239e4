//! TLB shootdown.
//!
//! Every mutation of a mapping funnels into one of the `flush_tlb_*`
//! operations, which invalidate the affected translations on every hart
//! that may cache them. Ranges are flushed page by page up to the
//! `tlbi_max_ops` threshold and promoted to a full address-space flush
//! beyond it: implementations that ignore the address operand of
//! `sfence.vma` turn every page-level flush into a global one, so a low
//! threshold is the safe default.
//!
//! Delivery is selected at boot. In IPI mode the initiator hands the
//! request to the kernel's cross-CPU call and each target runs the local
//! sequence inline; in SBI mode the firmware's remote fence does the walk.

use crate::config::PAGE_SIZE;
use crate::context::{AddressSpace, MmContext};
use crate::cpumask::CpuSet;
use crate::params::FlushMethod;
use crate::{arch, smp};

/// Size that stands for "the whole address space".
const FLUSH_ALL: usize = usize::MAX;

/// One shootdown, as handed to the delivery mechanism.
#[derive(Clone, Copy, Debug)]
struct FlushRequest {
	start: usize,
	size: usize,
	/// `None` hits entries of every ASID, global mappings included.
	asid: Option<usize>,
}

impl MmContext {
	/// Flushes every TLB entry on every CPU.
	pub fn flush_tlb_all(&self) {
		self.deliver(
			CpuSet::all(self.num_cpus()),
			FlushRequest {
				start: 0,
				size: FLUSH_ALL,
				asid: None,
			},
		);
	}

	/// Flushes all entries of one address space on the CPUs that may
	/// cache them.
	pub fn flush_tlb_mm(&self, address_space: &AddressSpace) {
		self.deliver(
			address_space.cache_mask.load(),
			FlushRequest {
				start: 0,
				size: FLUSH_ALL,
				asid: Some(self.current_asid(address_space)),
			},
		);
	}

	/// Flushes one page of one address space.
	pub fn flush_tlb_page(&self, address_space: &AddressSpace, addr: usize) {
		self.deliver(
			address_space.cache_mask.load(),
			FlushRequest {
				start: addr,
				size: PAGE_SIZE,
				asid: Some(self.current_asid(address_space)),
			},
		);
	}

	/// Flushes `[start, end)` of one address space, promoting large
	/// ranges to a full flush.
	pub fn flush_tlb_range(&self, address_space: &AddressSpace, start: usize, end: usize) {
		if end - start > self.flush_params().threshold() {
			self.flush_tlb_mm(address_space);
			return;
		}

		self.deliver(
			address_space.cache_mask.load(),
			FlushRequest {
				start,
				size: end - start,
				asid: Some(self.current_asid(address_space)),
			},
		);
	}

	/// Flushes a range of global (kernel) mappings on every CPU.
	pub fn flush_tlb_kernel_range(&self, start: usize, end: usize) {
		if end - start > self.flush_params().threshold() {
			self.flush_tlb_all();
			return;
		}

		self.deliver(
			CpuSet::all(self.num_cpus()),
			FlushRequest {
				start,
				size: end - start,
				asid: None,
			},
		);
	}

	/// Flushes one address space on the executing CPU only.
	pub(crate) fn local_flush_tlb_mm(&self, address_space: &AddressSpace) {
		arch::local_flush_tlb_asid(self.current_asid(address_space));
	}

	/// ASID to tag shootdowns for this address space with.
	///
	/// The slot may be unassigned or stale; the tag then names an ASID
	/// the address space no longer owns, whose entries are at worst
	/// flushed needlessly. With ASIDs disabled the tag is 0, which every
	/// translation of the single shared ASID carries.
	fn current_asid(&self, address_space: &AddressSpace) -> usize {
		address_space.asid.load(core::sync::atomic::Ordering::Relaxed) & self.asid_mask()
	}

	fn deliver(&self, targets: CpuSet, request: FlushRequest) {
		if targets.is_empty() {
			return;
		}

		match self.flush_params().method {
			FlushMethod::Sbi => match request.asid {
				Some(asid) => arch::remote_sfence_vma_asid(
					smp::hart_mask(targets),
					request.start,
					request.size,
					asid,
				),
				None => arch::remote_sfence_vma(smp::hart_mask(targets), request.start, request.size),
			},
			FlushMethod::Ipi => {
				if let Some(on_each_cpu) = smp::on_each_cpu() {
					on_each_cpu(targets, &|| local_flush(request));
				} else if targets.without(smp::processor_id()).is_empty() {
					// Uniprocessor configuration: the initiator is the
					// only target.
					local_flush(request);
				} else {
					panic!("TLB shootdown without a cross-CPU call primitive");
				}
			}
		}
	}
}

/// Local invalidation sequence, as each IPI target runs it.
fn local_flush(request: FlushRequest) {
	if request.size == FLUSH_ALL {
		match request.asid {
			Some(asid) => arch::local_flush_tlb_asid(asid),
			None => arch::local_flush_tlb_all(),
		}
		return;
	}

	let mut addr = request.start;
	while addr < request.start + request.size {
		match request.asid {
			Some(asid) => arch::local_flush_tlb_page(addr, asid),
			None => arch::local_flush_tlb_kernel_page(addr),
		}
		addr += PAGE_SIZE;
	}
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
	use alloc::vec::Vec;

	use hermit_sync::SpinMutexGuard;

	use super::*;
	use crate::arch::mock::{self, Event};

	fn setup(cmdline: &str) -> (SpinMutexGuard<'static, ()>, MmContext) {
		let guard = mock::test_guard();
		mock::reset();
		mock::set_boot_asid_bits(0xff);
		let _ = smp::register(mock::smp_ops());
		let ctx = MmContext::init(2, Some(cmdline));
		(guard, ctx)
	}

	/// An address space running on CPU0 and CPU1, so broadcasts have two
	/// targets.
	fn spread_address_space(ctx: &MmContext) -> (AddressSpace, AddressSpace, AddressSpace) {
		let boot0 = AddressSpace::new(0);
		let boot1 = AddressSpace::new(0);
		let aspace = AddressSpace::new(0x7000);
		mock::set_current_cpu(0);
		ctx.switch_mm(&boot0, &aspace);
		mock::set_current_cpu(1);
		ctx.switch_mm(&boot1, &aspace);
		mock::set_current_cpu(0);
		mock::take_events();
		(boot0, boot1, aspace)
	}

	#[test]
	fn threshold_splits_page_and_full_flushes() {
		let (_guard, ctx) = setup("tlbi_max_ops=4 tlbi_method=ipi");
		let (_boot0, _boot1, aspace) = spread_address_space(&ctx);
		let asid = 1;

		// Four pages stay page-granular, on both targets.
		ctx.flush_tlb_range(&aspace, 0x1000, 0x1000 + 4 * PAGE_SIZE);
		let events = mock::take_events();
		let pages: Vec<_> = events
			.iter()
			.filter(|event| matches!(event, Event::FlushPage { .. }))
			.collect();
		assert_eq!(pages.len(), 8);
		for cpu in 0..2 {
			for page in 0..4 {
				assert!(events.contains(&Event::FlushPage {
					cpu,
					addr: 0x1000 + page * PAGE_SIZE,
					asid
				}));
			}
		}

		// Five pages exceed the threshold and promote to a full flush.
		ctx.flush_tlb_range(&aspace, 0x1000, 0x1000 + 5 * PAGE_SIZE);
		let events = mock::take_events();
		assert!(!events.iter().any(|event| matches!(event, Event::FlushPage { .. })));
		assert!(events.contains(&Event::FlushAsid { cpu: 0, asid }));
		assert!(events.contains(&Event::FlushAsid { cpu: 1, asid }));
	}

	#[test]
	fn sbi_delivery_uses_remote_fences() {
		let (_guard, ctx) = setup("tlbi_max_ops=4 tlbi_method=sbi");
		let (_boot0, _boot1, aspace) = spread_address_space(&ctx);

		ctx.flush_tlb_range(&aspace, 0x1000, 0x1000 + 2 * PAGE_SIZE);
		assert_eq!(
			mock::take_events(),
			[Event::RemoteSfenceVmaAsid {
				hart_mask: 0b11,
				start: 0x1000,
				size: 2 * PAGE_SIZE,
				asid: 1
			}]
		);

		ctx.flush_tlb_mm(&aspace);
		assert_eq!(
			mock::take_events(),
			[Event::RemoteSfenceVmaAsid {
				hart_mask: 0b11,
				start: 0,
				size: usize::MAX,
				asid: 1
			}]
		);
	}

	#[test]
	fn page_flush_targets_caching_cpus_only() {
		let (_guard, ctx) = setup("tlbi_method=ipi");
		let boot0 = AddressSpace::new(0);
		let aspace = AddressSpace::new(0x7000);
		mock::set_current_cpu(0);
		ctx.switch_mm(&boot0, &aspace);
		mock::take_events();

		ctx.flush_tlb_page(&aspace, 0xdead_0000);
		assert_eq!(
			mock::take_events(),
			[Event::FlushPage {
				cpu: 0,
				addr: 0xdead_0000,
				asid: 1
			}]
		);
	}

	#[test]
	fn kernel_range_is_untagged_and_hits_every_cpu() {
		let (_guard, ctx) = setup("tlbi_max_ops=4 tlbi_method=ipi");

		ctx.flush_tlb_kernel_range(0xffff_0000, 0xffff_0000 + 2 * PAGE_SIZE);
		let events = mock::take_events();
		for cpu in 0..2 {
			for page in 0..2 {
				assert!(events.contains(&Event::FlushKernelPage {
					cpu,
					addr: 0xffff_0000 + page * PAGE_SIZE
				}));
			}
		}

		// Beyond the threshold everything goes.
		ctx.flush_tlb_kernel_range(0xffff_0000, 0xffff_0000 + 5 * PAGE_SIZE);
		let events = mock::take_events();
		assert_eq!(
			events,
			[Event::FlushAll { cpu: 0 }, Event::FlushAll { cpu: 1 }]
		);
	}

	#[test]
	fn flush_all_reaches_every_cpu() {
		let (_guard, ctx) = setup("tlbi_method=sbi");
		ctx.flush_tlb_all();
		assert_eq!(
			mock::take_events(),
			[Event::RemoteSfenceVma {
				hart_mask: 0b11,
				start: 0,
				size: usize::MAX
			}]
		);
	}

	#[test]
	fn local_sequences() {
		let (_guard, _ctx) = setup("");

		local_flush(FlushRequest {
			start: 0,
			size: FLUSH_ALL,
			asid: None,
		});
		local_flush(FlushRequest {
			start: 0,
			size: FLUSH_ALL,
			asid: Some(7),
		});
		local_flush(FlushRequest {
			start: 0x5000,
			size: 2 * PAGE_SIZE,
			asid: Some(7),
		});
		assert_eq!(
			mock::take_events(),
			[
				Event::FlushAll { cpu: 0 },
				Event::FlushAsid { cpu: 0, asid: 7 },
				Event::FlushPage {
					cpu: 0,
					addr: 0x5000,
					asid: 7
				},
				Event::FlushPage {
					cpu: 0,
					addr: 0x6000,
					asid: 7
				},
			]
		);
	}
}
