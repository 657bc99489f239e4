//! ASID management and address-space switching.
//!
//! An ASID slot is `generation | asid` in one machine word. The generation
//! advances in steps of the ASID-space size whenever the space is
//! exhausted, so the low bits of a fresh generation never collide with a
//! slot handed out earlier: a stale slot is recognized by its generation
//! bits alone and reallocated on the next switch. Harts that sit out a
//! rollover keep their ASID through a per-CPU reserved slot until they
//! switch again.

use alloc::boxed::Box;
use core::sync::atomic::{AtomicUsize, Ordering};

use bit_field::BitField;
use crossbeam_utils::CachePadded;
use hermit_sync::{InterruptSpinMutex, OnceCell};

use crate::config::MAX_CPUS;
use crate::cpumask::AtomicCpuSet;
use crate::params::TlbiParams;
use crate::{arch, smp};

const WORD_BITS: usize = usize::BITS as usize;

/// An address space as the MMU sees it: a root page table, an ASID slot
/// and the CPU masks that drive shootdowns.
///
/// Destruction is up to the owner, which must make sure no CPU still has
/// the address space in its cache mask by then.
pub struct AddressSpace {
	/// `generation | asid`, or `0` while no ASID is assigned. The value
	/// may be stale; it is validated against the generation counter on
	/// every switch.
	pub(crate) asid: AtomicUsize,
	/// CPUs currently executing in this address space.
	pub(crate) cpu_mask: AtomicCpuSet,
	/// CPUs that may hold TLB entries for this address space.
	pub(crate) cache_mask: AtomicCpuSet,
	/// CPUs that must invalidate their instruction cache before the next
	/// user-mode entry into this address space.
	pub(crate) icache_stale_mask: AtomicCpuSet,
	/// Physical frame number of the root page table.
	pub(crate) root_pfn: usize,
}

impl AddressSpace {
	pub fn new(root_pfn: usize) -> Self {
		Self {
			asid: AtomicUsize::new(0),
			cpu_mask: AtomicCpuSet::new(),
			cache_mask: AtomicCpuSet::new(),
			icache_stale_mask: AtomicCpuSet::new(),
			root_pfn,
		}
	}

	pub fn root_pfn(&self) -> usize {
		self.root_pfn
	}
}

/// One bit per ASID; a set bit is taken in the current generation.
struct AsidMap {
	words: Box<[usize]>,
	len: usize,
}

impl AsidMap {
	fn new(len: usize) -> Self {
		Self {
			words: vec![0; len.div_ceil(WORD_BITS)].into_boxed_slice(),
			len,
		}
	}

	fn set(&mut self, idx: usize) {
		self.words[idx / WORD_BITS].set_bit(idx % WORD_BITS, true);
	}

	/// Sets a bit and reports whether it was already set.
	fn test_and_set(&mut self, idx: usize) -> bool {
		let word = &mut self.words[idx / WORD_BITS];
		let taken = word.get_bit(idx % WORD_BITS);
		word.set_bit(idx % WORD_BITS, true);
		taken
	}

	#[cfg(all(test, not(target_os = "none")))]
	fn test(&self, idx: usize) -> bool {
		self.words[idx / WORD_BITS].get_bit(idx % WORD_BITS)
	}

	fn clear_all(&mut self) {
		self.words.fill(0);
	}

	/// Index of the first zero bit in `[from, len)`, or `len` if there is
	/// none.
	fn next_zero(&self, from: usize) -> usize {
		let mut idx = from;
		while idx < self.len {
			let word = self.words[idx / WORD_BITS];
			if word == usize::MAX {
				idx = (idx / WORD_BITS + 1) * WORD_BITS;
				continue;
			}
			if !word.get_bit(idx % WORD_BITS) {
				return idx;
			}
			idx += 1;
		}
		self.len
	}
}

/// Allocator state written only under the slow-path lock.
struct AsidInner {
	map: AsidMap,
	/// Start of the next linear probe, in `[1, num_asids)`.
	cur_idx: usize,
	/// ASID each CPU held at the most recent rollover.
	reserved: Box<[usize]>,
}

struct AsidState {
	/// Current generation. The low `asidlen` bits are always zero, and
	/// the value is at least one generation step from boot on.
	generation: AtomicUsize,
	/// ASID each CPU is running with, `0` between a rollover and the
	/// CPU's next switch. Written by the owning CPU, except for the
	/// rollover's exchange.
	active: Box<[CachePadded<AtomicUsize>]>,
	inner: InterruptSpinMutex<AsidInner>,
}

/// The per-boot MM context state: ASID allocator and shootdown policy.
pub struct MmContext {
	num_cpus: usize,
	asidlen: u32,
	params: TlbiParams,
	/// `None` when ASIDs are disabled, either unimplemented or with too
	/// little headroom for the CPU count.
	asid: Option<AsidState>,
}

/// ASIDLEN of the executing hart. Boot code leaves every implemented ASID
/// bit set in `satp`, and implemented bits fill from the least significant
/// end, so the highest set bit gives the field width.
fn asid_probe() -> u32 {
	let bits = arch::read_boot_asid_bits();
	usize::BITS - bits.leading_zeros()
}

/// Upgrades every reserved-slot copy of `asid` to `newasid`. The walk
/// never stops at the first match: a copy left behind would let another
/// address space grab the same low bits in a later generation.
fn check_reserved(inner: &mut AsidInner, asid: usize, newasid: usize) -> bool {
	let mut hit = false;
	for reserved in &mut inner.reserved {
		if *reserved == asid {
			hit = true;
			*reserved = newasid;
		}
	}
	hit
}

impl MmContext {
	/// Probes the boot hart's ASID support and builds the allocator.
	/// Secondary harts are checked against the result with
	/// [`verify_cpu_asidlen`](Self::verify_cpu_asidlen).
	pub fn init(num_cpus: usize, cmdline: Option<&str>) -> Self {
		assert!(num_cpus >= 1);
		assert!(num_cpus <= MAX_CPUS, "CPU sets hold at most {MAX_CPUS} CPUs");

		let params = cmdline.map_or_else(TlbiParams::default, TlbiParams::from_cmdline);

		let asidlen = asid_probe();
		if asidlen == 0 {
			info!("ASID is not supported");
			return Self::disabled(num_cpus, params);
		}
		info!("ASIDLEN = {asidlen}");

		let num_asids = 1usize << asidlen;

		// Allocation can only always succeed if a generation has a free
		// slot left after every CPU pinned a reserved ASID, with ASID 0
		// never handed out.
		if num_asids - 1 <= num_cpus {
			warn!(
				"Not enough ASIDs({num_asids}) for number of CPUs({num_cpus}). ASID is disabled"
			);
			return Self::disabled(num_cpus, params);
		}

		let mask = num_asids - 1;

		// Harts boot with every ASID bit set in satp, so the all-ones
		// ASID is in use until a CPU's first switch. Keep it out of the
		// first generation.
		let mut map = AsidMap::new(num_asids);
		map.set(mask);

		let active = (0..num_cpus)
			.map(|_| CachePadded::new(AtomicUsize::new(mask)))
			.collect();

		info!("ASID allocator initialised with {num_asids} entries");

		Self {
			num_cpus,
			asidlen,
			params,
			asid: Some(AsidState {
				generation: AtomicUsize::new(num_asids),
				active,
				inner: InterruptSpinMutex::new(AsidInner {
					map,
					cur_idx: 1,
					reserved: vec![0; num_cpus].into_boxed_slice(),
				}),
			}),
		}
	}

	fn disabled(num_cpus: usize, params: TlbiParams) -> Self {
		Self {
			num_cpus,
			asidlen: 0,
			params,
			asid: None,
		}
	}

	pub fn asids_enabled(&self) -> bool {
		self.asid.is_some()
	}

	pub fn asidlen(&self) -> u32 {
		self.asidlen
	}

	pub(crate) fn num_cpus(&self) -> usize {
		self.num_cpus
	}

	pub(crate) fn flush_params(&self) -> &TlbiParams {
		&self.params
	}

	/// Mask selecting the ASID field of a slot; `0` with ASIDs disabled.
	pub(crate) fn asid_mask(&self) -> usize {
		if self.asidlen == 0 {
			0
		} else {
			(1 << self.asidlen) - 1
		}
	}

	fn num_asids(&self) -> usize {
		1 << self.asidlen
	}

	/// Every hart must implement the boot hart's ASIDLEN; call this on
	/// secondary bring-up, before the hart's first switch.
	pub fn verify_cpu_asidlen(&self) {
		let probed = asid_probe();
		if self.asidlen != 0 && probed != self.asidlen {
			panic!(
				"CPU{}'s ASIDLEN({}) different from boot CPU's ({})",
				smp::processor_id(),
				probed,
				self.asidlen
			);
		}
	}

	/// Installs `next` as the active address space on the executing CPU.
	pub fn switch_mm(&self, prev: &AddressSpace, next: &AddressSpace) {
		if core::ptr::eq(prev, next) {
			return;
		}

		let cpu = smp::processor_id();

		let Some(state) = &self.asid else {
			self.switch_mm_noasid(cpu, prev, next);
			return;
		};

		let mask = self.asid_mask();
		let mut asid = next.asid.load(Ordering::Relaxed);
		let old_active = state.active[cpu].load(Ordering::Relaxed);

		// The CAS on the active slot is the publication point a racing
		// rollover synchronizes with:
		// - an active slot of 0 means a rollover hit this CPU and the
		//   TLB may need flushing,
		// - stale generation bits in the slot need a fresh allocation,
		// - a failed CAS means a rollover won the race after the
		//   generation load above.
		// All three drop to the slow path, which rechecks under the lock.
		let hit = old_active != 0
			&& asid & !mask == state.generation.load(Ordering::Relaxed)
			&& state.active[cpu]
				.compare_exchange(old_active, asid, Ordering::Relaxed, Ordering::Relaxed)
				.is_ok();

		if !hit {
			let mut inner = state.inner.lock();

			asid = next.asid.load(Ordering::Relaxed);
			if asid & !mask != state.generation.load(Ordering::Relaxed) {
				asid = self.alloc_asid(state, &mut inner, next);
				// The rollover flushed every hart; only the ones still
				// running this address space may cache translations for
				// it.
				next.cache_mask.copy_from(next.cpu_mask.load());
				next.asid.store(asid, Ordering::Relaxed);
			}

			state.active[cpu].store(asid, Ordering::Relaxed);
		}

		prev.cpu_mask.clear(cpu);
		next.cpu_mask.set(cpu);
		next.cache_mask.set(cpu);

		arch::write_satp(next.root_pfn, asid & mask);

		self.flush_icache_deferred(cpu, next);
	}

	fn switch_mm_noasid(&self, cpu: usize, prev: &AddressSpace, next: &AddressSpace) {
		prev.cpu_mask.clear(cpu);
		next.cpu_mask.set(cpu);
		prev.cache_mask.clear(cpu);
		next.cache_mask.set(cpu);

		// One shared ASID means the TLB holds entries of whatever ran
		// here before.
		arch::write_satp(next.root_pfn, 0);
		self.local_flush_tlb_mm(next);

		self.flush_icache_deferred(cpu, next);
	}

	/// Returns a `generation | asid` slot for `next` that is valid in the
	/// current generation. Runs under the slow-path lock.
	fn alloc_asid(&self, state: &AsidState, inner: &mut AsidInner, next: &AddressSpace) -> usize {
		let mask = self.asid_mask();
		let asid = next.asid.load(Ordering::Relaxed);
		let mut generation = state.generation.load(Ordering::Relaxed);

		if asid != 0 {
			let newasid = generation | (asid & mask);

			// An ASID that was active during the last rollover sits in a
			// reserved slot with its bitmap bit already set; carry it.
			if check_reserved(inner, asid, newasid) {
				return newasid;
			}

			// The low bits from the previous life cycle may still be
			// free.
			if !inner.map.test_and_set(asid & mask) {
				return newasid;
			}
		}

		// ASID 0 belongs to software unaware of ASIDs; the probe never
		// starts below 1.
		let mut idx = inner.map.next_zero(inner.cur_idx);
		if idx == self.num_asids() {
			self.new_asid_generation(state, inner);
			generation = state.generation.load(Ordering::Relaxed);
			idx = inner.map.next_zero(1);
			assert!(
				idx != self.num_asids(),
				"no free ASID after a generation rollover"
			);
		}

		inner.map.set(idx);
		inner.cur_idx = idx;

		generation | idx
	}

	/// Starts a new generation: every slot handed out so far becomes
	/// stale, except the ones CPUs are running right now, which move into
	/// their reserved slots.
	fn new_asid_generation(&self, state: &AsidState, inner: &mut AsidInner) {
		let step = self.num_asids();
		let generation = state.generation.load(Ordering::Relaxed);

		let (generation, wrapped) = match generation.checked_add(step) {
			Some(generation) => (generation, false),
			None if cfg!(target_pointer_width = "32") => {
				info!("ASID generation overflown");
				(step, true)
			}
			None => panic!("ASID generation counter overflow"),
		};

		// Plain store: the lock holder is the only writer.
		state.generation.store(generation, Ordering::Relaxed);

		inner.map.clear_all();

		for cpu in 0..self.num_cpus {
			let mut asid = state.active[cpu].swap(0, Ordering::Relaxed);

			// A CPU that went through an earlier rollover without
			// switching since still runs on its reserved ASID; that slot
			// is the only trace of the address space it executes.
			if asid == 0 {
				asid = inner.reserved[cpu];
			}
			inner.map.set(asid & self.asid_mask());
			inner.reserved[cpu] = asid;
		}

		if wrapped {
			self.generation_overflow_fixup(state, inner);
		}

		self.flush_tlb_all();
	}

	/// After a 32-bit generation wrap, slots from before the wrap could
	/// alias the restarted counter. Walk every live address space: carry
	/// the reserved ones into the fresh epoch, unassign the rest.
	fn generation_overflow_fixup(&self, state: &AsidState, inner: &mut AsidInner) {
		let mask = self.asid_mask();
		let generation = state.generation.load(Ordering::Relaxed);

		let walked = smp::for_each_address_space(&mut |address_space| {
			let asid = address_space.asid.load(Ordering::Relaxed);
			if asid == 0 {
				return;
			}

			let newasid = generation | (asid & mask);
			let slot = if check_reserved(inner, asid, newasid) {
				newasid
			} else {
				0
			};
			address_space.asid.store(slot, Ordering::Relaxed);
		});

		assert!(
			walked,
			"ASID generation wrapped with no address-space walker registered"
		);
	}
}

static MM_CONTEXT: OnceCell<MmContext> = OnceCell::new();

/// Builds the global context from the boot CPU's probe and the kernel
/// command line. Call once, early, on the boot CPU.
pub fn init(num_cpus: usize, cmdline: Option<&str>) {
	assert!(
		MM_CONTEXT.set(MmContext::init(num_cpus, cmdline)).is_ok(),
		"ASID allocator is already initialised"
	);
}

pub fn get() -> &'static MmContext {
	MM_CONTEXT.get().expect("ASID allocator is not initialised")
}
