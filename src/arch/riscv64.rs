//! `sfence.vma`, `fence.i` and `satp` access, plus the SBI remote fences.

use core::arch::asm;

use riscv::asm::{fence_i, sfence_vma, sfence_vma_all};
use riscv::register::satp;
use riscv::register::satp::Satp;
use sbi_rt::HartMask;

/// Offset of the ASID field within `satp`.
const SATP_ASID_SHIFT: usize = 44;

/// Width mask of the ASID field.
const SATP_ASID_MASK: usize = 0xffff;

/// Paging mode installed on every address-space switch.
const SATP_MODE_SV39: usize = 0x8 << 60;

/// ASID bits as left in `satp` by the boot code, which sets every
/// implemented bit. Only meaningful before the first `satp` write on this
/// hart.
#[inline]
pub fn read_boot_asid_bits() -> usize {
	(satp::read().bits() >> SATP_ASID_SHIFT) & SATP_ASID_MASK
}

/// Installs a root page table and ASID on this hart.
#[inline]
pub fn write_satp(root_pfn: usize, asid: usize) {
	unsafe {
		satp::write(Satp::from_bits(
			SATP_MODE_SV39 | ((asid & SATP_ASID_MASK) << SATP_ASID_SHIFT) | root_pfn,
		));
	}
}

/// Flushes the whole TLB of this hart, all ASIDs included.
#[inline]
pub fn local_flush_tlb_all() {
	sfence_vma_all();
}

/// Flushes every non-global entry of one ASID on this hart.
#[inline]
pub fn local_flush_tlb_asid(asid: usize) {
	unsafe {
		asm!("sfence.vma x0, {asid}", asid = in(reg) asid, options(nostack, preserves_flags));
	}
}

/// Flushes one page of one ASID on this hart.
#[inline]
pub fn local_flush_tlb_page(addr: usize, asid: usize) {
	sfence_vma(asid, addr);
}

/// Flushes one page in every address space; used for global (kernel)
/// mappings.
#[inline]
pub fn local_flush_tlb_kernel_page(addr: usize) {
	unsafe {
		asm!("sfence.vma {addr}", addr = in(reg) addr, options(nostack, preserves_flags));
	}
}

/// Invalidates the instruction cache of this hart.
#[inline]
pub fn local_flush_icache() {
	fence_i();
}

pub fn remote_sfence_vma(hart_mask: usize, start: usize, size: usize) {
	sbi_rt::remote_sfence_vma(HartMask::from_mask_base(hart_mask, 0), start, size).unwrap();
}

pub fn remote_sfence_vma_asid(hart_mask: usize, start: usize, size: usize, asid: usize) {
	sbi_rt::remote_sfence_vma_asid(HartMask::from_mask_base(hart_mask, 0), start, size, asid)
		.unwrap();
}

pub fn remote_fence_i(hart_mask: usize) {
	sbi_rt::remote_fence_i(HartMask::from_mask_base(hart_mask, 0)).unwrap();
}
