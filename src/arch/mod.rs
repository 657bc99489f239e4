// Platform-specific implementations of the hardware maintenance primitives.

#[cfg(target_arch = "riscv64")]
pub mod riscv64;

#[cfg(target_arch = "riscv64")]
pub use self::riscv64::*;

// Anything but a RISC-V target gets a recording stand-in, which also
// drives the unit tests.
#[cfg(not(target_arch = "riscv64"))]
pub mod mock;

#[cfg(not(target_arch = "riscv64"))]
pub use self::mock::*;
