// Architecture-specific code
//
// `riscv64` is the hardware port. `host` runs the kernel without hardware,
// for tests and simulation.

pub mod trap;

#[cfg(target_arch = "riscv64")]
pub mod riscv64;

#[cfg(not(target_os = "none"))]
pub mod host;
