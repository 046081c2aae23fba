//! Engine implementations based on Thompson's construction: the bytecode
//! form of the NFA, the arena the executors run in, the interpreter, and
//! (on x86-64) the JIT.

pub mod arena;
pub mod bytecode;
#[cfg(target_arch = "x86_64")]
pub mod pike_jit;
pub mod pike_vm;
