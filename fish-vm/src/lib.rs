pub mod codebox;
pub mod jit;
pub mod stack;
pub mod vm;

#[cfg(all(target_arch = "x86_64", unix, not(target_os = "macos")))]
pub mod asm;

pub use codebox::{steer, Codebox, Direction, EndState, FishNumber, IpState};
pub use jit::{jit_supported, JitAttempt, JitConfig, JitEngine, JitError};
pub use stack::{RawStack, Stack, Value, CELL_SIZE, TAG_FLOAT, TAG_INT};
pub use vm::{Vm, VmError, VmResult};

#[cfg(all(target_arch = "x86_64", unix, not(target_os = "macos")))]
pub use jit::{BlockEntry, CompiledBlock};
