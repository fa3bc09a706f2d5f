use std::collections::HashSet;

use crate::codebox::IpState;

#[cfg(all(target_arch = "x86_64", unix, not(target_os = "macos")))]
use std::collections::HashMap;

#[cfg(all(target_arch = "x86_64", unix, not(target_os = "macos")))]
use crate::asm::ExecutableMemory;
#[cfg(all(target_arch = "x86_64", unix, not(target_os = "macos")))]
use crate::codebox::{Codebox, EndState};
#[cfg(all(target_arch = "x86_64", unix, not(target_os = "macos")))]
use crate::stack::RawStack;

#[cfg(all(target_arch = "x86_64", unix, not(target_os = "macos")))]
pub mod x86_64;

pub fn jit_supported() -> bool {
    cfg!(all(target_arch = "x86_64", unix, not(target_os = "macos")))
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JitConfig {
    pub enabled: bool,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            enabled: jit_supported(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JitError {
    UnknownOpcode(i64),
    UnterminatedString,
    EmptyCodebox,
    FinishedState,
    Asm(String),
    Map(String),
}

impl std::fmt::Display for JitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JitError::UnknownOpcode(opcode) => {
                write!(f, "unknown opcode {opcode} (0x{opcode:X})")
            }
            JitError::UnterminatedString => write!(f, "unterminated string literal"),
            JitError::EmptyCodebox => write!(f, "cannot trace an empty codebox"),
            JitError::FinishedState => write!(f, "cannot trace from a finished state"),
            JitError::Asm(message) => write!(f, "assembler error: {message}"),
            JitError::Map(message) => write!(f, "executable mapping error: {message}"),
        }
    }
}

impl std::error::Error for JitError {}

#[cfg(all(target_arch = "x86_64", unix, not(target_os = "macos")))]
pub type BlockEntry = unsafe extern "C" fn(*mut RawStack, *mut EndState) -> i32;

/// One compiled trace. Owns its executable mapping; dropping the block
/// unmaps it.
#[cfg(all(target_arch = "x86_64", unix, not(target_os = "macos")))]
pub struct CompiledBlock {
    pub(crate) entry: BlockEntry,
    pub(crate) code: Vec<u8>,
    pub(crate) max_stack_change: usize,
    _memory: ExecutableMemory,
}

#[cfg(all(target_arch = "x86_64", unix, not(target_os = "macos")))]
impl CompiledBlock {
    pub(crate) fn new(
        memory: ExecutableMemory,
        entry: BlockEntry,
        code: Vec<u8>,
        max_stack_change: usize,
    ) -> CompiledBlock {
        CompiledBlock {
            entry,
            code,
            max_stack_change,
            _memory: memory,
        }
    }

    pub fn entry(&self) -> BlockEntry {
        self.entry
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    pub fn size(&self) -> usize {
        self.code.len()
    }

    /// Upper bound on the stack growth executing this block can cause; the
    /// caller reserves this many cells before entering.
    pub fn max_stack_change(&self) -> usize {
        self.max_stack_change
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JitAttempt {
    pub state: IpState,
    pub result: Result<(), JitError>,
}

/// Caches compiled blocks per start state, remembers refused states and
/// records every compile attempt with its outcome.
pub struct JitEngine {
    config: JitConfig,
    #[cfg(all(target_arch = "x86_64", unix, not(target_os = "macos")))]
    blocks: HashMap<IpState, CompiledBlock>,
    blocked: HashSet<IpState>,
    attempts: Vec<JitAttempt>,
    codebox_version: u64,
    executions: u64,
}

impl Default for JitEngine {
    fn default() -> Self {
        Self::new(JitConfig::default())
    }
}

impl JitEngine {
    pub fn new(config: JitConfig) -> JitEngine {
        JitEngine {
            config,
            #[cfg(all(target_arch = "x86_64", unix, not(target_os = "macos")))]
            blocks: HashMap::new(),
            blocked: HashSet::new(),
            attempts: Vec::new(),
            codebox_version: 0,
            executions: 0,
        }
    }

    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: JitConfig) {
        self.config = config;
        #[cfg(all(target_arch = "x86_64", unix, not(target_os = "macos")))]
        self.blocks.clear();
        self.blocked.clear();
        self.attempts.clear();
        self.executions = 0;
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled && jit_supported()
    }

    pub fn attempts(&self) -> &[JitAttempt] {
        &self.attempts
    }

    pub fn executions(&self) -> u64 {
        self.executions
    }

    pub fn note_execution(&mut self) {
        self.executions = self.executions.saturating_add(1);
    }

    /// Returns the block for `state`, compiling it on first sight. Runtime
    /// `p` stores bump the codebox version; a version change flushes the
    /// cache because cached traces may bake stale cell values.
    #[cfg(all(target_arch = "x86_64", unix, not(target_os = "macos")))]
    pub fn block_for(&mut self, codebox: &Codebox, state: IpState) -> Option<&CompiledBlock> {
        if !self.config.enabled {
            return None;
        }
        if codebox.version() != self.codebox_version {
            self.blocks.clear();
            self.blocked.clear();
            self.codebox_version = codebox.version();
        }
        if self.blocked.contains(&state) {
            return None;
        }
        if !self.blocks.contains_key(&state) {
            match x86_64::compile(codebox, state) {
                Ok(block) => {
                    tracing::debug!(
                        row = state.row,
                        col = state.col,
                        direction = ?state.direction,
                        bytes = block.size(),
                        max_stack_change = block.max_stack_change(),
                        "compiled trace"
                    );
                    self.attempts.push(JitAttempt {
                        state,
                        result: Ok(()),
                    });
                    self.blocks.insert(state, block);
                }
                Err(error) => {
                    tracing::debug!(
                        row = state.row,
                        col = state.col,
                        direction = ?state.direction,
                        %error,
                        "trace refused"
                    );
                    self.attempts.push(JitAttempt {
                        state,
                        result: Err(error),
                    });
                    self.blocked.insert(state);
                    return None;
                }
            }
        }
        self.blocks.get(&state)
    }

    pub fn dump_text(&self) -> String {
        let mut out = String::new();
        out.push_str("trace-jit:\n");
        out.push_str(&format!("  arch: {}\n", std::env::consts::ARCH));
        out.push_str(&format!("  supported: {}\n", jit_supported()));
        out.push_str(&format!("  enabled: {}\n", self.config.enabled));
        out.push_str(&format!("  block executions: {}\n", self.executions));

        #[cfg(all(target_arch = "x86_64", unix, not(target_os = "macos")))]
        {
            out.push_str(&format!("  compiled blocks: {}\n", self.blocks.len()));
            let mut entries: Vec<(&IpState, &CompiledBlock)> = self.blocks.iter().collect();
            entries.sort_by_key(|(state, _)| (state.row, state.col, state.direction.code()));
            for (state, block) in entries {
                out.push_str(&format!(
                    "  block ({},{},{:?}) bytes={} max_stack_change={}\n",
                    state.row,
                    state.col,
                    state.direction,
                    block.size(),
                    block.max_stack_change()
                ));
                out.push_str("    code:");
                for byte in block.code() {
                    out.push_str(&format!(" {byte:02X}"));
                }
                out.push('\n');
            }
        }
        #[cfg(not(all(target_arch = "x86_64", unix, not(target_os = "macos"))))]
        {
            out.push_str("  compiled blocks: 0\n");
        }

        let mut refused = 0usize;
        for attempt in &self.attempts {
            if let Err(reason) = &attempt.result {
                refused = refused.saturating_add(1);
                out.push_str(&format!(
                    "  refused ({},{},{:?}) reason={}\n",
                    attempt.state.row, attempt.state.col, attempt.state.direction, reason
                ));
            }
        }
        out.push_str(&format!("  refused attempts: {refused}\n"));
        out
    }
}
