use core::time::Duration;

/// Number of hardware cores of the emulated console.
pub const NUM_CORES: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// How many emulated cores get their own IPC drivers and interrupt line.
    pub cores: usize,
    /// How long synchronous IPC calls wait for their reply.
    pub ipc_timeout: Duration,
    pub code_cache: CodeCacheConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cores: NUM_CORES,
            ipc_timeout: Duration::from_millis(35),
            code_cache: CodeCacheConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeCacheConfig {
    /// Host address space reserved for generated code.
    pub code_reserve: usize,
    /// Host address space reserved for block metadata such as unwind info.
    pub data_reserve: usize,
    /// Granularity at which reserved memory is committed.
    pub commit_step: usize,
    pub max_blocks: usize,
}

impl Default for CodeCacheConfig {
    fn default() -> Self {
        Self {
            code_reserve: 0x4000_0000,
            data_reserve: 0x1000_0000,
            commit_step: 0x10_0000,
            max_blocks: 0x40_0000,
        }
    }
}

impl CodeCacheConfig {
    /// A few megabytes, enough for tests and tooling.
    pub fn small() -> Self {
        Self {
            code_reserve: 0x40_0000,
            data_reserve: 0x10_0000,
            commit_step: 0x1_0000,
            max_blocks: 0x1_0000,
        }
    }
}
