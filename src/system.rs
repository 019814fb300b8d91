use crate::config::{Config, NUM_CORES};
use crate::ipc::{InterruptLine, IosHardware, IpcKernelDriver, IpcLoaderDriver, RamPartitionId};
use crate::jit::CodeCache;
use crate::memory::{ProcessRole, VirtualMemoryManager};
use crate::Error;
use alloc::sync::Arc;
use alloc::vec::Vec;

/// Everything that belongs to one emulated hardware core.
///
/// Only the core's own thread touches it, the interrupt line is the one part
/// shared with the microkernel.
#[derive(Debug)]
pub struct Core {
    id: usize,
    interrupts: Arc<InterruptLine>,
    kernel: IpcKernelDriver,
    loader: IpcLoaderDriver,
}

impl Core {
    fn new(id: usize, config: &Config, hardware: Arc<dyn IosHardware>) -> crate::Result<Self> {
        let interrupts = Arc::new(InterruptLine::new());
        let mut kernel = IpcKernelDriver::new(id, config.ipc_timeout, hardware, interrupts.clone());
        kernel.init()?;
        kernel.open_driver()?;

        let mut loader = IpcLoaderDriver::new(id);
        loader.init()?;
        loader.open_driver()?;

        Ok(Self {
            id,
            interrupts,
            kernel,
            loader,
        })
    }

    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn interrupt_line(&self) -> &Arc<InterruptLine> {
        &self.interrupts
    }

    pub fn kernel(&self) -> &IpcKernelDriver {
        &self.kernel
    }

    pub fn kernel_mut(&mut self) -> &mut IpcKernelDriver {
        &mut self.kernel
    }

    pub fn loader(&self) -> &IpcLoaderDriver {
        &self.loader
    }

    /// Both drivers at once, the loader submits through the kernel driver.
    pub fn drivers_mut(&mut self) -> (&mut IpcKernelDriver, &mut IpcLoaderDriver) {
        (&mut self.kernel, &mut self.loader)
    }

    /// The core's interrupt handler: delivers pending replies, then lets the
    /// loader pick up whatever was routed to it.
    ///
    /// Loader replies can already be queued when nothing is pending, a sync
    /// kernel call drains every interrupt while it waits.
    ///
    /// # Errors
    ///
    /// Passes on what the loader fails with while completing its requests.
    pub fn handle_interrupts(&mut self) -> crate::Result<usize> {
        let handled = self.kernel.handle_interrupts();
        if handled > 0 || !self.kernel.loader_reply_fifo(RamPartitionId::Loader).is_empty() {
            self.loader.process_replies(&mut self.kernel)?;
        }
        Ok(handled)
    }
}

/// The execution engine of one emulated console.
#[derive(Debug)]
pub struct System {
    config: Config,
    memory: VirtualMemoryManager,
    code_cache: CodeCache,
    cores: Vec<Core>,
}

impl System {
    /// Brings up the memory manager, the code cache, and open IPC drivers on
    /// every configured core.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for a core count outside of
    /// `1..=NUM_CORES`, or whatever reserving the code cache fails with.
    pub fn new(config: Config, hardware: Arc<dyn IosHardware>) -> crate::Result<Self> {
        if config.cores == 0 || config.cores > NUM_CORES {
            return Err(Error::InvalidArgument);
        }

        let memory = VirtualMemoryManager::new(ProcessRole::ForegroundApp);
        let code_cache = CodeCache::new(&config.code_cache)?;
        let cores = (0..config.cores)
            .map(|id| Core::new(id, &config, hardware.clone()))
            .collect::<crate::Result<Vec<_>>>()?;

        tracing::debug!(cores = cores.len(), "system up");
        Ok(Self {
            config,
            memory,
            code_cache,
            cores,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn memory(&self) -> &VirtualMemoryManager {
        &self.memory
    }

    pub fn code_cache(&self) -> &CodeCache {
        &self.code_cache
    }

    pub fn code_cache_mut(&mut self) -> &mut CodeCache {
        &mut self.code_cache
    }

    pub fn core(&self, id: usize) -> Option<&Core> {
        self.cores.get(id)
    }

    pub fn core_mut(&mut self, id: usize) -> Option<&mut Core> {
        self.cores.get_mut(id)
    }

    pub fn cores(&self) -> &[Core] {
        &self.cores
    }

    /// Per-core contexts for handing out to core threads.
    pub fn cores_mut(&mut self) -> &mut [Core] {
        &mut self.cores
    }

    /// Splits the system into the parts core threads share and the parts each
    /// core owns.
    pub fn split_mut(&mut self) -> (&CodeCache, &VirtualMemoryManager, &mut [Core]) {
        (&self.code_cache, &self.memory, &mut self.cores)
    }
}
