//! Available-memory probe used to cut archive scans short under pressure.

use parking_lot::Mutex;
use sysinfo::System;

pub trait MemoryProbe: Send + Sync {
    /// Bytes of memory currently available to the process.
    fn available_bytes(&self) -> u64;
}

/// Reads available memory from the operating system.
pub struct SystemMemory {
    system: Mutex<System>,
}

impl SystemMemory {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SystemMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SystemMemory {
    fn available_bytes(&self) -> u64 {
        let mut system = self.system.lock();
        system.refresh_memory();
        system.available_memory()
    }
}
