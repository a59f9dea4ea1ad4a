//! Software accelerator: a bounded device-memory arena, RAII buffers, and
//! ordered command streams executed on a worker thread.

mod memory;
mod stream;

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::compiler::SIM_TARGET;

pub use memory::DeviceMemory;
pub use stream::{Kernel, Stream};

/// Accelerator status codes, numbered like the vendor runtime's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceErrorCode {
    InvalidValue,
    MemoryAllocation,
    InvalidDevicePointer,
    NotReady,
    IllegalAddress,
    LaunchFailure,
}

impl DeviceErrorCode {
    pub fn as_raw(self) -> i32 {
        match self {
            DeviceErrorCode::InvalidValue => 1,
            DeviceErrorCode::MemoryAllocation => 2,
            DeviceErrorCode::InvalidDevicePointer => 17,
            DeviceErrorCode::NotReady => 600,
            DeviceErrorCode::IllegalAddress => 700,
            DeviceErrorCode::LaunchFailure => 719,
        }
    }

    fn name(self) -> &'static str {
        match self {
            DeviceErrorCode::InvalidValue => "invalid value",
            DeviceErrorCode::MemoryAllocation => "out of memory",
            DeviceErrorCode::InvalidDevicePointer => "invalid device pointer",
            DeviceErrorCode::NotReady => "not ready",
            DeviceErrorCode::IllegalAddress => "illegal address",
            DeviceErrorCode::LaunchFailure => "unspecified launch failure",
        }
    }
}

impl fmt::Display for DeviceErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.name(), self.as_raw())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("accelerator call `{operation}` failed: {code}")]
pub struct DeviceError {
    pub operation: String,
    pub code: DeviceErrorCode,
}

impl DeviceError {
    pub fn new(operation: impl Into<String>, code: DeviceErrorCode) -> Self {
        Self {
            operation: operation.into(),
            code,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub ordinal: u32,
    pub memory_limit_bytes: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            ordinal: 0,
            memory_limit_bytes: 4 << 30,
        }
    }
}

/// Opaque device address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DevicePtr(pub(crate) u64);

impl fmt::Display for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Handle to one simulated device. Clones refer to the same memory.
#[derive(Debug, Clone)]
pub struct Device {
    ordinal: u32,
    memory: Arc<Mutex<DeviceMemory>>,
}

impl Device {
    pub fn new(config: &DeviceConfig) -> Self {
        debug!(
            ordinal = config.ordinal,
            capacity = config.memory_limit_bytes,
            "opening device"
        );
        Self {
            ordinal: config.ordinal,
            memory: Arc::new(Mutex::new(DeviceMemory::new(config.memory_limit_bytes))),
        }
    }

    pub fn with_capacity(bytes: usize) -> Self {
        Self::new(&DeviceConfig {
            memory_limit_bytes: bytes,
            ..DeviceConfig::default()
        })
    }

    pub fn ordinal(&self) -> u32 {
        self.ordinal
    }

    /// Plan target this device executes.
    pub fn target(&self) -> &'static str {
        SIM_TARGET
    }

    pub fn memory_used(&self) -> usize {
        self.memory.lock().used()
    }

    pub fn malloc(&self, bytes: usize) -> Result<DeviceBuffer, DeviceError> {
        let ptr = self
            .memory
            .lock()
            .allocate(bytes)
            .map_err(|code| DeviceError::new("malloc", code))?;
        debug!(%ptr, bytes, "allocated device buffer");
        Ok(DeviceBuffer {
            ptr,
            len: bytes,
            memory: Arc::clone(&self.memory),
            live: true,
        })
    }

    pub fn create_stream(&self) -> Result<Stream, DeviceError> {
        Stream::spawn(self.ordinal, Arc::clone(&self.memory))
    }
}

/// Exclusive owner of one device allocation; freed on drop.
#[derive(Debug)]
pub struct DeviceBuffer {
    ptr: DevicePtr,
    len: usize,
    memory: Arc<Mutex<DeviceMemory>>,
    live: bool,
}

impl DeviceBuffer {
    pub fn ptr(&self) -> DevicePtr {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Synchronous host-to-device copy into the start of the buffer.
    pub fn copy_from_host(&self, data: &[u8]) -> Result<(), DeviceError> {
        let mut memory = self.memory.lock();
        let region = memory
            .region_mut(self.ptr)
            .map_err(|code| DeviceError::new("memcpy_htod", code))?;
        let dst = region
            .get_mut(..data.len())
            .ok_or_else(|| DeviceError::new("memcpy_htod", DeviceErrorCode::InvalidValue))?;
        dst.copy_from_slice(data);
        Ok(())
    }

    /// Synchronous device-to-host copy from the start of the buffer.
    pub fn copy_to_host(&self, out: &mut [u8]) -> Result<(), DeviceError> {
        let memory = self.memory.lock();
        let region = memory
            .region(self.ptr)
            .map_err(|code| DeviceError::new("memcpy_dtoh", code))?;
        let src = region
            .get(..out.len())
            .ok_or_else(|| DeviceError::new("memcpy_dtoh", DeviceErrorCode::InvalidValue))?;
        out.copy_from_slice(src);
        Ok(())
    }

    /// Free the allocation now and report failures instead of swallowing them.
    pub fn release(mut self) -> Result<(), DeviceError> {
        self.live = false;
        self.memory
            .lock()
            .free(self.ptr)
            .map_err(|code| DeviceError::new("free", code))
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        if self.live {
            let _ = self.memory.lock().free(self.ptr);
        }
    }
}
