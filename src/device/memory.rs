use std::collections::HashMap;
use std::fmt;

use super::{DeviceErrorCode, DevicePtr};

const ALIGNMENT: u64 = 256;

/// Bounded arena backing one simulated device.
pub struct DeviceMemory {
    capacity: usize,
    used: usize,
    next_address: u64,
    regions: HashMap<u64, Vec<u8>>,
}

impl DeviceMemory {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            used: 0,
            // Keep 0 free so a null pointer is never a valid region.
            next_address: ALIGNMENT,
            regions: HashMap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub(crate) fn allocate(&mut self, bytes: usize) -> Result<DevicePtr, DeviceErrorCode> {
        if bytes == 0 {
            return Err(DeviceErrorCode::InvalidValue);
        }
        if self.capacity - self.used < bytes {
            return Err(DeviceErrorCode::MemoryAllocation);
        }
        let address = self.next_address;
        let span = (bytes as u64).div_ceil(ALIGNMENT) * ALIGNMENT;
        self.next_address = self
            .next_address
            .checked_add(span)
            .ok_or(DeviceErrorCode::MemoryAllocation)?;
        self.regions.insert(address, vec![0; bytes]);
        self.used += bytes;
        Ok(DevicePtr(address))
    }

    pub(crate) fn free(&mut self, ptr: DevicePtr) -> Result<(), DeviceErrorCode> {
        let region = self
            .regions
            .remove(&ptr.0)
            .ok_or(DeviceErrorCode::InvalidDevicePointer)?;
        self.used -= region.len();
        Ok(())
    }

    pub fn region(&self, ptr: DevicePtr) -> Result<&[u8], DeviceErrorCode> {
        self.regions
            .get(&ptr.0)
            .map(Vec::as_slice)
            .ok_or(DeviceErrorCode::IllegalAddress)
    }

    pub fn region_mut(&mut self, ptr: DevicePtr) -> Result<&mut [u8], DeviceErrorCode> {
        self.regions
            .get_mut(&ptr.0)
            .map(Vec::as_mut_slice)
            .ok_or(DeviceErrorCode::IllegalAddress)
    }

    /// Borrow a source region and a distinct destination region at once.
    pub fn with_src_dst<T>(
        &mut self,
        src: DevicePtr,
        dst: DevicePtr,
        f: impl FnOnce(&[u8], &mut [u8]) -> Result<T, DeviceErrorCode>,
    ) -> Result<T, DeviceErrorCode> {
        if src == dst {
            return Err(DeviceErrorCode::InvalidValue);
        }
        let mut target = self
            .regions
            .remove(&dst.0)
            .ok_or(DeviceErrorCode::IllegalAddress)?;
        let result = match self.regions.get(&src.0) {
            Some(source) => f(source, &mut target),
            None => Err(DeviceErrorCode::IllegalAddress),
        };
        self.regions.insert(dst.0, target);
        result
    }
}

impl fmt::Debug for DeviceMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceMemory")
            .field("capacity", &self.capacity)
            .field("used", &self.used)
            .field("regions", &self.regions.len())
            .finish()
    }
}
