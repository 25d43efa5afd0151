//! Bus-master mapping of user buffers.
//!
//! Setup and data buffers are supplied by the caller in host memory; before
//! the controller may touch them they must be mapped for bus-master access,
//! yielding the bus address the hardware DMAs through and an opaque handle
//! for the eventual unmap. Software keeps using the host address, hardware
//! the bus address — the pair is produced once at mapping time and carried
//! together as a [`MappedBuffer`], never recomputed.
//!
//! A mapping can come back shorter than requested (bounce-buffer pressure,
//! scatter limits). The URB layer treats a truncated mapping the same as a
//! failed one: unmap and unwind.

use thiserror::Error;

/// Which way the bus master moves data through a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaDirection {
    /// Device reads from the buffer (OUT data, setup packets).
    DeviceRead,
    /// Device writes into the buffer (IN data).
    DeviceWrite,
}

/// A live bus-master mapping: the bus address the controller uses, the
/// length actually mapped, and the platform handle to release it with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaMapping {
    pub bus: u64,
    pub len: usize,
    pub handle: u64,
}

/// Errors produced by [`DmaMapper::map`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DmaError {
    #[error("no bus-master mapping resources available")]
    Exhausted,
}

/// Platform service that maps host buffers for bus-master access.
pub trait DmaMapper {
    /// Map `len` bytes of host memory at `host` for device access.
    ///
    /// May succeed with `DmaMapping::len < len` when the platform cannot map
    /// the whole region contiguously; the caller decides whether a truncated
    /// mapping is usable (the URB layer does not).
    fn map(&mut self, direction: DmaDirection, host: u64, len: usize)
        -> Result<DmaMapping, DmaError>;

    /// Release a mapping previously returned by `map`.
    fn unmap(&mut self, mapping: DmaMapping);
}

/// The host buffer an URB owns for the lifetime of its mapping: host-side
/// address plus the live bus mapping of the same bytes.
#[derive(Debug, Clone, Copy)]
pub struct MappedBuffer {
    pub host: u64,
    pub mapping: DmaMapping,
}

/// Identity mapper for platforms whose bus view of memory is 1:1 (no IOMMU,
/// cache-coherent DMA), which is the common embedded EHCI arrangement.
///
/// Outstanding handles are tracked so embedders and tests can assert that
/// every mapping taken was released.
#[derive(Debug, Default)]
pub struct IdentityMapper {
    next_handle: u64,
    outstanding: Vec<u64>,
}

impl IdentityMapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of mappings taken but not yet released.
    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }
}

impl DmaMapper for IdentityMapper {
    fn map(
        &mut self,
        _direction: DmaDirection,
        host: u64,
        len: usize,
    ) -> Result<DmaMapping, DmaError> {
        let handle = self.next_handle;
        self.next_handle += 1;
        self.outstanding.push(handle);
        Ok(DmaMapping {
            bus: host,
            len,
            handle,
        })
    }

    fn unmap(&mut self, mapping: DmaMapping) {
        let pos = self
            .outstanding
            .iter()
            .position(|&h| h == mapping.handle)
            .expect("unmap of unknown DMA handle");
        self.outstanding.swap_remove(pos);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_mapper_tracks_outstanding_handles() {
        let mut mapper = IdentityMapper::new();
        let a = mapper.map(DmaDirection::DeviceRead, 0x1000, 8).unwrap();
        let b = mapper.map(DmaDirection::DeviceWrite, 0x2000, 512).unwrap();
        assert_eq!(a.bus, 0x1000);
        assert_eq!(b.len, 512);
        assert_ne!(a.handle, b.handle);
        assert_eq!(mapper.outstanding(), 2);

        mapper.unmap(a);
        mapper.unmap(b);
        assert_eq!(mapper.outstanding(), 0);
    }

    #[test]
    #[should_panic(expected = "unknown DMA handle")]
    fn double_unmap_is_a_caller_bug() {
        let mut mapper = IdentityMapper::new();
        let m = mapper.map(DmaDirection::DeviceRead, 0, 4).unwrap();
        mapper.unmap(m);
        mapper.unmap(m);
    }
}
