#![allow(dead_code)]

use std::cell::Cell;
use std::collections::HashSet;

use ehci_urb::pool::ArenaPool;
use ehci_urb::qh::{QhHw, QH_HW_SIZE};
use ehci_urb::qtd::{QtdHw, LINK_ADDR_MASK, LINK_TERMINATE, QTD_HW_SIZE};
use ehci_urb::{DescriptorPool, DmaDirection, DmaError, DmaMapper, DmaMapping, IdentityMapper};

/// Pool wrapper that starts failing allocations after an armed number of
/// successes, for exercising every unwind path in turn.
pub struct FailingPool {
    inner: ArenaPool,
    remaining: Cell<Option<usize>>,
}

impl FailingPool {
    pub fn new(inner: ArenaPool) -> Self {
        Self {
            inner,
            remaining: Cell::new(None),
        }
    }

    /// Let the next `n` allocations succeed, then fail every one after.
    pub fn arm(&self, n: usize) {
        self.remaining.set(Some(n));
    }

    pub fn disarm(&self) {
        self.remaining.set(None);
    }

    pub fn inner(&self) -> &ArenaPool {
        &self.inner
    }
}

impl DescriptorPool for FailingPool {
    fn allocate(&mut self, size: usize) -> Option<u32> {
        match self.remaining.get() {
            Some(0) => None,
            Some(n) => {
                self.remaining.set(Some(n - 1));
                self.inner.allocate(size)
            }
            None => self.inner.allocate(size),
        }
    }

    fn free(&mut self, addr: u32, size: usize) {
        self.inner.free(addr, size);
    }

    fn read(&self, addr: u32, buf: &mut [u8]) {
        self.inner.read(addr, buf);
    }

    fn write(&mut self, addr: u32, bytes: &[u8]) {
        self.inner.write(addr, bytes);
    }
}

/// Mapper wrapper that truncates every mapping beyond a byte limit, the way
/// a platform under bounce-buffer pressure would.
pub struct TruncatingMapper {
    inner: IdentityMapper,
    limit: usize,
}

impl TruncatingMapper {
    pub fn new(limit: usize) -> Self {
        Self {
            inner: IdentityMapper::new(),
            limit,
        }
    }

    pub fn outstanding(&self) -> usize {
        self.inner.outstanding()
    }
}

impl DmaMapper for TruncatingMapper {
    fn map(
        &mut self,
        direction: DmaDirection,
        host: u64,
        len: usize,
    ) -> Result<DmaMapping, DmaError> {
        let mut mapping = self.inner.map(direction, host, len)?;
        mapping.len = mapping.len.min(self.limit);
        Ok(mapping)
    }

    fn unmap(&mut self, mapping: DmaMapping) {
        self.inner.unmap(mapping);
    }
}

/// Mapper that refuses every mapping outright.
#[derive(Default)]
pub struct ExhaustedMapper {
    outstanding: usize,
}

impl ExhaustedMapper {
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }
}

impl DmaMapper for ExhaustedMapper {
    fn map(
        &mut self,
        _direction: DmaDirection,
        _host: u64,
        _len: usize,
    ) -> Result<DmaMapping, DmaError> {
        Err(DmaError::Exhausted)
    }

    fn unmap(&mut self, _mapping: DmaMapping) {
        panic!("nothing was ever mapped");
    }
}

/// Walk a descriptor chain the way the controller does: start at the queue
/// head's overlay next pointer and follow each descriptor's next pointer
/// until a terminate sentinel, asserting no descriptor is visited twice.
pub fn walk_chain<P: DescriptorPool>(pool: &P, qh_addr: u32) -> Vec<(u32, QtdHw)> {
    let mut image = [0u8; QH_HW_SIZE];
    pool.read(qh_addr, &mut image);
    let qh = QhHw::unpack(&image);

    let mut visited = HashSet::new();
    let mut out = Vec::new();
    let mut link = qh.overlay.next;
    while link & LINK_TERMINATE == 0 {
        let addr = link & LINK_ADDR_MASK;
        assert!(visited.insert(addr), "cycle in qTD chain at {addr:#x}");
        let mut img = [0u8; QTD_HW_SIZE];
        pool.read(addr, &mut img);
        let hw = QtdHw::unpack(&img);
        link = hw.next;
        out.push((addr, hw));
    }
    out
}

/// Read the queue head image back out of pool memory.
pub fn read_qh<P: DescriptorPool>(pool: &P, qh_addr: u32) -> QhHw {
    let mut image = [0u8; QH_HW_SIZE];
    pool.read(qh_addr, &mut image);
    QhHw::unpack(&image)
}
