//! Queue element transfer descriptor (qTD) construction.
//!
//! A qTD is the hardware's unit of data movement: one token (status, PID,
//! data toggle, byte count) plus up to [`QTD_PAGE_POINTERS`] physical page
//! pointers. The controller fetches qTD images from DMA-reachable memory, so
//! the 52-byte wire layout is a bit-exact contract — [`QtdHw`] keeps the raw
//! little-endian dwords and packs/unpacks them explicitly rather than
//! relying on struct layout.
//!
//! [`Qtd`] is the software side of one descriptor: the pool record holding
//! the image, plus the host-address/length bookkeeping the completion path
//! needs for copy-back.

use bitflags::bitflags;

use crate::pool::DescriptorPool;
use crate::Pid;

/// Size of the qTD image in pool memory (three dwords of token/links plus
/// five 64-bit-extended buffer pointers).
pub const QTD_HW_SIZE: usize = 52;

/// Number of buffer page pointers per qTD.
pub const QTD_PAGE_POINTERS: usize = 5;

/// Hardware buffer page size. Page pointer 0 carries an offset; each page
/// window runs from that offset to the page boundary.
pub const QTD_PAGE_SIZE: usize = 4096;

/// Offset bits within a buffer page pointer.
pub const QTD_PAGE_OFFSET_MASK: usize = QTD_PAGE_SIZE - 1;

/// Terminate bit of a next/alternate-next link pointer: no successor.
pub const LINK_TERMINATE: u32 = 1;

/// Address bits of a link pointer (32-byte-aligned physical address).
pub const LINK_ADDR_MASK: u32 = 0xffff_ffe0;

/// Encode a valid (non-terminate) link pointer to a descriptor record.
pub const fn link_to(addr: u32) -> u32 {
    addr & LINK_ADDR_MASK
}

/// Error counter the controller decrements on transaction errors.
pub const QTD_MAX_ERR: u32 = 3;

// qTD token field layout.
pub const TOKEN_STATUS_MASK: u32 = 0xff;
pub const TOKEN_PID_SHIFT: u32 = 8;
pub const TOKEN_PID_MASK: u32 = 0x3 << TOKEN_PID_SHIFT;
pub const TOKEN_CERR_SHIFT: u32 = 10;
pub const TOKEN_CPAGE_SHIFT: u32 = 12;
pub const TOKEN_IOC: u32 = 1 << 15;
pub const TOKEN_BYTES_SHIFT: u32 = 16;
pub const TOKEN_BYTES_MASK: u32 = 0x7fff << TOKEN_BYTES_SHIFT;
pub const TOKEN_TOGGLE: u32 = 1 << 31;

bitflags! {
    /// Status byte of the qTD token (bits 7:0).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct QtdStatus: u8 {
        /// High-speed bulk OUT PING protocol state.
        const DO_PING = 0x01;
        /// Split-transaction state (start vs complete split).
        const SPLIT_X = 0x02;
        const MISSED_UFRAME = 0x04;
        const XACT_ERR = 0x08;
        const BABBLE = 0x10;
        const BUFFER_ERR = 0x20;
        const HALTED = 0x40;
        const ACTIVE = 0x80;
    }
}

/// Raw qTD image: the dwords the controller fetches, in wire order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QtdHw {
    pub next: u32,
    pub alt_next: u32,
    pub token: u32,
    pub pages: [u32; QTD_PAGE_POINTERS],
    pub pages_hi: [u32; QTD_PAGE_POINTERS],
}

impl QtdHw {
    /// Fresh active descriptor token: no successors, full error counter, zero
    /// bytes until the builder accounts the covered length.
    pub fn new(pid: Pid, toggle: bool) -> Self {
        let mut token = u32::from(QtdStatus::ACTIVE.bits())
            | (pid.token_bits() << TOKEN_PID_SHIFT)
            | (QTD_MAX_ERR << TOKEN_CERR_SHIFT);
        if toggle {
            token |= TOKEN_TOGGLE;
        }
        Self {
            next: LINK_TERMINATE,
            alt_next: LINK_TERMINATE,
            token,
            pages: [0; QTD_PAGE_POINTERS],
            pages_hi: [0; QTD_PAGE_POINTERS],
        }
    }

    pub fn status(&self) -> QtdStatus {
        QtdStatus::from_bits_truncate((self.token & TOKEN_STATUS_MASK) as u8)
    }

    /// Two-bit PID code field.
    pub fn pid_bits(&self) -> u32 {
        (self.token & TOKEN_PID_MASK) >> TOKEN_PID_SHIFT
    }

    pub fn total_bytes(&self) -> usize {
        ((self.token & TOKEN_BYTES_MASK) >> TOKEN_BYTES_SHIFT) as usize
    }

    pub fn set_total_bytes(&mut self, bytes: usize) {
        debug_assert!(bytes <= (TOKEN_BYTES_MASK >> TOKEN_BYTES_SHIFT) as usize);
        self.token = (self.token & !TOKEN_BYTES_MASK) | ((bytes as u32) << TOKEN_BYTES_SHIFT);
    }

    pub fn data_toggle(&self) -> bool {
        self.token & TOKEN_TOGGLE != 0
    }

    pub fn pack(&self) -> [u8; QTD_HW_SIZE] {
        let mut image = [0u8; QTD_HW_SIZE];
        image[0..4].copy_from_slice(&self.next.to_le_bytes());
        image[4..8].copy_from_slice(&self.alt_next.to_le_bytes());
        image[8..12].copy_from_slice(&self.token.to_le_bytes());
        for (i, page) in self.pages.iter().enumerate() {
            image[12 + i * 4..16 + i * 4].copy_from_slice(&page.to_le_bytes());
        }
        for (i, page_hi) in self.pages_hi.iter().enumerate() {
            image[32 + i * 4..36 + i * 4].copy_from_slice(&page_hi.to_le_bytes());
        }
        image
    }

    pub fn unpack(image: &[u8; QTD_HW_SIZE]) -> Self {
        let dword = |off: usize| u32::from_le_bytes(image[off..off + 4].try_into().unwrap());
        let mut hw = Self {
            next: dword(0),
            alt_next: dword(4),
            token: dword(8),
            pages: [0; QTD_PAGE_POINTERS],
            pages_hi: [0; QTD_PAGE_POINTERS],
        };
        for i in 0..QTD_PAGE_POINTERS {
            hw.pages[i] = dword(12 + i * 4);
            hw.pages_hi[i] = dword(32 + i * 4);
        }
        hw
    }
}

/// One chunk of a mapped buffer: the same bytes through the host view
/// (software bookkeeping) and the bus view (what the controller DMAs).
#[derive(Debug, Clone, Copy)]
pub struct DataChunk {
    pub host: u64,
    pub bus: u64,
}

/// A built transfer descriptor: its pool record plus software bookkeeping.
///
/// Owned exclusively by its queue head's descriptor list; freed in bulk when
/// the chain is torn down (see [`crate::qh::QueueHead::free_qtds`]).
#[derive(Debug)]
pub struct Qtd {
    addr: u32,
    pub(crate) hw: QtdHw,
    data: Option<u64>,
    data_len: usize,
}

impl Qtd {
    /// Build a single qTD covering as much of `len` bytes at `data` as one
    /// descriptor can hold.
    ///
    /// Walks the physical pages the buffer spans starting at the chunk's bus
    /// address; every page window runs from the current offset to the page
    /// boundary. When the five page slots cannot cover the whole request,
    /// the covered length is truncated down to a multiple of `max_packet` so
    /// the next descriptor in the chain starts packet-aligned, never
    /// mid-packet.
    ///
    /// `data == None` is the zero-length marker (control status stage): the
    /// descriptor covers zero bytes and is fully valid.
    ///
    /// Returns `None` when the descriptor pool is exhausted.
    pub fn build<P: DescriptorPool + ?Sized>(
        pool: &mut P,
        data: Option<DataChunk>,
        len: usize,
        pid: Pid,
        toggle: bool,
        max_packet: usize,
    ) -> Option<Qtd> {
        let addr = pool.allocate(QTD_HW_SIZE)?;
        let mut qtd = Qtd {
            addr,
            hw: QtdHw::new(pid, toggle),
            data: None,
            data_len: 0,
        };

        if let Some(chunk) = data {
            debug_assert!(max_packet > 0, "data-bearing qTD needs a max packet size");
            let mut covered = 0usize;
            let mut bus = chunk.bus;

            for page in 0..QTD_PAGE_POINTERS {
                qtd.hw.pages[page] = bus as u32;
                qtd.hw.pages_hi[page] = (bus >> 32) as u32;

                let window = QTD_PAGE_SIZE - (bus as usize & QTD_PAGE_OFFSET_MASK);
                if covered + window >= len {
                    covered = len;
                    break;
                }
                covered += window;
                bus += window as u64;
            }

            // The page slots ran out before the request did: keep the length
            // a whole number of max packets so the follow-up descriptor
            // resumes on a packet boundary.
            if covered < len {
                covered -= covered % max_packet;
            }

            qtd.hw.set_total_bytes(covered);
            qtd.data = Some(chunk.host);
            qtd.data_len = covered;
        }

        Some(qtd)
    }

    /// Bus address of this descriptor's pool record.
    pub fn bus_addr(&self) -> u32 {
        self.addr
    }

    /// Bytes of the request this descriptor covers.
    pub fn data_len(&self) -> usize {
        self.data_len
    }

    /// Host address of the covered chunk, `None` for a zero-length marker.
    pub fn data_host(&self) -> Option<u64> {
        self.data
    }

    pub fn hw(&self) -> &QtdHw {
        &self.hw
    }

    /// Flush the image into pool memory.
    pub(crate) fn write_to<P: DescriptorPool + ?Sized>(&self, pool: &mut P) {
        pool.write(self.addr, &self.hw.pack());
    }
}
