//! Queue head (QH) construction.
//!
//! A queue head is the per-endpoint scheduling anchor the controller walks:
//! endpoint addressing and speed, transfer-type-specific control flags, the
//! split-transaction microframe masks, and the transfer overlay through
//! which the hardware executes the attached qTD chain.
//!
//! Exactly one queue head exists per URB. The software [`QueueHead`] owns
//! its descriptors as an ordered list (append at tail, walk in order, free
//! in bulk) and knows how to link them into the hardware-visible chain.

use crate::pool::DescriptorPool;
use crate::qtd::{link_to, Qtd, QtdHw, QtdStatus, LINK_TERMINATE, QTD_HW_SIZE, TOKEN_TOGGLE};
use crate::{Direction, Endpoint, TransferType, UsbSpeed};

/// Size of the QH image in pool memory: four dwords plus the 52-byte
/// transfer overlay.
pub const QH_HW_SIZE: usize = 68;

// Endpoint characteristics (dword 1).
pub const QH_DEVADDR_MASK: u32 = 0x7f;
pub const QH_INACTIVATE: u32 = 1 << 7;
pub const QH_EPNUM_SHIFT: u32 = 8;
pub const QH_EPS_SHIFT: u32 = 12;
/// Data toggle control: take the toggle from each qTD instead of the
/// overlay. Set for control endpoints only.
pub const QH_DTC: u32 = 1 << 14;
/// Head-of-reclamation-list marker, owned by the schedule collaborator.
pub const QH_RECLAIM_HEAD: u32 = 1 << 15;
pub const QH_MAXPKT_SHIFT: u32 = 16;
pub const QH_MAXPKT_MASK: u32 = 0x7ff << QH_MAXPKT_SHIFT;
/// Control-endpoint flag for low/full-speed control endpoints.
pub const QH_CTRL_EP: u32 = 1 << 27;
pub const QH_NAK_RELOAD_SHIFT: u32 = 28;
pub const QH_NAK_RELOAD_MASK: u32 = 0xf << QH_NAK_RELOAD_SHIFT;

// Endpoint capabilities (dword 2).
pub const QH_SMASK_SHIFT: u32 = 0;
pub const QH_CMASK_SHIFT: u32 = 8;
pub const QH_HUBADDR_SHIFT: u32 = 16;
pub const QH_PORTNUM_SHIFT: u32 = 23;
pub const QH_MULT_SHIFT: u32 = 30;

/// Default NAK counter reload for control/bulk endpoints.
pub const QH_NAK_RELOAD: u32 = 3;

/// High-bandwidth multiplier; one transaction per microframe.
pub const QH_DEFAULT_MULT: u32 = 1;

// Microframe slots for the interrupt schedule masks.
pub const MICROFRAME_0: u32 = 1 << 0;
pub const MICROFRAME_1: u32 = 1 << 1;
pub const MICROFRAME_2: u32 = 1 << 2;
pub const MICROFRAME_3: u32 = 1 << 3;
pub const MICROFRAME_4: u32 = 1 << 4;
pub const MICROFRAME_5: u32 = 1 << 5;

/// Convert a requested poll interval (frames) to the power-of-two interval
/// the periodic schedule supports: the largest power of two that does not
/// exceed the request, with 0 mapping to 1.
pub fn convert_poll_rate(interval: usize) -> usize {
    if interval == 0 {
        return 1;
    }
    1 << (usize::BITS - 1 - interval.leading_zeros())
}

/// Raw QH image in wire order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QhHw {
    pub horizontal_link: u32,
    pub ep_chars: u32,
    pub ep_caps: u32,
    pub current_qtd: u32,
    pub overlay: QtdHw,
}

impl QhHw {
    pub fn pack(&self) -> [u8; QH_HW_SIZE] {
        let mut image = [0u8; QH_HW_SIZE];
        image[0..4].copy_from_slice(&self.horizontal_link.to_le_bytes());
        image[4..8].copy_from_slice(&self.ep_chars.to_le_bytes());
        image[8..12].copy_from_slice(&self.ep_caps.to_le_bytes());
        image[12..16].copy_from_slice(&self.current_qtd.to_le_bytes());
        image[16..].copy_from_slice(&self.overlay.pack());
        image
    }

    pub fn unpack(image: &[u8; QH_HW_SIZE]) -> Self {
        let dword = |off: usize| u32::from_le_bytes(image[off..off + 4].try_into().unwrap());
        Self {
            horizontal_link: dword(0),
            ep_chars: dword(4),
            ep_caps: dword(8),
            current_qtd: dword(12),
            overlay: QtdHw::unpack(image[16..].try_into().unwrap()),
        }
    }
}

/// Split-transaction microframe masks for an interrupt endpoint.
///
/// High-speed interrupt endpoints poll in microframe 0. Low/full-speed
/// endpoints behind a high-speed hub start-split in microframe 1 and
/// complete-split in microframes 3, 4 and 5 — a fixed slot assignment for
/// every interrupt endpoint, with no admission-control bandwidth shaping.
fn interrupt_schedule_masks(ep: &Endpoint) -> (u32, u32) {
    if ep.speed == UsbSpeed::High {
        (MICROFRAME_0, 0)
    } else {
        (MICROFRAME_1, MICROFRAME_3 | MICROFRAME_4 | MICROFRAME_5)
    }
}

/// A built queue head and the descriptor list it owns.
#[derive(Debug)]
pub struct QueueHead {
    addr: u32,
    pub hw: QhHw,
    interval: usize,
    qtds: Vec<Qtd>,
}

impl QueueHead {
    /// Allocate and initialize a queue head for `ep`.
    ///
    /// The image is written to pool memory immediately (with an empty,
    /// terminated overlay); attaching a descriptor chain later rewrites it.
    /// Returns `None` when the pool is exhausted.
    pub fn build<P: DescriptorPool + ?Sized>(pool: &mut P, ep: &Endpoint) -> Option<QueueHead> {
        let addr = pool.allocate(QH_HW_SIZE)?;

        let mut ep_chars = (u32::from(ep.dev_addr) & QH_DEVADDR_MASK)
            | (u32::from(ep.ep_num) << QH_EPNUM_SHIFT)
            | (ep.speed.eps_bits() << QH_EPS_SHIFT)
            | (((ep.max_packet as u32) << QH_MAXPKT_SHIFT) & QH_MAXPKT_MASK)
            | (QH_NAK_RELOAD << QH_NAK_RELOAD_SHIFT);
        let mut ep_caps = (QH_DEFAULT_MULT << QH_MULT_SHIFT)
            | (u32::from(ep.hub_addr()) << QH_HUBADDR_SHIFT)
            | (u32::from(ep.hub_port()) << QH_PORTNUM_SHIFT);

        // The overlay token seeds the live transfer state: the endpoint's
        // current data toggle, and the split-transaction status for
        // endpoints reached through a transaction translator.
        let mut overlay = QtdHw::default();
        if ep.toggle {
            overlay.token |= TOKEN_TOGGLE;
        }
        if ep.speed != UsbSpeed::High {
            overlay.token |= u32::from(QtdStatus::SPLIT_X.bits());
        }

        match ep.transfer_type {
            TransferType::Control => {
                // Control transfers carry the toggle in each qTD; low/full
                // speed control endpoints additionally need the translator's
                // control-endpoint handling.
                ep_chars |= QH_DTC;
                if ep.speed != UsbSpeed::High {
                    ep_chars |= QH_CTRL_EP;
                }
            }
            TransferType::InterruptSync | TransferType::InterruptAsync => {
                ep_chars &= !QH_NAK_RELOAD_MASK;
                let (s_mask, c_mask) = interrupt_schedule_masks(ep);
                ep_caps |= (s_mask << QH_SMASK_SHIFT) | (c_mask << QH_CMASK_SHIFT);
            }
            TransferType::Bulk => {
                if ep.speed == UsbSpeed::High && ep.direction == Direction::Out {
                    overlay.token |= u32::from(QtdStatus::DO_PING.bits());
                }
            }
        }

        let qh = QueueHead {
            addr,
            hw: QhHw {
                horizontal_link: LINK_TERMINATE,
                ep_chars,
                ep_caps,
                current_qtd: 0,
                overlay,
            },
            interval: ep.poll_rate,
            qtds: Vec::new(),
        };
        pool.write(addr, &qh.hw.pack());
        Some(qh)
    }

    /// Bus address of the queue head record.
    pub fn bus_addr(&self) -> u32 {
        self.addr
    }

    /// Converted power-of-two poll interval, for periodic-schedule placement.
    pub fn interval(&self) -> usize {
        self.interval
    }

    /// The owned descriptor list, in chain order.
    pub fn qtds(&self) -> &[Qtd] {
        &self.qtds
    }

    pub(crate) fn push_qtd(&mut self, qtd: Qtd) {
        self.qtds.push(qtd);
    }

    /// Fix up every descriptor's next pointer to address its successor (the
    /// last keeps its terminate sentinel), point the overlay at the first
    /// descriptor, and flush all images to pool memory in one pass.
    ///
    /// Pool memory holds either the previous consistent chain or the new one,
    /// never a half-linked mixture, so the caller can hand the queue head to
    /// the schedule as soon as this returns.
    pub(crate) fn link_and_flush<P: DescriptorPool + ?Sized>(&mut self, pool: &mut P) {
        for i in 0..self.qtds.len().saturating_sub(1) {
            let next = link_to(self.qtds[i + 1].bus_addr());
            self.qtds[i].hw.next = next;
        }
        if let Some(first) = self.qtds.first() {
            self.hw.overlay.next = link_to(first.bus_addr());
        }

        for qtd in &self.qtds {
            qtd.write_to(pool);
        }
        pool.write(self.addr, &self.hw.pack());
    }

    /// Free the whole descriptor list back to the pool.
    ///
    /// The caller must already have unlinked this queue head from any live
    /// hardware schedule.
    pub(crate) fn free_qtds<P: DescriptorPool + ?Sized>(&mut self, pool: &mut P) {
        for qtd in self.qtds.drain(..) {
            pool.free(qtd.bus_addr(), QTD_HW_SIZE);
        }
    }
}
