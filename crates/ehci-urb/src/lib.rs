#![forbid(unsafe_code)]

//! EHCI (USB 2.0) URB lifecycle management.
//!
//! This crate builds, links and tears down the hardware-visible transfer
//! descriptor chains (queue heads + queue element transfer descriptors) that
//! describe USB transactions to a memory-mapped EHCI host controller. It is
//! the construction/destruction half of an EHCI host controller driver; the
//! schedule insertion, polling and completion paths live in a sibling
//! component.
//!
//! Three layers, in dependency order:
//! - [`qtd`] — builds a single qTD over a data chunk, splitting it across
//!   fixed-size physical pages as needed.
//! - [`qh`] — builds the per-endpoint queue head (polling parameters,
//!   speed-dependent fields, transfer-type-specific flags) that anchors a
//!   chain of qTDs.
//! - [`urb`] — given an abstract transfer request, produces a fully linked
//!   descriptor chain attached to a queue head, DMA-maps the user buffers,
//!   and on any failure unwinds every partial allocation.
//!
//! Descriptor records live in DMA-reachable memory obtained from a
//! [`pool::DescriptorPool`]; user buffers are made bus-visible through a
//! [`dma::DmaMapper`]. Both are traits so the embedding platform decides how
//! DMA-coherent memory is actually provided.
//!
//! ## Ordering contract
//!
//! Once a chain is linked into the live schedule the controller walks it
//! autonomously. This crate therefore only ever writes *complete* chains
//! into pool memory (the final linking pass flushes every descriptor image
//! at once), and [`urb::UrbContext::destroy_urb`] requires that the caller
//! has already unlinked the queue head from any live schedule. That
//! unlink-before-destroy precondition is the caller's responsibility and is
//! not verified here.

pub mod dma;
pub mod pool;
pub mod qh;
pub mod qtd;
pub mod urb;

pub use dma::{DmaDirection, DmaError, DmaMapper, DmaMapping, IdentityMapper};
pub use pool::{ArenaPool, DescriptorPool};
pub use qh::QueueHead;
pub use qtd::Qtd;
pub use urb::{CompletionCallback, TransferRequest, Urb, UrbContext, UrbError};

/// Size of a standard USB device request (setup packet) on the wire.
pub const SETUP_PACKET_LEN: usize = 8;

/// USB device speed, in the EHCI queue head `EPS` encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbSpeed {
    Full,
    Low,
    High,
}

impl UsbSpeed {
    /// Two-bit `EPS` field value for the queue head endpoint characteristics.
    pub fn eps_bits(self) -> u32 {
        match self {
            UsbSpeed::Full => 0,
            UsbSpeed::Low => 1,
            UsbSpeed::High => 2,
        }
    }
}

/// Transfer direction as seen from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Out,
    In,
}

/// USB transfer type of the endpoint an URB targets.
///
/// Interrupt transfers come in two flavours at the driver interface: one-shot
/// polled (`InterruptSync`) and callback-driven periodic (`InterruptAsync`).
/// Both receive identical queue head scheduling treatment; the distinction
/// matters only to the completion path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferType {
    Control,
    Bulk,
    InterruptSync,
    InterruptAsync,
}

impl TransferType {
    pub fn is_interrupt(self) -> bool {
        matches!(self, TransferType::InterruptSync | TransferType::InterruptAsync)
    }
}

/// Packet identifier for a qTD, in the qTD token `PID Code` encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pid {
    Out,
    In,
    Setup,
}

impl Pid {
    /// Two-bit token field value.
    pub fn token_bits(self) -> u32 {
        match self {
            Pid::Out => 0,
            Pid::In => 1,
            Pid::Setup => 2,
        }
    }
}

/// Transaction translator addressing for a low/full-speed device behind a
/// high-speed hub: the hub's device address and the downstream port the
/// device hangs off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionTranslator {
    pub hub_addr: u8,
    pub port: u8,
}

/// Resolved endpoint description an URB is built against.
///
/// This is the parsed form of the raw transfer-request addressing: endpoint
/// number and direction split out of the endpoint address byte, the poll
/// interval already converted to the hardware's power-of-two microframe
/// granularity (see [`qh::convert_poll_rate`]).
#[derive(Debug, Clone, Copy)]
pub struct Endpoint {
    pub dev_addr: u8,
    pub ep_num: u8,
    pub direction: Direction,
    pub speed: UsbSpeed,
    pub max_packet: usize,
    pub toggle: bool,
    pub transfer_type: TransferType,
    pub translator: Option<TransactionTranslator>,
    pub poll_rate: usize,
}

impl Endpoint {
    /// Transaction translator hub address, 0 when the endpoint needs none.
    pub fn hub_addr(&self) -> u8 {
        self.translator.map_or(0, |tt| tt.hub_addr)
    }

    /// Transaction translator port number, 0 when the endpoint needs none.
    pub fn hub_port(&self) -> u8 {
        self.translator.map_or(0, |tt| tt.port)
    }
}

/// A standard USB device request, the 8-byte record a control transfer's
/// setup stage carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupPacket {
    pub bm_request_type: u8,
    pub b_request: u8,
    pub w_value: u16,
    pub w_index: u16,
    pub w_length: u16,
}

impl SetupPacket {
    pub fn from_bytes(bytes: [u8; SETUP_PACKET_LEN]) -> Self {
        Self {
            bm_request_type: bytes[0],
            b_request: bytes[1],
            w_value: u16::from_le_bytes([bytes[2], bytes[3]]),
            w_index: u16::from_le_bytes([bytes[4], bytes[5]]),
            w_length: u16::from_le_bytes([bytes[6], bytes[7]]),
        }
    }

    pub fn to_bytes(self) -> [u8; SETUP_PACKET_LEN] {
        let value = self.w_value.to_le_bytes();
        let index = self.w_index.to_le_bytes();
        let length = self.w_length.to_le_bytes();
        [
            self.bm_request_type,
            self.b_request,
            value[0],
            value[1],
            index[0],
            index[1],
            length[0],
            length[1],
        ]
    }

    /// Direction bit of `bmRequestType` (bit 7: device-to-host).
    pub fn is_device_to_host(self) -> bool {
        (self.bm_request_type & 0x80) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_packet_round_trips_through_wire_bytes() {
        let setup = SetupPacket {
            bm_request_type: 0x80,
            b_request: 0x06,
            w_value: 0x0100,
            w_index: 0,
            w_length: 18,
        };
        let bytes = setup.to_bytes();
        assert_eq!(bytes, [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00]);
        assert_eq!(SetupPacket::from_bytes(bytes), setup);
        assert!(setup.is_device_to_host());
    }
}
