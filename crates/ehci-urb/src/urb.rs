//! USB request blocks: one URB per transfer, owning the queue head, the
//! descriptor chain and the bus-master mappings of the caller's buffers.
//!
//! Construction is all-or-nothing. Resource exhaustion at any step (pool
//! record, DMA mapping, truncated mapping) unwinds everything acquired so
//! far and surfaces a single typed error; no partially built URB is ever
//! returned. Teardown runs the same release path in reverse and is safe on
//! any partial state, which is what makes the unwind reuse it.

use std::fmt;

use log::{debug, trace};
use thiserror::Error;

use crate::dma::{DmaDirection, DmaError, DmaMapper, MappedBuffer};
use crate::pool::DescriptorPool;
use crate::qh::{convert_poll_rate, QueueHead, QH_HW_SIZE};
use crate::qtd::{link_to, DataChunk, Qtd, LINK_TERMINATE, QTD_HW_SIZE};
use crate::{
    Direction, Endpoint, Pid, TransactionTranslator, TransferType, UsbSpeed, SETUP_PACKET_LEN,
};

/// Errors fatal to an in-progress URB construction.
///
/// All of them are resource exhaustion in one form or another; there is no
/// retry at this layer, the request is unwound and the caller reports the
/// failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum UrbError {
    #[error("descriptor pool exhausted")]
    PoolExhausted,
    #[error("buffer mapping failed: {0}")]
    MapFailed(#[from] DmaError),
    #[error("buffer mapping was truncated")]
    ShortMapping,
}

/// Completion callback, invoked by the schedule collaborator when the
/// transfer retires: completed byte count and the raw token of the last
/// retired descriptor (0 for clean completion).
///
/// There is no separate opaque context argument; closure capture carries it.
pub type CompletionCallback = Box<dyn FnMut(usize, u32)>;

/// An abstract transfer request: everything needed to address the endpoint
/// and describe the buffers, before any hardware resource is touched.
///
/// `ep_addr` is the raw endpoint address byte: endpoint number in the low
/// four bits, direction in bit 7. `setup`/`data` are host addresses of
/// caller-owned buffers; they are mapped for bus-master access for the
/// lifetime of the URB.
#[derive(Debug, Clone, Copy)]
pub struct TransferRequest {
    pub dev_addr: u8,
    pub ep_addr: u8,
    pub speed: UsbSpeed,
    pub toggle: bool,
    pub max_packet: usize,
    pub translator: Option<TransactionTranslator>,
    pub transfer_type: TransferType,
    pub setup: Option<u64>,
    pub data: Option<u64>,
    pub data_len: usize,
    pub interval: usize,
}

/// A fully constructed USB request block.
///
/// Holds the queue head with its linked descriptor chain and the live DMA
/// mappings. A `Urb` must be returned to [`UrbContext::destroy_urb`] —
/// dropping it leaks its pool records and mappings, since releasing them
/// needs the context that owns the pool and mapper.
pub struct Urb {
    ep: Endpoint,
    setup: Option<MappedBuffer>,
    data: Option<MappedBuffer>,
    data_len: usize,
    qh: Option<QueueHead>,
    callback: Option<CompletionCallback>,
}

impl Urb {
    pub fn endpoint(&self) -> &Endpoint {
        &self.ep
    }

    /// The queue head anchoring this URB's descriptor chain. Always present
    /// on a successfully constructed URB.
    pub fn qh(&self) -> Option<&QueueHead> {
        self.qh.as_ref()
    }

    pub fn data_len(&self) -> usize {
        self.data_len
    }

    /// Mapped setup buffer (control transfers only).
    pub fn setup(&self) -> Option<&MappedBuffer> {
        self.setup.as_ref()
    }

    /// Mapped data buffer, if the request carries one.
    pub fn data(&self) -> Option<&MappedBuffer> {
        self.data.as_ref()
    }

    pub fn callback_mut(&mut self) -> Option<&mut CompletionCallback> {
        self.callback.as_mut()
    }
}

impl fmt::Debug for Urb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Urb")
            .field("ep", &self.ep)
            .field("setup", &self.setup)
            .field("data", &self.data)
            .field("data_len", &self.data_len)
            .field("qh", &self.qh)
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}

/// Shared construction context: the descriptor pool, the DMA mapping
/// service, and the short-read-stop sentinel descriptor that IN transfers
/// use as their alternate-next target.
pub struct UrbContext<P: DescriptorPool, M: DmaMapper> {
    pool: P,
    mapper: M,
    short_read_stop: Qtd,
}

impl<P: DescriptorPool, M: DmaMapper> UrbContext<P, M> {
    /// Set up the context, allocating the short-read-stop sentinel from the
    /// pool.
    pub fn new(mut pool: P, mapper: M) -> Result<Self, UrbError> {
        let short_read_stop =
            Qtd::build(&mut pool, None, 0, Pid::In, false, 0).ok_or(UrbError::PoolExhausted)?;
        short_read_stop.write_to(&mut pool);
        Ok(Self {
            pool,
            mapper,
            short_read_stop,
        })
    }

    pub fn pool(&self) -> &P {
        &self.pool
    }

    pub fn mapper(&self) -> &M {
        &self.mapper
    }

    /// Bus address of the sentinel descriptor short IN reads stop at.
    pub fn short_read_stop_addr(&self) -> u32 {
        self.short_read_stop.bus_addr()
    }

    /// Create a URB: build the queue head, map the buffers, build and link
    /// the descriptor chain.
    ///
    /// On any failure every resource acquired so far is released before the
    /// error is returned.
    ///
    /// # Panics
    ///
    /// Contract violations panic rather than degrade: a non-high-speed
    /// endpoint without a transaction translator, a control transfer with no
    /// setup packet, a non-control transfer with no data to move, or a data
    /// length without a data buffer.
    pub fn create_urb(
        &mut self,
        req: TransferRequest,
        callback: Option<CompletionCallback>,
    ) -> Result<Urb, UrbError> {
        if req.speed != UsbSpeed::High {
            assert!(
                req.translator.is_some(),
                "non-high-speed endpoint requires a transaction translator"
            );
        }
        if req.transfer_type == TransferType::Control {
            assert!(req.setup.is_some(), "control transfers carry a setup packet");
        } else {
            assert!(req.data_len > 0, "non-control transfers must move data");
        }
        assert!(
            req.data.is_some() || req.data_len == 0,
            "data length without a data buffer"
        );

        let ep = Endpoint {
            dev_addr: req.dev_addr,
            ep_num: req.ep_addr & 0x0f,
            direction: if req.ep_addr & 0x80 != 0 {
                Direction::In
            } else {
                Direction::Out
            },
            speed: req.speed,
            max_packet: req.max_packet,
            toggle: req.toggle,
            transfer_type: req.transfer_type,
            // High-speed endpoints talk to the controller directly; any
            // translator the caller supplied is meaningless for them.
            translator: if req.speed != UsbSpeed::High {
                req.translator
            } else {
                None
            },
            poll_rate: convert_poll_rate(req.interval),
        };

        let mut urb = Urb {
            ep,
            setup: None,
            data: None,
            data_len: req.data_len,
            qh: None,
            callback,
        };

        let Some(qh) = QueueHead::build(&mut self.pool, &urb.ep) else {
            debug!("queue head allocation failed, unwinding URB");
            self.destroy_urb(urb);
            return Err(UrbError::PoolExhausted);
        };
        urb.qh = Some(qh);

        if let Some(host) = req.setup {
            match self.map_checked(DmaDirection::DeviceRead, host, SETUP_PACKET_LEN) {
                Ok(buf) => urb.setup = Some(buf),
                Err(err) => {
                    self.destroy_urb(urb);
                    return Err(err);
                }
            }
        }

        if let Some(host) = req.data {
            let direction = match urb.ep.direction {
                Direction::In => DmaDirection::DeviceWrite,
                Direction::Out => DmaDirection::DeviceRead,
            };
            match self.map_checked(direction, host, req.data_len) {
                Ok(buf) => urb.data = Some(buf),
                Err(err) => {
                    self.destroy_urb(urb);
                    return Err(err);
                }
            }
        }

        if let Err(err) = self.build_qtds(&mut urb) {
            self.destroy_urb(urb);
            return Err(err);
        }

        trace!(
            "URB ready: dev {} ep {} {:?} {:?}, {} bytes, {} qTDs",
            urb.ep.dev_addr,
            urb.ep.ep_num,
            urb.ep.direction,
            urb.ep.transfer_type,
            urb.data_len,
            urb.qh.as_ref().map_or(0, |qh| qh.qtds().len()),
        );
        Ok(urb)
    }

    /// Tear down a URB: unmap the buffers, free the descriptor chain and the
    /// queue head, in that order.
    ///
    /// Safe on a partially constructed URB (any subset of the resources may
    /// be present). The caller must already have unlinked the queue head
    /// from any live hardware schedule; that precondition is not verified
    /// here.
    pub fn destroy_urb(&mut self, mut urb: Urb) {
        if let Some(setup) = urb.setup.take() {
            self.mapper.unmap(setup.mapping);
        }
        if let Some(data) = urb.data.take() {
            self.mapper.unmap(data.mapping);
        }
        if let Some(mut qh) = urb.qh.take() {
            qh.free_qtds(&mut self.pool);
            self.pool.free(qh.bus_addr(), QH_HW_SIZE);
        }
        trace!("URB destroyed");
    }

    fn map_checked(
        &mut self,
        direction: DmaDirection,
        host: u64,
        len: usize,
    ) -> Result<MappedBuffer, UrbError> {
        let mapping = self.mapper.map(direction, host, len)?;
        if mapping.len != len {
            debug!(
                "bus mapping truncated ({} of {} bytes), unwinding URB",
                mapping.len, len
            );
            self.mapper.unmap(mapping);
            return Err(UrbError::ShortMapping);
        }
        Ok(MappedBuffer { host, mapping })
    }

    /// Build the descriptor chain for `urb` and link it under the queue
    /// head.
    ///
    /// Control transfers produce `[setup][data...][status]` with the data
    /// stage starting at toggle 1 and the status stage carrying toggle 1 in
    /// the opposite direction of the data stage. Data descriptors flip the
    /// toggle only when they cover an odd number of max-packet units.
    fn build_qtds(&mut self, urb: &mut Urb) -> Result<(), UrbError> {
        let ep = urb.ep;
        let setup_buf = urb.setup;
        let data_buf = urb.data;
        let data_len = urb.data_len;
        let qh = urb.qh.as_mut().expect("queue head built before the chain");

        // The controller follows the alternate-next pointer when an IN
        // transaction comes up short; everything else terminates.
        let mut alt_next = LINK_TERMINATE;
        if ep.direction == Direction::In {
            alt_next = link_to(self.short_read_stop.bus_addr());
        }

        let mut toggle = false;
        let mut status_qtd = None;

        if ep.transfer_type == TransferType::Control {
            let setup = setup_buf.expect("control transfer carries a setup packet");
            let chunk = DataChunk {
                host: setup.host,
                bus: setup.mapping.bus,
            };
            let Some(qtd) = Qtd::build(
                &mut self.pool,
                Some(chunk),
                SETUP_PACKET_LEN,
                Pid::Setup,
                false,
                ep.max_packet,
            ) else {
                return Self::unwind_chain(&mut self.pool, qh, None);
            };
            qh.push_qtd(qtd);

            // Build the status stage now so a short control read can resume
            // straight at it via alternate-next. Opposite direction of the
            // data stage, or IN when there is no data stage.
            let pid = match ep.direction {
                Direction::In => Pid::Out,
                Direction::Out => Pid::In,
            };
            let Some(status) = Qtd::build(&mut self.pool, None, 0, pid, true, ep.max_packet)
            else {
                return Self::unwind_chain(&mut self.pool, qh, None);
            };
            if ep.direction == Direction::In {
                alt_next = link_to(status.bus_addr());
            }
            status_qtd = Some(status);
            toggle = true;
        }

        let pid = match ep.direction {
            Direction::In => Pid::In,
            Direction::Out => Pid::Out,
        };

        let mut built = 0usize;
        while built < data_len {
            let data = data_buf.expect("data buffer mapped before the chain");
            let chunk = DataChunk {
                host: data.host + built as u64,
                bus: data.mapping.bus + built as u64,
            };
            let Some(mut qtd) = Qtd::build(
                &mut self.pool,
                Some(chunk),
                data_len - built,
                pid,
                toggle,
                ep.max_packet,
            ) else {
                return Self::unwind_chain(&mut self.pool, qh, status_qtd);
            };
            qtd.hw.alt_next = alt_next;
            debug_assert!(qtd.data_len() > 0, "descriptor must make forward progress");

            // Flip the toggle only when this descriptor covers an odd number
            // of (full or partial) max-packet units; an even packet count
            // leaves the next descriptor's toggle unchanged.
            if qtd.data_len().div_ceil(ep.max_packet) % 2 == 1 {
                toggle = !toggle;
            }

            built += qtd.data_len();
            qh.push_qtd(qtd);
        }

        if let Some(status) = status_qtd {
            qh.push_qtd(status);
        }

        qh.link_and_flush(&mut self.pool);
        Ok(())
    }

    fn unwind_chain(
        pool: &mut P,
        qh: &mut QueueHead,
        status_qtd: Option<Qtd>,
    ) -> Result<(), UrbError> {
        debug!("descriptor pool exhausted mid-chain, unwinding");
        if let Some(status) = status_qtd {
            pool.free(status.bus_addr(), QTD_HW_SIZE);
        }
        qh.free_qtds(pool);
        Err(UrbError::PoolExhausted)
    }
}

impl<P: DescriptorPool, M: DmaMapper> Drop for UrbContext<P, M> {
    fn drop(&mut self) {
        self.pool
            .free(self.short_read_stop.bus_addr(), QTD_HW_SIZE);
    }
}
