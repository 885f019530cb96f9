// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bus Channel Multiplexer core.
//!
//! Bridges a byte-serial 8-bit host bus (one logical byte per host write
//! cycle, framed `[dev][len][payload...]` or a one-byte `[dev|0x80]`
//! read-request) to up to [`BUS_MAX_CHANNELS`] independently addressed
//! consumers. The core owns a [`Drr`] over the hardware RX ring, a bounded
//! per-channel reply buffer ([`ByteRing`]) for each channel, and the
//! one-shot TX staging needed to answer a read-request.
//!
//! Nothing here touches real hardware: the RX ring registers and the
//! one-shot TX DMA are reached through the [`RingRegs`] and [`TxDma`] seams,
//! so the whole core runs and is tested on the host.

#![cfg_attr(not(test), no_std)]

use dma_ring::{ByteRing, Drr, RingRegs};

/// Maximum number of channels the bus protocol's 7-bit device field can
/// normatively address in this core; an RX-only variant of the interface
/// boundary supports more, but `BusCore` rejects it (§3 of the design).
pub const BUS_MAX_CHANNELS: usize = 8;

/// Bound on a single staged transfer: one length byte plus up to this many
/// payload bytes. `0xFF` is reserved host-wide as the "not ready" sentinel
/// and must never be emitted as a length, so the cap sits one below it.
pub const BUS_MAX_PAYLOAD: usize = 254;

/// Per-channel reply ring capacity.
pub const BUS_MAX_BUFFER_SIZE: usize = 1024;

/// Hardware seam for the one-shot TX DMA that drains a staged reply onto
/// the bus. The PIO engine behind it transfers 32-bit words even though
/// only the low byte is meaningful to the host; see the module docs on
/// [`BusCore::bus_task`].
pub trait TxDma {
    /// `true` once the previously started one-shot transfer has drained.
    fn is_idle(&self) -> bool;
    /// Start a one-shot transfer of `words.len()` words.
    fn start(&mut self, words: &[u32]);
    /// Abort any in-flight transfer immediately.
    fn abort(&mut self);
}

/// Failure modes for [`BusCore::new`]. Both are raised by the caller's
/// `init` closure, which is expected to allocate the DMA channel and load
/// the PIO program backing the concrete [`RingRegs`]/[`TxDma`] pair.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BusInitError {
    /// No DMA channel was available to drive the RX ring or TX DMA.
    DmaChannelExhausted,
    /// The PIO program implementing the bus protocol's wire timing failed
    /// to load.
    PioProgramLoadFailed,
}

/// Handler invoked synchronously with a completed write transaction's
/// payload. The slice is only valid for the duration of the call: it may
/// be a view directly into the RX ring, which the core continues to
/// consume once the call returns.
pub trait Handler {
    fn on_write(&mut self, channel: usize, payload: &[u8]);
}

#[derive(Copy, Clone, PartialEq, Debug)]
enum BusState {
    Idle,
    GotDevice {
        dev: u8,
    },
    Receiving {
        dev: u8,
        len: u8,
        start_idx: u32,
        start_total_read: u32,
        received: u8,
    },
    Sending,
}

/// Read-only snapshot of the core's counters. All fields are monotone
/// `u32`s; wraparound is not treated as an error.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct BusStats {
    pub rx_bytes: u32,
    pub tx_bytes: u32,
    pub rx_dma_overruns: u32,
    pub rx_bankruptcies: u32,
    pub tx_underflows: u32,
    /// Writes whose length byte was `0xFF`, the sentinel reserved for
    /// "reply not ready"; never accepted as a legitimate write length.
    pub rx_proto_errors: u32,
}

#[derive(Copy, Clone, PartialEq, counters::Count)]
pub(crate) enum Trace {
    #[count(skip)]
    None,
    ReadRequest(u8),
    Dispatch(u8, u8),
    Overrun,
    Bankruptcy,
    Underflow(u8),
    ProtoError(u8),
    Sending(u8),
}

#[cfg(not(test))]
mod trace {
    use super::Trace;
    use ringbuf::*;

    counted_ringbuf!(Trace, 64, Trace::None);

    pub(crate) fn record(t: Trace) {
        ringbuf_entry!(t);
    }
}

#[cfg(test)]
mod trace {
    use super::Trace;
    use std::cell::RefCell;

    std::thread_local! {
        static LOG: RefCell<std::vec::Vec<Trace>> = const { RefCell::new(std::vec::Vec::new()) };
    }

    pub(crate) fn record(t: Trace) {
        LOG.with(|l| l.borrow_mut().push(t));
    }

    /// Drains the recorded trace entries for test assertions.
    pub(crate) fn drain() -> std::vec::Vec<Trace> {
        LOG.with(|l| l.borrow_mut().drain(..).collect())
    }
}

/// Owned core of the Bus Channel Multiplexer.
///
/// `SIZE` is the RX ring's byte capacity (a power of two; 32 KiB for the
/// large bus variant, 4 KiB for the small one). `N` is the channel count,
/// capped normatively at [`BUS_MAX_CHANNELS`].
pub struct BusCore<R, D, const SIZE: usize = 32768, const N: usize = BUS_MAX_CHANNELS> {
    drr: Drr<R, SIZE>,
    tx_dma: D,
    running: bool,
    state: BusState,
    tx: [ByteRing<BUS_MAX_BUFFER_SIZE>; N],
    pending_read_request: bool,
    pending_read_device: u8,
    underflow_recorded: bool,
    stats: BusStats,
    scratch: [u8; BUS_MAX_PAYLOAD],
}

impl<R, D, const SIZE: usize, const N: usize> BusCore<R, D, SIZE, N>
where
    R: RingRegs,
    D: TxDma,
{
    const ASSERT_CHANNEL_COUNT: () =
        assert!(N <= BUS_MAX_CHANNELS, "bus channel count must not exceed 8");

    /// Builds a new core, running `init` to perform whatever hardware
    /// bring-up (DMA channel allocation, PIO program load) the concrete
    /// `regs`/`tx_dma` pair requires.
    pub fn new(
        regs: R,
        tx_dma: D,
        init: impl FnOnce() -> Result<(), BusInitError>,
    ) -> Result<Self, BusInitError> {
        let () = Self::ASSERT_CHANNEL_COUNT;
        init()?;
        Ok(BusCore {
            drr: Drr::new(regs),
            tx_dma,
            running: false,
            state: BusState::Idle,
            tx: core::array::from_fn(|_| ByteRing::new()),
            pending_read_request: false,
            pending_read_device: 0,
            underflow_recorded: false,
            stats: BusStats::default(),
            scratch: [0; BUS_MAX_PAYLOAD],
        })
    }

    /// Direct access to the RX ring's backing storage, for wiring up the
    /// real DMA destination address (or, in tests, for simulating host
    /// writes).
    pub fn ring_mut(&mut self) -> &mut [u8; SIZE] {
        self.drr.ring_mut()
    }

    /// Begins processing. Before this call, `bus_task` is a no-op.
    pub fn start(&mut self) {
        self.running = true;
    }

    /// Aborts any in-flight reply DMA and returns the parser to `IDLE`.
    pub fn stop(&mut self) {
        self.running = false;
        self.tx_dma.abort();
        self.state = BusState::Idle;
        self.pending_read_request = false;
    }

    pub fn get_stats(&self) -> BusStats {
        self.stats
    }

    pub fn clear_stats(&mut self) {
        self.stats = BusStats::default();
    }

    /// Queues reply bytes for `channel`, returning the number actually
    /// enqueued (short on a full buffer; this is documented backpressure,
    /// not an error).
    pub fn enqueue_reply(&mut self, channel: usize, data: &[u8]) -> usize {
        self.tx[channel].enqueue(data)
    }

    pub fn clear_channel(&mut self, channel: usize) {
        self.tx[channel].clear();
    }

    /// Drives the cooperative main-loop tick: drains as many complete
    /// commands from the RX ring as are available, dispatching writes to
    /// `handler`, then services a pending read-request against the
    /// one-shot TX DMA.
    pub fn bus_task(&mut self, handler: &mut impl Handler) {
        if !self.running {
            return;
        }

        if self.drr.resync_on_overrun() {
            self.stats.rx_dma_overruns = self.stats.rx_dma_overruns.wrapping_add(1);
            trace::record(Trace::Overrun);
            self.state = BusState::Idle;
            self.service_otd();
            return;
        }

        while self.drr.unread_bytes() > 0 {
            match self.state {
                BusState::Idle | BusState::Sending => {
                    let byte = self.drr.read_byte();
                    self.stats.rx_bytes = self.stats.rx_bytes.wrapping_add(1);
                    self.on_command_byte(byte);
                }
                BusState::GotDevice { dev } => {
                    let byte = self.drr.read_byte();
                    self.stats.rx_bytes = self.stats.rx_bytes.wrapping_add(1);
                    self.on_len_byte(dev, byte);
                }
                BusState::Receiving {
                    dev,
                    len,
                    start_idx,
                    start_total_read,
                    received,
                } => {
                    self.drr.read_byte();
                    self.stats.rx_bytes = self.stats.rx_bytes.wrapping_add(1);
                    let received = received + 1;
                    if received == len {
                        let bankrupt =
                            self.dispatch(dev, len, start_idx, start_total_read, handler);
                        if bankrupt {
                            self.service_otd();
                            return;
                        }
                    } else {
                        self.state = BusState::Receiving {
                            dev,
                            len,
                            start_idx,
                            start_total_read,
                            received,
                        };
                    }
                }
            }
        }

        self.service_otd();
    }

    /// A byte arriving in `Idle` or `Sending` (the latter covers the host
    /// pipelining a new command while a reply is still draining, which
    /// last-command-wins reparses as the start of that new command).
    fn on_command_byte(&mut self, byte: u8) {
        let dev = byte & 0x7F;
        if byte & 0x80 != 0 {
            trace::record(Trace::ReadRequest(dev));
            if (dev as usize) < N {
                self.pending_read_device = dev;
                self.pending_read_request = true;
                self.underflow_recorded = false;
            }
            self.state = BusState::Idle;
        } else if (dev as usize) < N {
            self.state = BusState::GotDevice { dev };
        } else {
            self.state = BusState::Idle;
        }
    }

    fn on_len_byte(&mut self, dev: u8, len: u8) {
        if len == 0xFF {
            self.stats.rx_proto_errors = self.stats.rx_proto_errors.wrapping_add(1);
            trace::record(Trace::ProtoError(len));
            self.state = BusState::Idle;
        } else if len == 0 {
            self.state = BusState::Idle;
        } else {
            self.state = BusState::Receiving {
                dev,
                len,
                start_idx: self.drr.read_idx() as u32,
                start_total_read: self.drr.total_read(),
                received: 0,
            };
        }
    }

    /// Invokes `handler` with the just-completed transaction's payload and
    /// performs the post-dispatch bankruptcy check. Returns `true` if the
    /// ring wrapped under the handler's feet (caller must abort the tick).
    fn dispatch(
        &mut self,
        dev: u8,
        len: u8,
        start_idx: u32,
        start_total_read: u32,
        handler: &mut impl Handler,
    ) -> bool {
        let payload_len = len as usize;
        let start = start_idx as usize;
        trace::record(Trace::Dispatch(dev, len));

        if let Some(slice) = self.drr.contiguous_range(start, payload_len) {
            handler.on_write(dev as usize, slice);
        } else {
            let slice = self.drr.stitch_into(start, payload_len, &mut self.scratch);
            handler.on_write(dev as usize, slice);
        }

        let total_written_now = self.drr.total_read().wrapping_add(self.drr.unread_bytes());
        if total_written_now.wrapping_sub(start_total_read) > SIZE as u32 {
            self.stats.rx_bankruptcies = self.stats.rx_bankruptcies.wrapping_add(1);
            trace::record(Trace::Bankruptcy);
            self.drr.force_resync();
            self.state = BusState::Idle;
            true
        } else {
            self.state = BusState::Idle;
            false
        }
    }

    /// One-Shot TX Dispatcher: retires a drained reply, then stages the
    /// next one against a pending read-request.
    fn service_otd(&mut self) {
        if matches!(self.state, BusState::Sending) && self.tx_dma.is_idle() {
            self.state = BusState::Idle;
        }

        if !self.pending_read_request
            || matches!(self.state, BusState::Sending)
            || !self.tx_dma.is_idle()
        {
            return;
        }

        let dev = self.pending_read_device as usize;
        let available = self.tx[dev].len();
        if available == 0 {
            if !self.underflow_recorded {
                self.stats.tx_underflows = self.stats.tx_underflows.wrapping_add(1);
                trace::record(Trace::Underflow(dev as u8));
                self.underflow_recorded = true;
            }
            return;
        }

        let n = available.min(BUS_MAX_PAYLOAD);
        let mut bytes = [0u8; BUS_MAX_PAYLOAD];
        self.tx[dev].dequeue_into(&mut bytes[..n]);

        // The DMA hardware transfers 32-bit words; only the low byte is
        // meaningful to the host (see `TxDma`).
        let mut words = [0u32; BUS_MAX_PAYLOAD + 1];
        words[0] = n as u32;
        for (w, b) in words[1..=n].iter_mut().zip(&bytes[..n]) {
            *w = *b as u32;
        }

        self.tx_dma.start(&words[..=n]);
        self.stats.tx_bytes = self.stats.tx_bytes.wrapping_add(n as u32);
        trace::record(Trace::Sending(n as u8));
        self.state = BusState::Sending;
        self.pending_read_request = false;
    }
}
