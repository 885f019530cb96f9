// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! SPI Slave Transport core.
//!
//! Implements the three-command (`WRITE` / `REQUEST` / `READ`) SPI-slave
//! protocol described in the module's design notes: a software `READY`
//! handshake guarantees the master never begins a `READ` until the
//! slave's reply DMA is fully armed, multiplexing master-initiated writes
//! and slave-originated messages over one full-duplex link.
//!
//! As with the bus core, nothing here touches real hardware directly: the
//! RX ring, the one-shot TX DMA, the `IRQ`/`READY` output pins and the CS
//! rising-edge latch are all reached through small traits, so the whole
//! core runs and is tested on the host.

#![cfg_attr(not(test), no_std)]

use dma_ring::{ByteRing, Drr, RingRegs};

/// Maximum payload bytes in a single `WRITE` command or `READ` reply.
pub const SPI_MAX_WRITE_LEN: usize = 1500;

/// Total length of a MISO reply frame: `LEN_HI, LEN_LO, BUF` followed by
/// up to [`SPI_MAX_WRITE_LEN`] payload bytes, zero-padded to this length.
pub const SPI_SLAVE_READ_SIZE: usize = SPI_MAX_WRITE_LEN + 3;

/// Capacity of the internal queue feeding slave-originated reply bytes.
pub const SPI_TX_QUEUE_SIZE: usize = 4096;

/// One-shot TX DMA that clocks out a full [`SPI_SLAVE_READ_SIZE`]-byte
/// reply frame on a `READ`.
pub trait TxDma {
    fn is_idle(&self) -> bool;
    fn start(&mut self, frame: &[u8; SPI_SLAVE_READ_SIZE]);
    fn abort(&mut self);
}

/// An active-low output pin (`IRQ` or `READY`).
pub trait OutPin {
    fn assert(&mut self);
    fn deassert(&mut self);
}

/// A latch set by the CS rising-edge ISR and cleared by the cooperative
/// loop that reads it.
pub trait EdgeLatch {
    /// Returns `true` (and clears the latch) if an edge has occurred
    /// since the last call.
    fn take_edge(&mut self) -> bool;
}

/// Failure modes for [`SstCore::new`], raised by the caller's `init`
/// closure during hardware bring-up.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SstInitError {
    DmaChannelExhausted,
    PioProgramLoadFailed,
}

/// Handler invoked synchronously with a completed `WRITE` command's
/// payload. The slice is only valid for the duration of the call.
pub trait RxHandler {
    fn on_write(&mut self, payload: &[u8]);
}

#[derive(Copy, Clone, PartialEq, Debug)]
enum Handshake {
    Idle,
    Requested,
    Ready,
}

#[derive(Copy, Clone, PartialEq, Debug)]
enum ParseState {
    Command,
    WriteLenHi,
    WriteLenLo {
        hi: u8,
    },
    WritePayload {
        len: u16,
        received: u16,
        start_idx: u32,
        start_total_read: u32,
    },
    ReadDummy {
        remaining: u16,
    },
}

/// Read-only snapshot of the core's counters.
///
/// `rx_bankruptcies` is not among the wire-level field names in the
/// transport's own documentation, but the frame parser performs the same
/// post-dispatch bankruptcy check the bus parser does (§7 names both as
/// raisers), so it needs a counter alongside the rest; this is a strict
/// superset of the documented field list, not a replacement.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SstStats {
    pub rx_writes: u32,
    /// Payload bytes delivered by completed `WRITE` commands; command and
    /// length framing bytes are not counted, matching `tx_bytes`'s count
    /// of staged reply payload only (not the 3-byte MISO header).
    pub rx_bytes: u32,
    pub rx_overflows: u32,
    pub tx_reads: u32,
    pub tx_bytes: u32,
    pub requests: u32,
    pub proto_errors: u32,
    pub rx_bankruptcies: u32,
}

#[derive(Copy, Clone, PartialEq, counters::Count)]
pub(crate) enum Trace {
    #[count(skip)]
    None,
    Write(u16),
    Request,
    Read,
    ProtoError(u8),
    Overrun,
    Bankruptcy,
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


/// Owned core of the SPI Slave Transport.
///
/// `SIZE` is the RX ring's byte capacity (8 KiB in the normative
/// variant).
pub struct SstCore<R, D, IRQ, RDY, CS, const SIZE: usize = 8192> {
    drr: Drr<R, SIZE>,
    tx_dma: D,
    irq: IRQ,
    ready: RDY,
    cs: CS,
    running: bool,
    handshake: Handshake,
    parse: ParseState,
    tx_queue: ByteRing<SPI_TX_QUEUE_SIZE>,
    frame: [u8; SPI_SLAVE_READ_SIZE],
    scratch: [u8; SPI_MAX_WRITE_LEN],
    stats: SstStats,
}

impl<R, D, IRQ, RDY, CS, const SIZE: usize> SstCore<R, D, IRQ, RDY, CS, SIZE>
where
    R: RingRegs,
    D: TxDma,
    IRQ: OutPin,
    RDY: OutPin,
    CS: EdgeLatch,
{
    pub fn new(
        regs: R,
        tx_dma: D,
        irq: IRQ,
        ready: RDY,
        cs: CS,
        init: impl FnOnce() -> Result<(), SstInitError>,
    ) -> Result<Self, SstInitError> {
        init()?;
        Ok(SstCore {
            drr: Drr::new(regs),
            tx_dma,
            irq,
            ready,
            cs,
            running: false,
            handshake: Handshake::Idle,
            parse: ParseState::Command,
            tx_queue: ByteRing::new(),
            frame: [0; SPI_SLAVE_READ_SIZE],
            scratch: [0; SPI_MAX_WRITE_LEN],
            stats: SstStats::default(),
        })
    }

    pub fn ring_mut(&mut self) -> &mut [u8; SIZE] {
        self.drr.ring_mut()
    }

    pub fn start(&mut self) {
        self.running = true;
        self.refresh_irq();
    }

    pub fn stop(&mut self) {
        self.running = false;
        self.tx_dma.abort();
        self.ready.deassert();
        self.handshake = Handshake::Idle;
        self.parse = ParseState::Command;
    }

    pub fn get_stats(&self) -> SstStats {
        self.stats
    }

    pub fn clear_stats(&mut self) {
        self.stats = SstStats::default();
    }

    /// Queues bytes for the next `REQUEST`/`READ` cycle, returning the
    /// number actually enqueued (short on a full queue; `len == 0` is a
    /// no-op success).
    pub fn queue_for_read(&mut self, data: &[u8]) -> usize {
        let n = self.tx_queue.enqueue(data);
        self.refresh_irq();
        n
    }

    /// Free capacity remaining in the internal TX queue.
    pub fn free_space(&self) -> usize {
        self.tx_queue.free()
    }

    /// Drives the cooperative main-loop tick: observes a CS rising edge
    /// (closing out a `READY` reply cycle), then parses as many complete
    /// commands as are available from the RX ring, invoking `handler`
    /// for each completed `WRITE`. `REQUEST` staging happens synchronously
    /// within this call, per the handshake's atomicity guarantee (`READY`
    /// is not asserted until the reply DMA is armed).
    pub fn sst_task(&mut self, handler: &mut impl RxHandler) {
        if !self.running {
            return;
        }

        if self.cs.take_edge() && self.handshake == Handshake::Ready {
            self.ready.deassert();
            self.handshake = Handshake::Idle;
            self.refresh_irq();
        }

        if self.drr.resync_on_overrun() {
            self.stats.rx_overflows = self.stats.rx_overflows.wrapping_add(1);
            trace::record(Trace::Overrun);
            self.parse = ParseState::Command;
            return;
        }

        while self.drr.unread_bytes() > 0 {
            match self.parse {
                ParseState::Command => {
                    let byte = self.drr.read_byte();
                    match byte {
                        0x01 => self.parse = ParseState::WriteLenHi,
                        0x02 => {
                            self.stats.requests = self.stats.requests.wrapping_add(1);
                            trace::record(Trace::Request);
                            self.handshake = Handshake::Requested;
                            self.irq.deassert();
                            self.stage_reply();
                            self.parse = ParseState::Command;
                        }
                        0x03 => {
                            trace::record(Trace::Read);
                            self.parse = ParseState::ReadDummy {
                                remaining: (SPI_MAX_WRITE_LEN + 2) as u16,
                            };
                        }
                        _ => {
                            self.stats.proto_errors = self.stats.proto_errors.wrapping_add(1);
                            trace::record(Trace::ProtoError(byte));
                            self.drr.force_resync();
                            self.parse = ParseState::Command;
                            return;
                        }
                    }
                }
                ParseState::WriteLenHi => {
                    let byte = self.drr.read_byte();
                    self.parse = ParseState::WriteLenLo { hi: byte };
                }
                ParseState::WriteLenLo { hi } => {
                    let lo = self.drr.read_byte();
                    let len = (u16::from(hi) << 8) | u16::from(lo);
                    if len as usize > SPI_MAX_WRITE_LEN {
                        self.stats.proto_errors = self.stats.proto_errors.wrapping_add(1);
                        trace::record(Trace::ProtoError(hi));
                        self.drr.force_resync();
                        self.parse = ParseState::Command;
                        return;
                    } else if len == 0 {
                        self.stats.rx_writes = self.stats.rx_writes.wrapping_add(1);
                        trace::record(Trace::Write(0));
                        handler.on_write(&[]);
                        self.parse = ParseState::Command;
                    } else {
                        self.parse = ParseState::WritePayload {
                            len,
                            received: 0,
                            start_idx: self.drr.read_idx() as u32,
                            start_total_read: self.drr.total_read(),
                        };
                    }
                }
                ParseState::WritePayload {
                    len,
                    received,
                    start_idx,
                    start_total_read,
                } => {
                    self.drr.read_byte();
                    self.stats.rx_bytes = self.stats.rx_bytes.wrapping_add(1);
                    let received = received + 1;
                    if received == len {
                        let bankrupt =
                            self.dispatch_write(start_idx, len, start_total_read, handler);
                        self.parse = ParseState::Command;
                        if bankrupt {
                            return;
                        }
                    } else {
                        self.parse = ParseState::WritePayload {
                            len,
                            received,
                            start_idx,
                            start_total_read,
                        };
                    }
                }
                ParseState::ReadDummy { remaining } => {
                    self.drr.read_byte();
                    if remaining == 1 {
                        self.stats.tx_reads = self.stats.tx_reads.wrapping_add(1);
                        self.parse = ParseState::Command;
                    } else {
                        self.parse = ParseState::ReadDummy {
                            remaining: remaining - 1,
                        };
                    }
                }
            }
        }
    }

    fn dispatch_write(
        &mut self,
        start_idx: u32,
        len: u16,
        start_total_read: u32,
        handler: &mut impl RxHandler,
    ) -> bool {
        let payload_len = len as usize;
        let start = start_idx as usize;
        trace::record(Trace::Write(len));

        if let Some(slice) = self.drr.contiguous_range(start, payload_len) {
            handler.on_write(slice);
        } else {
            let slice = self.drr.stitch_into(start, payload_len, &mut self.scratch);
            handler.on_write(slice);
        }
        self.stats.rx_writes = self.stats.rx_writes.wrapping_add(1);

        let total_written_now = self.drr.total_read().wrapping_add(self.drr.unread_bytes());
        if total_written_now.wrapping_sub(start_total_read) > SIZE as u32 {
            self.stats.rx_bankruptcies = self.stats.rx_bankruptcies.wrapping_add(1);
            trace::record(Trace::Bankruptcy);
            self.drr.force_resync();
            true
        } else {
            false
        }
    }

    /// Stages a reply frame from the TX queue and arms the one-shot DMA
    /// before asserting `READY`, satisfying the atomicity guarantee that
    /// the master cannot observe `READY` before the DMA is armed.
    fn stage_reply(&mut self) {
        let drained = self.tx_queue.dequeue_into(&mut self.frame[3..]);
        for b in &mut self.frame[3 + drained..] {
            *b = 0;
        }
        let free_rx_ring = SIZE.saturating_sub(self.drr.unread_bytes() as usize);
        let buf = (free_rx_ring / 64).min(255) as u8;
        self.frame[0] = (drained as u16 >> 8) as u8;
        self.frame[1] = (drained as u16 & 0xFF) as u8;
        self.frame[2] = buf;

        self.tx_dma.start(&self.frame);
        self.stats.tx_bytes = self.stats.tx_bytes.wrapping_add(drained as u32);
        self.ready.assert();
        self.handshake = Handshake::Ready;
    }

    fn refresh_irq(&mut self) {
        if self.handshake != Handshake::Idle {
            return;
        }
        if self.tx_queue.is_empty() {
            self.irq.deassert();
        } else {
            self.irq.assert();
        }
    }
}
