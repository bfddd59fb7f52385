//! Control-transfer state
//!
//! Endpoint 0 carries one SETUP-initiated exchange at a time. This
//! module holds the phase of that exchange plus the data queued for its
//! IN stage: two segments, sent in order, so a response header and its
//! payload can be queued separately without first gluing them together.
//!
//! Phase transitions are driven exclusively by the checkers in
//! [`crate::device`]; the methods the device/protocol layer may call
//! ([`ControlState::write_to_control`], [`ControlState::read_from_control`],
//! [`ControlState::set_address_available`]) only queue work for those
//! checkers to act on.

use heapless::Vec;

/// Capacity of each queued IN-stage segment, in bytes
pub const CONTROL_SEGMENT_CAPACITY: usize = 512;

/// Phase of the current control transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ControlPhase {
    /// Waiting for a SETUP packet
    #[default]
    Setup,
    /// Waiting for OUT data packets from the host
    DataOut,
    /// Sending IN data packets to the host
    DataIn,
    /// Waiting for the host to collect the status-stage IN ZLP
    HandshakeWaitInZlp,
    /// Waiting for the host's status-stage OUT ZLP
    HandshakeWaitOutZlp,
    /// STALL requested on both directions after a protocol error
    StallRequested,
}

impl ControlPhase {
    /// True while a data stage is in progress in either direction
    pub fn in_data_stage(self) -> bool {
        matches!(self, ControlPhase::DataIn | ControlPhase::DataOut)
    }

    /// True while waiting for a status-stage ZLP
    pub fn in_handshake(self) -> bool {
        matches!(
            self,
            ControlPhase::HandshakeWaitInZlp | ControlPhase::HandshakeWaitOutZlp
        )
    }
}

/// Errors from queueing control-transfer data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ControlError {
    /// A queued segment exceeds [`CONTROL_SEGMENT_CAPACITY`]
    SegmentTooLarge,
}

/// One queued IN-stage segment with its read position
#[derive(Debug, Clone, Default)]
struct Segment {
    data: Vec<u8, CONTROL_SEGMENT_CAPACITY>,
    pos: usize,
}

impl Segment {
    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn clear(&mut self) {
        self.data.clear();
        self.pos = 0;
    }

    /// Shrink the unread part of the segment to at most `limit` bytes
    fn truncate_remaining(&mut self, limit: usize) {
        self.data.truncate(self.pos + limit.min(self.remaining()));
    }

    /// Copy unread bytes into `out`, advancing the read position
    fn drain_into(&mut self, out: &mut [u8]) -> usize {
        let n = self.remaining().min(out.len());
        out[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        n
    }
}

/// State of endpoint 0's current SETUP-initiated exchange
#[derive(Debug, Clone, Default)]
pub struct ControlState {
    pub(crate) phase: ControlPhase,
    segments: [Segment; 2],
    pub(crate) address_available: bool,
    read_capacity: u16,
    read_received: u16,
    configuration: u8,
}

impl ControlState {
    pub(crate) fn new() -> Self {
        ControlState::default()
    }

    /// Current transfer phase
    pub fn phase(&self) -> ControlPhase {
        self.phase
    }

    /// Queue up to two segments of IN-stage data for the current transfer
    ///
    /// The segments are sent in order and the total is clamped to the
    /// SETUP packet's `wLength` as packets are produced. Either segment
    /// may be empty.
    pub fn write_to_control(&mut self, seg0: &[u8], seg1: &[u8]) -> Result<(), ControlError> {
        if seg0.len() > CONTROL_SEGMENT_CAPACITY || seg1.len() > CONTROL_SEGMENT_CAPACITY {
            return Err(ControlError::SegmentTooLarge);
        }
        for (segment, source) in self.segments.iter_mut().zip([seg0, seg1]) {
            segment.clear();
            // Length checked above
            let _ = segment.data.extend_from_slice(source);
        }
        Ok(())
    }

    /// Arm the OUT data stage of the current transfer
    ///
    /// Up to `capacity` bytes will be accepted from the host and handed
    /// to the driver's `control_read_complete` as they arrive.
    pub fn read_from_control(&mut self, capacity: u16) {
        self.read_capacity = capacity;
        self.read_received = 0;
        self.phase = ControlPhase::DataOut;
    }

    /// Mark that a SET_ADDRESS was accepted; the address is applied only
    /// once the status-stage ZLP completes
    pub fn set_address_available(&mut self) {
        self.address_available = true;
    }

    /// True while an accepted SET_ADDRESS is waiting for its status stage
    pub fn address_available(&self) -> bool {
        self.address_available
    }

    /// Record the configuration number selected by the host (0 = none)
    pub fn set_configuration(&mut self, configuration: u8) {
        self.configuration = configuration;
    }

    /// Configuration currently selected by the host (0 = none)
    pub fn configuration(&self) -> u8 {
        self.configuration
    }

    /// Reset to the SETUP phase, dropping any queued data
    pub(crate) fn reset_to_setup(&mut self) {
        self.phase = ControlPhase::Setup;
        for segment in &mut self.segments {
            segment.clear();
        }
        self.read_capacity = 0;
        self.read_received = 0;
    }

    /// Unsent IN-stage bytes across both segments
    pub(crate) fn tx_remaining(&self) -> usize {
        self.segments.iter().map(Segment::remaining).sum()
    }

    /// Clamp the unsent IN-stage data to `limit` bytes, splitting the
    /// cut across the two segments
    pub(crate) fn clamp_tx_to(&mut self, limit: usize) {
        let first = self.segments[0].remaining();
        if first >= limit {
            self.segments[0].truncate_remaining(limit);
            self.segments[1].truncate_remaining(0);
        } else {
            self.segments[1].truncate_remaining(limit - first);
        }
    }

    /// Fill `packet` from the queued segments in order
    pub(crate) fn fill_packet(&mut self, packet: &mut [u8]) -> usize {
        let mut filled = 0;
        for segment in &mut self.segments {
            filled += segment.drain_into(&mut packet[filled..]);
        }
        filled
    }

    /// Remaining OUT-stage capacity armed by [`Self::read_from_control`]
    pub(crate) fn read_capacity(&self) -> u16 {
        self.read_capacity
    }

    /// OUT-stage bytes consumed so far
    pub(crate) fn read_received(&self) -> u16 {
        self.read_received
    }

    /// Account for `n` OUT-stage bytes handed to the driver
    pub(crate) fn consume_read(&mut self, n: u16) {
        self.read_capacity = self.read_capacity.saturating_sub(n);
        self.read_received = self.read_received.saturating_add(n);
    }
}
