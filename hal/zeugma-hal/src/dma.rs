//! DMA channel descriptors
//!
//! Each non-control endpoint owns one DMA channel. A transfer is
//! described by a [`DmaDescriptor`]; the chip crate writes its fields
//! into the channel registers and the hardware moves data between RAM
//! and the endpoint FIFO without per-byte CPU involvement.

/// Channel command, written alongside the descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DmaCommand {
    /// Stop immediately
    #[default]
    Stop,
    /// Run the current descriptor, then stop
    RunAndStop,
    /// Load the next descriptor without running
    LoadNextDescriptor,
    /// Run the current descriptor, then load the next
    RunAndLink,
}

impl DmaCommand {
    /// The (LDNXT_DSC, CHANN_ENB) bit pair in the channel control register
    pub fn bits(self) -> u32 {
        match self {
            DmaCommand::Stop => 0b00,
            DmaCommand::RunAndStop => 0b01,
            DmaCommand::LoadNextDescriptor => 0b10,
            DmaCommand::RunAndLink => 0b11,
        }
    }
}

const END_TR_EN: u32 = 1 << 2;
const END_B_EN: u32 = 1 << 3;
const END_TR_IT: u32 = 1 << 4;
const END_BUFFIT: u32 = 1 << 5;
const DESC_LD_IT: u32 = 1 << 6;
const BURST_LCK: u32 = 1 << 7;
const BUFF_LENGTH_SHIFT: u32 = 16;

/// One in-flight transfer on a non-control endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DmaDescriptor {
    /// Source/destination buffer address. Carried as a plain address so
    /// the portable core never dereferences it; only the chip crate
    /// hands it to hardware.
    pub addr: usize,
    /// Remaining transfer length in bytes
    pub len: u16,
    /// Channel command
    pub command: DmaCommand,
    /// Close the transfer when the USB end-of-transfer condition occurs
    pub end_transfer_enable: bool,
    /// Validate the packet when the byte counter reaches zero
    pub end_buffer_enable: bool,
    /// Interrupt at USB end of transfer
    pub end_transfer_irq: bool,
    /// Interrupt when the byte counter reaches zero
    pub end_buffer_irq: bool,
    /// Interrupt when the descriptor is loaded
    pub descriptor_loaded_irq: bool,
    /// Lock the system bus for the duration of each burst
    pub burst_lock: bool,
}

impl DmaDescriptor {
    /// Describe a transfer of `len` bytes at `addr`
    pub fn new(addr: usize, len: u16) -> Self {
        DmaDescriptor {
            addr,
            len,
            ..Default::default()
        }
    }

    /// Point the descriptor at a buffer
    pub fn set_buffer(&mut self, addr: usize, len: u16) {
        self.addr = addr;
        self.len = len;
    }

    /// Channel CONTROL register value for this descriptor
    pub fn control_bits(&self) -> u32 {
        let mut bits = self.command.bits() | ((self.len as u32) << BUFF_LENGTH_SHIFT);
        if self.end_transfer_enable {
            bits |= END_TR_EN;
        }
        if self.end_buffer_enable {
            bits |= END_B_EN;
        }
        if self.end_transfer_irq {
            bits |= END_TR_IT;
        }
        if self.end_buffer_irq {
            bits |= END_BUFFIT;
        }
        if self.descriptor_loaded_irq {
            bits |= DESC_LD_IT;
        }
        if self.burst_lock {
            bits |= BURST_LCK;
        }
        bits
    }
}

/// Snapshot of a channel's status register
///
/// Reading the hardware register clears the event bits, so the core
/// takes one snapshot per interrupt and works from that.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DmaStatus {
    /// Channel is enabled and moving data
    pub active: bool,
    /// USB end-of-transfer condition closed the transfer
    pub end_transfer: bool,
    /// Byte counter reached zero
    pub end_buffer: bool,
    /// A descriptor load completed
    pub descriptor_loaded: bool,
    /// Bytes left in the byte counter at the time of the snapshot
    pub remaining: u16,
}
