//! Endpoint configuration word
//!
//! The device controller describes each endpoint with a single 32-bit
//! configuration word (buffer allocation, bank count, buffer size,
//! direction, type). [`EndpointConfig`] carries that word in the layout
//! the hardware expects, so the core can assemble it once and a chip
//! crate can write it straight to the endpoint configuration register.
//!
//! Field layout (USBHS `DEVEPTCFG`):
//!
//! | Bits  | Field   | Meaning                                  |
//! |-------|---------|------------------------------------------|
//! | 1     | ALLOC   | DPRAM allocated for this endpoint        |
//! | 3:2   | EPBK    | bank count - 1                           |
//! | 6:4   | EPSIZE  | log2(size) - 3 (8 bytes ... 1024 bytes)  |
//! | 8     | EPDIR   | 1 = IN (device to host)                  |
//! | 9     | AUTOSW  | automatic bank switching                 |
//! | 12:11 | EPTYPE  | control/iso/bulk/interrupt               |
//! | 14:13 | NBTRANS | transactions per microframe - 1          |

/// Transfer direction, seen from the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Direction {
    /// Host to device
    Out,
    /// Device to host
    In,
}

/// Endpoint transfer type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EndpointKind {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

impl EndpointKind {
    /// EPTYPE field value
    pub fn bits(self) -> u32 {
        match self {
            EndpointKind::Control => 0,
            EndpointKind::Isochronous => 1,
            EndpointKind::Bulk => 2,
            EndpointKind::Interrupt => 3,
        }
    }

    fn from_bits(bits: u32) -> Self {
        match bits & 0b11 {
            0 => EndpointKind::Control,
            1 => EndpointKind::Isochronous,
            2 => EndpointKind::Bulk,
            _ => EndpointKind::Interrupt,
        }
    }
}

/// Buffer settings requested for one endpoint
///
/// The device/protocol layer hands one of these back for each endpoint it
/// wants configured; the core clamps it to the hardware limits before
/// touching any register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EndpointRequest {
    /// Requested buffer size in bytes (rounded up to the next supported size)
    pub size: u16,
    /// Requested bank count (1-3; double/triple buffering)
    pub banks: u8,
    /// Transfer type
    pub kind: EndpointKind,
    /// Direction seen from the host
    pub direction: Direction,
}

const ALLOC: u32 = 1 << 1;
const EPBK_SHIFT: u32 = 2;
const EPBK_MASK: u32 = 0b11 << EPBK_SHIFT;
const EPSIZE_SHIFT: u32 = 4;
const EPSIZE_MASK: u32 = 0b111 << EPSIZE_SHIFT;
const EPDIR: u32 = 1 << 8;
const AUTOSW: u32 = 1 << 9;
const EPTYPE_SHIFT: u32 = 11;
const EPTYPE_MASK: u32 = 0b11 << EPTYPE_SHIFT;
const NBTRANS_SHIFT: u32 = 13;
const NBTRANS_MASK: u32 = 0b11 << NBTRANS_SHIFT;

/// Hardware-ready endpoint configuration word
///
/// The all-zero value is the null configuration: "do not configure this
/// endpoint". Everything else carries the ALLOC bit plus the encoded
/// buffer settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EndpointConfig(u32);

impl EndpointConfig {
    /// The "leave this endpoint unconfigured" sentinel
    pub const NULL: EndpointConfig = EndpointConfig(0);

    /// Assemble a configuration word from already-legal settings
    ///
    /// `size` must be a supported bucket (8, 16, ..., 1024) and `banks`
    /// must be 1-3; the core's encoder guarantees both.
    pub fn from_parts(kind: EndpointKind, direction: Direction, size: u16, banks: u8) -> Self {
        let epsize = (size.max(8) as u32).ilog2() - 3;
        let epbk = (banks.clamp(1, 3) as u32) - 1;
        let dir = match direction {
            Direction::In => EPDIR,
            Direction::Out => 0,
        };
        EndpointConfig(
            ALLOC
                | (epbk << EPBK_SHIFT)
                | (epsize << EPSIZE_SHIFT)
                | dir
                | (kind.bits() << EPTYPE_SHIFT),
        )
    }

    /// Enable automatic bank switching (used on all non-control endpoints)
    pub fn with_autoswitch(self) -> Self {
        EndpointConfig(self.0 | AUTOSW)
    }

    /// Fold in the transactions-per-microframe count (interrupt endpoints)
    pub fn with_transactions_per_microframe(self, count: u8) -> Self {
        let nbtrans = (count.clamp(1, 3) as u32) - 1;
        EndpointConfig((self.0 & !NBTRANS_MASK) | (nbtrans << NBTRANS_SHIFT))
    }

    /// True for the null ("do not configure") word
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Decoded buffer size in bytes
    pub fn size(self) -> u16 {
        8 << ((self.0 & EPSIZE_MASK) >> EPSIZE_SHIFT)
    }

    /// Decoded bank count (1-3)
    pub fn banks(self) -> u8 {
        (((self.0 & EPBK_MASK) >> EPBK_SHIFT) as u8) + 1
    }

    /// Decoded transfer type
    pub fn kind(self) -> EndpointKind {
        EndpointKind::from_bits((self.0 & EPTYPE_MASK) >> EPTYPE_SHIFT)
    }

    /// Decoded direction
    pub fn direction(self) -> Direction {
        if self.0 & EPDIR != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }

    /// Decoded transactions per microframe (1-3)
    pub fn transactions_per_microframe(self) -> u8 {
        (((self.0 & NBTRANS_MASK) >> NBTRANS_SHIFT) as u8) + 1
    }

    /// Raw register value
    pub fn bits(self) -> u32 {
        self.0
    }
}
