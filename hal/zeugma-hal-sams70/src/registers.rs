//! USBHS register map
//!
//! Explicit offsets and masks for the device-mode half of the USBHS
//! controller, plus the PMC registers its clock bring-up touches. All
//! flag-to-bit mappings live in the tables here; `usbhs.rs` only ever
//! performs masked reads and writes against these constants.
//!
//! Register blocks:
//!
//! | Offset  | Registers                                      |
//! |---------|------------------------------------------------|
//! | 0x0000  | DEVCTRL, DEVISR, DEVICR, DEVIFR, DEVIMR,       |
//! |         | DEVIDR, DEVIER, DEVEPT, DEVFNUM                |
//! | 0x0100  | DEVEPTCFG[10]                                  |
//! | 0x0130  | DEVEPTISR[10] (+ ICR, IFR, IMR, IER, IDR sets) |
//! | 0x0310  | DEVDMA channels 1..=7 (NXTDSC, ADDRESS,        |
//! |         | CONTROL, STATUS; 0x10 stride)                  |
//! | 0x0800  | CTRL, SR, SCR, SFR                             |

use zeugma_hal::{DeviceFlag, EndpointFlag};

/// USBHS peripheral base address
pub const USBHS_BASE: usize = 0x4003_8000;

/// DPRAM FIFO window; one 32 KiB aperture per endpoint
pub const USBHS_RAM: usize = 0xA010_0000;
pub const FIFO_STRIDE: usize = 0x8000;

/// Peripheral identifier (NVIC interrupt number)
pub const ID_USBHS: u16 = 34;

/// Number of DMA channels; channel `n` serves endpoint `n`
pub const DMA_CHANNELS: u8 = 7;

// Device-global registers
pub const DEVCTRL: usize = 0x0000;
pub const DEVISR: usize = 0x0004;
pub const DEVICR: usize = 0x0008;
pub const DEVIFR: usize = 0x000C;
pub const DEVIMR: usize = 0x0010;
pub const DEVIDR: usize = 0x0014;
pub const DEVIER: usize = 0x0018;
pub const DEVEPT: usize = 0x001C;
pub const DEVFNUM: usize = 0x0020;

// Per-endpoint register arrays (10 words each)
pub const DEVEPTCFG: usize = 0x0100;
pub const DEVEPTISR: usize = 0x0130;
pub const DEVEPTICR: usize = 0x0160;
pub const DEVEPTIFR: usize = 0x0190;
pub const DEVEPTIMR: usize = 0x01C0;
pub const DEVEPTIER: usize = 0x01F0;
pub const DEVEPTIDR: usize = 0x0220;

// DMA channel registers; channel n (endpoint n) at DEVDMA + (n-1)*DMA_STRIDE
pub const DEVDMA: usize = 0x0310;
pub const DMA_STRIDE: usize = 0x10;
pub const DMA_NXTDSC: usize = 0x0;
pub const DMA_ADDRESS: usize = 0x4;
pub const DMA_CONTROL: usize = 0x8;
pub const DMA_STATUS: usize = 0xC;

// General control/status
pub const CTRL: usize = 0x0800;
pub const SR: usize = 0x0804;

// CTRL bits
pub const CTRL_FRZCLK: u32 = 1 << 14;
pub const CTRL_USBE: u32 = 1 << 15;
pub const CTRL_UIMOD_DEVICE: u32 = 1 << 25;

// SR bits
pub const SR_SPEED_SHIFT: u32 = 12;
pub const SR_SPEED_MASK: u32 = 0b11 << SR_SPEED_SHIFT;
pub const SR_SPEED_FULL: u32 = 0;
pub const SR_SPEED_HIGH: u32 = 1;
pub const SR_SPEED_LOW: u32 = 2;
pub const SR_CLKUSABLE: u32 = 1 << 14;

// DEVCTRL bits
pub const DEVCTRL_UADD_MASK: u32 = 0x7F;
pub const DEVCTRL_ADDEN: u32 = 1 << 7;
pub const DEVCTRL_DETACH: u32 = 1 << 8;
pub const DEVCTRL_SPDCONF_MASK: u32 = 0b11 << 10;
pub const DEVCTRL_SPDCONF_FORCED_FS: u32 = 0b11 << 10;
pub const DEVCTRL_LS: u32 = 1 << 12;

// DEVISR layout: event flags low, endpoint summary bits from 12,
// DMA channel bits from 25 (channel 1 = endpoint 1 at bit 25)
pub const DEVISR_PEP_SHIFT: u32 = 12;
pub const DEVISR_DMA_SHIFT: u32 = 25;

// DEVEPT bits
pub const DEVEPT_EPEN_SHIFT: u32 = 0;
pub const DEVEPT_EPRST_SHIFT: u32 = 16;

// DEVEPTCFG bits the chip crate reads back
pub const DEVEPTCFG_ALLOC: u32 = 1 << 1;
pub const DEVEPTCFG_EPSIZE_SHIFT: u32 = 4;
pub const DEVEPTCFG_EPSIZE_MASK: u32 = 0b111 << DEVEPTCFG_EPSIZE_SHIFT;
pub const DEVEPTCFG_EPDIR: u32 = 1 << 8;

// DEVEPTISR bits beyond the event flags
pub const DEVEPTISR_CFGOK: u32 = 1 << 18;
pub const DEVEPTISR_BYCT_SHIFT: u32 = 20;
pub const DEVEPTISR_BYCT_MASK: u32 = 0x7FF << DEVEPTISR_BYCT_SHIFT;

// DEVEPTIMR / IER / IDR bits beyond the event flags
pub const DEVEPTIMR_FIFOCON: u32 = 1 << 14;
pub const DEVEPTIER_STALLRQS: u32 = 1 << 19;
pub const DEVEPTIDR_FIFOCONC: u32 = DEVEPTIMR_FIFOCON;

// DMA STATUS bits
pub const DMA_STATUS_CHANN_ENB: u32 = 1 << 0;
pub const DMA_STATUS_CHANN_ACT: u32 = 1 << 1;
pub const DMA_STATUS_END_TR_ST: u32 = 1 << 4;
pub const DMA_STATUS_END_BF_ST: u32 = 1 << 5;
pub const DMA_STATUS_DESC_LDST: u32 = 1 << 6;
pub const DMA_STATUS_BUFF_COUNT_SHIFT: u32 = 16;

// PMC registers used for USB clock bring-up
pub const PMC_BASE: usize = 0x400E_0600;
pub const PMC_SCER: usize = 0x0000;
pub const CKGR_UCKR: usize = 0x001C;
pub const PMC_USB: usize = 0x0038;
pub const PMC_SR: usize = 0x0068;
pub const PMC_FSMR: usize = 0x0070;
pub const PMC_PCER1: usize = 0x0100;

pub const PMC_SCER_USBCLK: u32 = 1 << 5;
pub const CKGR_UCKR_UPLLEN: u32 = 1 << 16;
pub const CKGR_UCKR_UPLLCOUNT_SHIFT: u32 = 20;
pub const PMC_SR_LOCKU: u32 = 1 << 6;
pub const PMC_USB_USBS: u32 = 1 << 0;
pub const PMC_USB_USBDIV_SHIFT: u32 = 8;
pub const PMC_FSMR_USBAL: u32 = 1 << 30;

/// Bit for a device-level event flag in DEVISR/DEVICR/DEVIMR/DEVIER/DEVIDR
pub fn device_flag_bit(flag: DeviceFlag) -> u32 {
    match flag {
        DeviceFlag::Suspend => 1 << 0,
        DeviceFlag::MicroStartOfFrame => 1 << 1,
        DeviceFlag::StartOfFrame => 1 << 2,
        DeviceFlag::EndOfReset => 1 << 3,
        DeviceFlag::Wakeup => 1 << 4,
    }
}

/// Bit for an endpoint-level event flag in DEVEPTISR/ICR/IMR/IER/IDR
pub fn endpoint_flag_bit(flag: EndpointFlag) -> u32 {
    match flag {
        EndpointFlag::InReady => 1 << 0,       // TXINI
        EndpointFlag::OutReceived => 1 << 1,   // RXOUTI
        EndpointFlag::SetupReceived => 1 << 2, // RXSTPI
        EndpointFlag::NakOut => 1 << 3,        // NAKOUTI
        EndpointFlag::NakIn => 1 << 4,         // NAKINI
        EndpointFlag::ShortPacket => 1 << 7,   // SHORTPACKET
    }
}
