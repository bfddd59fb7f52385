//! SETUP packet decoding
//!
//! Every control transfer opens with an 8-byte SETUP packet:
//!
//! - `bmRequestType` (1 byte): direction, request kind, recipient
//! - `bRequest` (1 byte): request identifier
//! - `wValue` (2 bytes, little endian): request argument
//! - `wIndex` (2 bytes, little endian): request argument
//! - `wLength` (2 bytes, little endian): data-stage length bound

/// Length of a SETUP packet on the wire
pub const SETUP_PACKET_LEN: usize = 8;

const DEVICE_TO_HOST: u8 = 0x80;

/// Who a request is addressed to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Recipient {
    Device,
    Interface,
    Endpoint,
    Other,
    Reserved,
}

/// Which request namespace a SETUP packet uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RequestKind {
    Standard,
    Class,
    Vendor,
    Reserved,
}

/// The standard device requests of USB 2.0 chapter 9
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StandardRequest {
    GetStatus,
    ClearFeature,
    SetFeature,
    SetAddress,
    GetDescriptor,
    SetDescriptor,
    GetConfiguration,
    SetConfiguration,
    GetInterface,
    SetInterface,
    SynchFrame,
}

impl StandardRequest {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(StandardRequest::GetStatus),
            1 => Some(StandardRequest::ClearFeature),
            3 => Some(StandardRequest::SetFeature),
            5 => Some(StandardRequest::SetAddress),
            6 => Some(StandardRequest::GetDescriptor),
            7 => Some(StandardRequest::SetDescriptor),
            8 => Some(StandardRequest::GetConfiguration),
            9 => Some(StandardRequest::SetConfiguration),
            10 => Some(StandardRequest::GetInterface),
            11 => Some(StandardRequest::SetInterface),
            12 => Some(StandardRequest::SynchFrame),
            _ => None,
        }
    }
}

/// A decoded SETUP packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SetupPacket {
    /// Raw `bmRequestType` byte
    pub request_type: u8,
    /// `bRequest`
    pub request: u8,
    /// `wValue`
    pub value: u16,
    /// `wIndex`
    pub index: u16,
    /// `wLength`: number of data-stage bytes (OUT) or an upper bound (IN)
    pub length: u16,
}

impl SetupPacket {
    /// Decode the 8 bytes read from the control FIFO
    pub fn parse(bytes: &[u8; SETUP_PACKET_LEN]) -> Self {
        SetupPacket {
            request_type: bytes[0],
            request: bytes[1],
            value: u16::from_le_bytes([bytes[2], bytes[3]]),
            index: u16::from_le_bytes([bytes[4], bytes[5]]),
            length: u16::from_le_bytes([bytes[6], bytes[7]]),
        }
    }

    /// True when the data stage flows device to host (IN)
    pub fn is_device_to_host(&self) -> bool {
        self.request_type & DEVICE_TO_HOST != 0
    }

    /// Request namespace
    pub fn kind(&self) -> RequestKind {
        match (self.request_type >> 5) & 0b11 {
            0 => RequestKind::Standard,
            1 => RequestKind::Class,
            2 => RequestKind::Vendor,
            _ => RequestKind::Reserved,
        }
    }

    /// Request recipient
    pub fn recipient(&self) -> Recipient {
        match self.request_type & 0x1F {
            0 => Recipient::Device,
            1 => Recipient::Interface,
            2 => Recipient::Endpoint,
            3 => Recipient::Other,
            _ => Recipient::Reserved,
        }
    }

    /// The standard request this packet carries, if it is one
    pub fn standard_request(&self) -> Option<StandardRequest> {
        if self.kind() != RequestKind::Standard {
            return None;
        }
        StandardRequest::from_u8(self.request)
    }

    /// Low byte of `wValue` (the address in SET_ADDRESS, the descriptor
    /// index in GET_DESCRIPTOR)
    pub fn value_low(&self) -> u8 {
        self.value as u8
    }

    /// High byte of `wValue` (the descriptor type in GET_DESCRIPTOR)
    pub fn value_high(&self) -> u8 {
        (self.value >> 8) as u8
    }
}
