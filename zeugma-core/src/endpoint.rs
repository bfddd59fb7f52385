//! Endpoint configuration encoding
//!
//! Translates the buffer settings the device/protocol layer asks for
//! into a hardware-legal configuration word, clamping to the limits of
//! the endpoint the word is destined for. Pure functions; nothing here
//! touches a register.

use zeugma_hal::{Direction, EndpointConfig, EndpointKind, EndpointRequest, Speed};

/// Highest endpoint index the controller implements
pub const MAX_ENDPOINT: u8 = 9;

/// The control endpoint index
pub const CONTROL_ENDPOINT: u8 = 0;

/// Largest packet the control endpoint can carry
pub const CONTROL_MAX_PACKET_SIZE: usize = 64;

/// Largest buffer size any endpoint supports, in bytes
pub fn max_size(endpoint: u8) -> u16 {
    if endpoint == CONTROL_ENDPOINT {
        64
    } else {
        1024
    }
}

/// Largest bank count an endpoint supports
pub fn max_banks(endpoint: u8) -> u8 {
    match endpoint {
        0 => 1,
        1 | 2 => 3,
        _ => 2,
    }
}

/// Control packet size mandated by the negotiated bus speed
pub fn control_packet_size(speed: Speed) -> u16 {
    match speed {
        Speed::Low => 8,
        Speed::Full | Speed::High => 64,
    }
}

/// Round a requested size up to the next supported bucket (8..=1024)
fn size_bucket(size: u16) -> u16 {
    size.clamp(8, 1024).next_power_of_two()
}

/// Encode the configuration word for one endpoint
///
/// The request is clamped to the endpoint's limits rather than rejected:
/// sizes round up to the next bucket and then down to the per-endpoint
/// maximum, bank counts clamp to the per-endpoint maximum, and endpoint 0
/// is always a single-bank control endpoint. An index beyond
/// [`MAX_ENDPOINT`] yields [`EndpointConfig::NULL`], meaning "do not
/// configure this endpoint".
pub fn encode_config(endpoint: u8, request: EndpointRequest) -> EndpointConfig {
    if endpoint > MAX_ENDPOINT {
        return EndpointConfig::NULL;
    }

    let size = size_bucket(request.size).min(max_size(endpoint));
    let banks = request.banks.clamp(1, max_banks(endpoint));
    let (kind, direction) = if endpoint == CONTROL_ENDPOINT {
        (EndpointKind::Control, Direction::Out)
    } else {
        (request.kind, request.direction)
    };

    let mut config = EndpointConfig::from_parts(kind, direction, size, banks);
    if endpoint != CONTROL_ENDPOINT {
        config = config.with_autoswitch();
    }
    if kind == EndpointKind::Interrupt {
        // One transaction per microframe per available bank
        config = config.with_transactions_per_microframe(banks);
    }
    config
}
