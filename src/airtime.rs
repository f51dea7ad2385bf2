//! The LoRa airtime model.
//!
//! A pure function: given radio parameters and a payload size, predicts the
//! time a transmission would spend on air, using the "Semtech AN1200.13"
//! symbol-time formula. No I/O, no state.

use serde::{Deserialize, Serialize};

/// LoRa radio parameters, immutable per channel configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RadioParameters {
    /// Spreading factor, 7-12.
    pub spreading_factor: u8,
    /// Bandwidth in Hz (125_000, 250_000, or 500_000).
    pub bandwidth_hz: u32,
    /// Coding rate denominator offset: 1 for 4/5 ... 4 for 4/8.
    pub coding_rate: u8,
    pub preamble_symbols: f64,
    pub explicit_header: bool,
    pub crc_enabled: bool,
    pub low_data_rate_optimize: bool,
}

impl RadioParameters {
    pub fn eu868_default() -> Self {
        RadioParameters {
            spreading_factor: 9,
            bandwidth_hz: 125_000,
            coding_rate: 1,
            preamble_symbols: 8.0,
            explicit_header: true,
            crc_enabled: true,
            low_data_rate_optimize: false,
        }
    }
}

/// Result of the airtime model for a single payload.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AirtimeEstimate {
    pub duration_ms: f64,
    pub fragment_count: u32,
}

/// `T_symbol = 2^SF / BW` (seconds).
fn symbol_time_seconds(params: &RadioParameters) -> f64 {
    2.0_f64.powi(params.spreading_factor as i32) / params.bandwidth_hz as f64
}

/// Predict on-air time in milliseconds for `payload_size` bytes at the given
/// radio parameters:
///
/// ```text
/// N_payload = 8 + max(ceil((8P - 4SF + 28 + 16*CRC - 20*HeaderImplicit)
///                          / (4*(SF - 2*LDRO))) * (CR + 4), 0)
/// T_air = (N_preamble + 4.25 + N_payload) * T_symbol
/// ```
pub fn estimate_airtime_ms(payload_size: usize, params: &RadioParameters) -> f64 {
    let t_sym = symbol_time_seconds(params);
    let sf = params.spreading_factor as f64;
    let p = payload_size as f64;
    let crc = if params.crc_enabled { 1.0 } else { 0.0 };
    let header_implicit = if params.explicit_header { 0.0 } else { 1.0 };
    let ldro = if params.low_data_rate_optimize { 1.0 } else { 0.0 };
    let cr = params.coding_rate as f64;

    let denom = 4.0 * (sf - 2.0 * ldro);
    let numerator = 8.0 * p - 4.0 * sf + 28.0 + 16.0 * crc - 20.0 * header_implicit;
    let base = (numerator / denom).ceil().max(0.0);
    let n_payload = 8.0 + base * (cr + 4.0);

    let t_air_seconds = (params.preamble_symbols + 4.25 + n_payload) * t_sym;
    t_air_seconds * 1000.0
}

/// Number of fragments `ceil(payload_size / max_fragment_size)` needed to
/// carry a payload of `payload_size` bytes.
pub fn fragment_count(payload_size: usize, max_fragment_size: usize) -> u32 {
    if payload_size == 0 {
        return 0;
    }
    payload_size.div_ceil(max_fragment_size.max(1)) as u32
}

/// Convenience combining both outputs of the airtime model.
pub fn estimate(payload_size: usize, max_fragment_size: usize, params: &RadioParameters) -> AirtimeEstimate {
    AirtimeEstimate {
        duration_ms: estimate_airtime_ms(payload_size, params),
        fragment_count: fragment_count(payload_size, max_fragment_size),
    }
}
