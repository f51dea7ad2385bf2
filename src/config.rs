//! Region frequency plans and the single recognized configuration struct.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

use crate::envelope::Priority;

/// A named sub-band within a region's frequency plan.
#[derive(Debug, Clone, Deserialize)]
pub struct SubBand {
    pub name: String,
    pub center_freq_mhz: f64,
    pub min_freq_mhz: f64,
    pub max_freq_mhz: f64,
    /// Duty cycle cap specific to this sub-band (e.g. 0.001 for 863-865 MHz
    /// in the EU plan). Falls back to the region's overall cap when absent.
    pub duty_cycle_cap: Option<f64>,
}

/// A named region's regulatory frequency plan.
#[derive(Debug, Clone, Deserialize)]
pub struct FrequencyPlan {
    pub region: String,
    pub sub_bands: Vec<SubBand>,
    /// Overall duty-cycle cap as a fraction (e.g. 0.01 for 1%).
    pub duty_cycle_cap: f64,
    pub max_transmission_ms: u64,
    pub max_eirp_dbm: f32,
    /// Frequency-hopping dwell-time cap per channel in milliseconds (US: 400 ms).
    pub dwell_time_ms: Option<u64>,
    /// Whether CRITICAL priority may bypass the windowed cap when
    /// emergency-mode is enabled.
    pub allows_emergency_override: bool,
}

impl FrequencyPlan {
    pub fn eu868() -> Self {
        FrequencyPlan {
            region: "EU".to_string(),
            sub_bands: vec![
                SubBand {
                    name: "g1".to_string(),
                    center_freq_mhz: 868.1,
                    min_freq_mhz: 868.0,
                    max_freq_mhz: 868.6,
                    duty_cycle_cap: Some(0.01),
                },
                SubBand {
                    name: "g3".to_string(),
                    center_freq_mhz: 869.5,
                    min_freq_mhz: 869.4,
                    max_freq_mhz: 869.65,
                    duty_cycle_cap: Some(0.1),
                },
            ],
            duty_cycle_cap: 0.01,
            max_transmission_ms: 4000,
            max_eirp_dbm: 14.0,
            dwell_time_ms: None,
            allows_emergency_override: true,
        }
    }

    pub fn us915() -> Self {
        FrequencyPlan {
            region: "US".to_string(),
            sub_bands: vec![SubBand {
                name: "fhss".to_string(),
                center_freq_mhz: 915.0,
                min_freq_mhz: 902.0,
                max_freq_mhz: 928.0,
                duty_cycle_cap: None,
            }],
            duty_cycle_cap: 1.0,
            max_transmission_ms: 400,
            max_eirp_dbm: 30.0,
            dwell_time_ms: Some(400),
            allows_emergency_override: false,
        }
    }

    pub fn sub_band_for(&self, frequency_mhz: f64) -> Option<&SubBand> {
        self.sub_bands
            .iter()
            .find(|b| frequency_mhz >= b.min_freq_mhz && frequency_mhz <= b.max_freq_mhz)
    }
}

/// Retry policy for one reliability/priority class.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RetryPolicy {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter_max_ms: u64,
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub const fn critical() -> Self {
        RetryPolicy {
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter_max_ms: 100,
            max_attempts: 5,
        }
    }

    pub const fn high() -> Self {
        RetryPolicy {
            initial_delay_ms: 1500,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter_max_ms: 200,
            max_attempts: 4,
        }
    }

    pub const fn normal() -> Self {
        RetryPolicy {
            initial_delay_ms: 2000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter_max_ms: 300,
            max_attempts: 3,
        }
    }

    pub const fn low() -> Self {
        RetryPolicy {
            initial_delay_ms: 2000,
            max_delay_ms: 2000,
            backoff_multiplier: 1.0,
            jitter_max_ms: 500,
            max_attempts: 1,
        }
    }

    pub fn for_priority(priority: Priority) -> Self {
        match priority {
            Priority::Critical => Self::critical(),
            Priority::High => Self::high(),
            Priority::Normal => Self::normal(),
            Priority::Low => Self::low(),
        }
    }

    /// Lowercase key `overrides` is looked up under for a given priority.
    pub fn class_key(priority: Priority) -> &'static str {
        match priority {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }

    /// Resolve the retry policy for `priority`, preferring a configured
    /// override over the built-in default.
    pub fn resolve(priority: Priority, overrides: &HashMap<String, RetryPolicy>) -> Self {
        overrides.get(Self::class_key(priority)).copied().unwrap_or_else(|| Self::for_priority(priority))
    }
}

/// Per-priority queue capacities.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct QueueCapacity {
    pub total: usize,
    pub critical: usize,
    pub high: usize,
    pub normal: usize,
    pub low: usize,
    /// Emergency reserve exclusively for CRITICAL, subtracted from `total`
    /// when admitting non-CRITICAL messages.
    pub emergency_reserve: usize,
}

impl Default for QueueCapacity {
    fn default() -> Self {
        QueueCapacity {
            total: 256,
            critical: 64,
            high: 64,
            normal: 96,
            low: 64,
            emergency_reserve: 16,
        }
    }
}

/// The single recognized configuration struct.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Configuration {
    pub region: String,
    pub max_fragment_size: usize,
    pub session_timeout_ms: u64,
    pub max_concurrent_sessions: usize,
    pub beacon_interval_ms: u64,
    pub neighbor_timeout_ms: u64,
    pub max_neighbors: usize,
    pub retry_policies_by_class: HashMap<String, RetryPolicy>,
    pub compression_threshold: usize,
    pub max_expansion_ratio: u32,
    pub queue_capacity: QueueCapacity,
    pub reliable_max_pending_messages: usize,
    pub reliable_ack_timeout_ms: u64,
    pub enable_beacon_signing: bool,
    pub enable_emergency_override: bool,
}

impl Default for Configuration {
    fn default() -> Self {
        Configuration {
            region: "EU".to_string(),
            max_fragment_size: 197,
            session_timeout_ms: 30_000,
            max_concurrent_sessions: 64,
            beacon_interval_ms: 60_000,
            neighbor_timeout_ms: 300_000,
            max_neighbors: 64,
            retry_policies_by_class: HashMap::new(),
            compression_threshold: 100,
            max_expansion_ratio: 100,
            queue_capacity: QueueCapacity::default(),
            reliable_max_pending_messages: 128,
            reliable_ack_timeout_ms: 15_000,
            enable_beacon_signing: true,
            enable_emergency_override: false,
        }
    }
}

impl Configuration {
    /// Load a configuration from a TOML file, falling back to
    /// [`Configuration::default`] for any field the file omits.
    pub fn load(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read config file {}: {e}", path.display()))?;
        toml::from_str(&content).map_err(|e| format!("failed to parse config file: {e}"))
    }

    /// Maximum fragment payload after subtracting the 20-byte fragment
    /// header.
    pub fn max_fragment_payload(&self) -> usize {
        self.max_fragment_size.saturating_sub(crate::fragmentation::FRAGMENT_HEADER_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_configuration_has_expected_values() {
        let cfg = Configuration::default();
        assert_eq!(cfg.max_fragment_size, 197);
        assert_eq!(cfg.compression_threshold, 100);
        assert_eq!(cfg.max_expansion_ratio, 100);
    }

    #[test]
    fn us_plan_has_dwell_time_not_windowed_cap() {
        let us = FrequencyPlan::us915();
        assert_eq!(us.dwell_time_ms, Some(400));
        assert!(!us.allows_emergency_override);
    }

    #[test]
    fn eu_sub_band_lookup_finds_g1() {
        let eu = FrequencyPlan::eu868();
        let band = eu.sub_band_for(868.1).expect("band");
        assert_eq!(band.name, "g1");
    }

    #[test]
    fn retry_policy_defaults_scale_with_priority() {
        let critical = RetryPolicy::for_priority(Priority::Critical);
        assert_eq!(critical.max_attempts, 5);
        assert_eq!(critical.initial_delay_ms, 1000);
        assert_eq!(critical.backoff_multiplier, 2.0);

        let low = RetryPolicy::for_priority(Priority::Low);
        assert_eq!(low.max_attempts, 1);
    }

    #[test]
    fn resolve_prefers_configured_override_over_default() {
        let mut overrides = HashMap::new();
        overrides.insert("normal".to_string(), RetryPolicy { max_attempts: 9, ..RetryPolicy::normal() });

        let overridden = RetryPolicy::resolve(Priority::Normal, &overrides);
        assert_eq!(overridden.max_attempts, 9);

        let unaffected = RetryPolicy::resolve(Priority::High, &overrides);
        assert_eq!(unaffected.max_attempts, RetryPolicy::high().max_attempts);
    }
}
