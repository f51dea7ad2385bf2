//! The duty-cycle governor.
//!
//! Tracks a sliding window of transmission records per sub-band and decides
//! whether a prospective transmission may proceed: track sent packets,
//! retain within period, sum time-on-air, generalized to a frequency-plan
//! and priority model with per-region duty-cycle caps.

use std::collections::VecDeque;

use crate::clock::Clock;
use crate::config::FrequencyPlan;
use crate::envelope::Priority;

/// One completed transmission, retained in the sliding window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransmissionRecord {
    pub start_ms: u64,
    pub duration_ms: u64,
    pub frequency_mhz: f64,
    pub power_dbm: f32,
    pub priority: Priority,
}

/// Outcome of a [`DutyCycleGovernor::can_transmit`] check.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    Allow,
    Defer { wait_ms: u64 },
    Deny { reason: String },
}

struct SubBandWindow {
    records: VecDeque<TransmissionRecord>,
    /// Last hop's dwell window start, for frequency-hopping dwell-time caps.
    dwell_window_start_ms: u64,
    dwell_used_ms: u64,
    current_channel_mhz: Option<f64>,
}

impl SubBandWindow {
    fn new() -> Self {
        SubBandWindow {
            records: VecDeque::new(),
            dwell_window_start_ms: 0,
            dwell_used_ms: 0,
            current_channel_mhz: None,
        }
    }

    fn gc(&mut self, now_ms: u64, window_ms: u64) {
        let cutoff = now_ms.saturating_sub(window_ms);
        while let Some(front) = self.records.front() {
            if front.start_ms < cutoff {
                self.records.pop_front();
            } else {
                break;
            }
        }
    }

    fn windowed_sum_ms(&self) -> u64 {
        self.records.iter().map(|r| r.duration_ms).sum()
    }
}

/// Sliding-window airtime tracker that admits, defers, or denies
/// transmissions according to the active region's frequency plan.
pub struct DutyCycleGovernor<C: Clock> {
    clock: C,
    region: FrequencyPlan,
    window_ms: u64,
    sub_bands: Vec<SubBandWindow>,
    emergency_mode: bool,
}

impl<C: Clock> DutyCycleGovernor<C> {
    pub fn new(clock: C, region: FrequencyPlan, window_ms: u64) -> Self {
        let sub_bands = region.sub_bands.iter().map(|_| SubBandWindow::new()).collect();
        DutyCycleGovernor {
            clock,
            region,
            window_ms,
            sub_bands,
            emergency_mode: false,
        }
    }

    pub fn set_emergency_mode(&mut self, on: bool) {
        self.emergency_mode = on;
    }

    /// Access the governor's clock (e.g. to advance a [`VirtualClock`] in tests).
    pub fn clock(&self) -> &C {
        &self.clock
    }

    fn sub_band_index(&self, frequency_mhz: f64) -> Option<usize> {
        self.region
            .sub_bands
            .iter()
            .position(|b| frequency_mhz >= b.min_freq_mhz && frequency_mhz <= b.max_freq_mhz)
    }

    fn cap_for(&self, sub_band_idx: usize) -> f64 {
        self.region.sub_bands[sub_band_idx]
            .duty_cycle_cap
            .unwrap_or(self.region.duty_cycle_cap)
    }

    /// Decide whether a transmission of `estimated_ms` at `frequency_mhz`
    /// may proceed right now.
    pub fn can_transmit(&mut self, estimated_ms: u64, priority: Priority, frequency_mhz: f64) -> Admission {
        if estimated_ms > self.region.max_transmission_ms {
            return Admission::Deny {
                reason: format!(
                    "{estimated_ms} ms exceeds the region's max single transmission of {} ms",
                    self.region.max_transmission_ms
                ),
            };
        }

        let Some(idx) = self.sub_band_index(frequency_mhz) else {
            return Admission::Deny { reason: format!("{frequency_mhz} MHz is outside any configured sub-band") };
        };

        let now = self.clock.now_ms();
        self.sub_bands[idx].gc(now, self.window_ms);

        if let Some(dwell_ms) = self.region.dwell_time_ms {
            if let Admission::Deny { reason } = self.check_dwell(idx, now, dwell_ms, frequency_mhz, estimated_ms) {
                return Admission::Deny { reason };
            }
        }

        let cap = self.cap_for(idx);
        let emergency_exempt =
            priority == Priority::Critical && self.emergency_mode && self.region.allows_emergency_override;

        if emergency_exempt {
            return Admission::Allow;
        }

        let window = &self.sub_bands[idx];
        let projected = window.windowed_sum_ms() + estimated_ms;
        let budget_ms = (cap * self.window_ms as f64) as u64;

        if projected <= budget_ms {
            Admission::Allow
        } else {
            Admission::Defer { wait_ms: self.min_wait_for_budget(idx, estimated_ms, budget_ms) }
        }
    }

    /// US-style frequency-hopping dwell-time enforcement: at most
    /// `dwell_ms` spent on a single channel within its own dwell window.
    fn check_dwell(
        &mut self,
        idx: usize,
        now: u64,
        dwell_ms: u64,
        frequency_mhz: f64,
        estimated_ms: u64,
    ) -> Admission {
        let window = &mut self.sub_bands[idx];
        let same_channel = window.current_channel_mhz == Some(frequency_mhz);
        if !same_channel || now.saturating_sub(window.dwell_window_start_ms) > dwell_ms {
            window.current_channel_mhz = Some(frequency_mhz);
            window.dwell_window_start_ms = now;
            window.dwell_used_ms = 0;
        }
        if window.dwell_used_ms + estimated_ms > dwell_ms {
            return Admission::Deny { reason: "dwell time limit".to_string() };
        }
        Admission::Allow
    }

    /// Minimum additional wait before enough records age out of the window
    /// for `estimated_ms` of new airtime to fit under `budget_ms`.
    fn min_wait_for_budget(&self, idx: usize, estimated_ms: u64, budget_ms: u64) -> u64 {
        let window = &self.sub_bands[idx];
        let mut running = window.windowed_sum_ms();
        for record in window.records.iter() {
            if running + estimated_ms <= budget_ms {
                break;
            }
            running = running.saturating_sub(record.duration_ms);
            let age_needed = self.window_ms.saturating_sub(self.clock.now_ms().saturating_sub(record.start_ms));
            if running + estimated_ms <= budget_ms {
                return age_needed;
            }
        }
        self.window_ms
    }

    /// Record a completed transmission, appended after the radio reports
    /// transmit-complete.
    pub fn record_transmission(&mut self, record: TransmissionRecord) {
        let Some(idx) = self.sub_band_index(record.frequency_mhz) else { return };
        let window = &mut self.sub_bands[idx];
        window.dwell_used_ms += record.duration_ms;
        window.records.push_back(record);
    }

    /// Current duty cycle (fraction) for the sub-band containing `frequency_mhz`.
    pub fn current_duty_cycle(&mut self, frequency_mhz: f64) -> f64 {
        let Some(idx) = self.sub_band_index(frequency_mhz) else { return 0.0 };
        let now = self.clock.now_ms();
        self.sub_bands[idx].gc(now, self.window_ms);
        self.sub_bands[idx].windowed_sum_ms() as f64 / self.window_ms as f64
    }

    /// Milliseconds of airtime remaining this window at the given sub-band's cap.
    pub fn remaining_airtime_ms(&mut self, frequency_mhz: f64) -> u64 {
        let Some(idx) = self.sub_band_index(frequency_mhz) else { return 0 };
        let now = self.clock.now_ms();
        self.sub_bands[idx].gc(now, self.window_ms);
        let cap = self.cap_for(idx);
        let budget_ms = (cap * self.window_ms as f64) as u64;
        budget_ms.saturating_sub(self.sub_bands[idx].windowed_sum_ms())
    }

    /// Atomically swap the active frequency plan. Records are preserved;
    /// sub-band accounting is reset since sub-band boundaries may differ.
    pub fn update_region(&mut self, new_region: FrequencyPlan) {
        let preserved: Vec<TransmissionRecord> =
            self.sub_bands.iter().flat_map(|w| w.records.iter().copied()).collect();
        self.region = new_region;
        self.sub_bands = self.region.sub_bands.iter().map(|_| SubBandWindow::new()).collect();
        for record in preserved {
            self.record_transmission(record);
        }
    }
}
