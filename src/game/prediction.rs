//! Per-participant latency estimates used for rewind and fast-forward

use std::collections::HashMap;

use uuid::Uuid;

use crate::config::EngineConfig;
use crate::util::time::TimeMs;

/// Weight of a new round-trip sample in the smoothed estimate
const RTT_SMOOTHING: f32 = 0.25;

/// Latency estimate for one remote participant
#[derive(Debug, Clone, PartialEq)]
pub struct PredictionContext {
    /// Smoothed round trip in milliseconds (None until the first sample)
    round_trip_estimate_ms: Option<f32>,
    /// Latency absorbed by interpolation on the controlling side
    pub fudge_factor_ms: TimeMs,
    /// Most latency we are willing to rewind or fast-forward over
    pub max_prediction_ms: TimeMs,
}

impl PredictionContext {
    pub fn new(fudge_factor_ms: TimeMs, max_prediction_ms: TimeMs) -> Self {
        Self {
            round_trip_estimate_ms: None,
            fudge_factor_ms,
            max_prediction_ms,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.prediction_fudge_ms, config.max_prediction_ping_ms)
    }

    /// Fold a measured round trip into the estimate
    pub fn record_round_trip(&mut self, sample_ms: TimeMs) {
        let sample = sample_ms as f32;
        self.round_trip_estimate_ms = Some(match self.round_trip_estimate_ms {
            Some(current) => current + (sample - current) * RTT_SMOOTHING,
            None => sample,
        });
    }

    /// Overwrite the estimate, e.g. from a transport-level measurement
    pub fn set_round_trip(&mut self, rtt_ms: TimeMs) {
        self.round_trip_estimate_ms = Some(rtt_ms as f32);
    }

    pub fn round_trip_estimate_ms(&self) -> TimeMs {
        self.round_trip_estimate_ms.map(|rtt| rtt.round() as TimeMs).unwrap_or(0)
    }

    /// Latency to rewind targets by / fast-forward projectiles by
    pub fn prediction_time_ms(&self) -> TimeMs {
        self.round_trip_estimate_ms()
            .saturating_sub(self.fudge_factor_ms)
            .min(self.max_prediction_ms)
    }

    /// Latency beyond what prediction covers; projectile spawns wait this long
    pub fn sleep_time_ms(&self) -> TimeMs {
        self.round_trip_estimate_ms()
            .saturating_sub(self.fudge_factor_ms)
            .saturating_sub(self.max_prediction_ms)
    }

    /// Upper bound on how stale a locally predicted projectile may become
    pub fn sleep_time_bound_ms(&self) -> TimeMs {
        self.max_prediction_ms + self.fudge_factor_ms
    }
}

/// Prediction contexts keyed by participant
#[derive(Debug, Clone)]
pub struct PredictionRegistry {
    contexts: HashMap<Uuid, PredictionContext>,
    template: PredictionContext,
}

impl PredictionRegistry {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            contexts: HashMap::new(),
            template: PredictionContext::from_config(config),
        }
    }

    /// Context for a participant, created on first use
    pub fn context_mut(&mut self, participant: Uuid) -> &mut PredictionContext {
        let template = &self.template;
        self.contexts
            .entry(participant)
            .or_insert_with(|| template.clone())
    }

    /// Context for a participant without creating one
    pub fn get(&self, participant: &Uuid) -> Option<&PredictionContext> {
        self.contexts.get(participant)
    }

    pub fn prediction_time_ms(&self, participant: &Uuid) -> TimeMs {
        self.get(participant)
            .map(PredictionContext::prediction_time_ms)
            .unwrap_or(0)
    }

    pub fn remove(&mut self, participant: &Uuid) {
        self.contexts.remove(participant);
    }
}
