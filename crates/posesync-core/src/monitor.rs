//! Session health metrics and degraded-mode decisions

use crate::coordinator::CorrectionOutcome;
use crate::types::ConnectionId;
use crate::validator::{ConnectionState, ConnectionStatus};
use chrono::{DateTime, Duration, Utc};
use posesync_config::MonitorConfig;
use posesync_spatial::ParticipantId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use tokio::sync::broadcast;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DegradedReason {
    DriftRate {
        participant: ParticipantId,
        rate_mps: f64,
    },
    SyncLatency {
        mean_ms: f64,
    },
    CorrectionRate {
        hz: f64,
    },
    SustainedViolation {
        connections: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SessionMode {
    Nominal,
    /// Looser tolerances and less frequent validation
    Degraded { reasons: Vec<DegradedReason> },
}

impl SessionMode {
    pub fn is_degraded(&self) -> bool {
        matches!(self, SessionMode::Degraded { .. })
    }
}

/// Escalations for the surrounding application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum SessionSignal {
    /// A connection has stayed Violated longer than the configured threshold
    SustainedViolation {
        connection_id: ConnectionId,
        since: DateTime<Utc>,
        duration_ms: i64,
    },
    ModeChanged { mode: SessionMode },
}

/// Pull-based health report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub tick: u64,
    pub at: DateTime<Utc>,
    pub mode: SessionMode,
    pub drift_rates: BTreeMap<ParticipantId, f64>,
    pub correction_frequency_hz: f64,
    pub corrections_applied: u64,
    pub corrections_superseded: u64,
    pub mean_sync_latency_ms: f64,
    pub satisfied: usize,
    pub degraded: usize,
    pub violated: usize,
    pub inert: usize,
    /// Connections that entered Violated, over the session
    pub violation_events: u64,
    pub sustained_violations: Vec<ConnectionId>,
    pub ownership_churn: BTreeMap<ParticipantId, u64>,
    pub untrusted_participants: Vec<ParticipantId>,
}

impl MetricsSnapshot {
    pub fn empty(at: DateTime<Utc>) -> Self {
        Self {
            tick: 0,
            at,
            mode: SessionMode::Nominal,
            drift_rates: BTreeMap::new(),
            correction_frequency_hz: 0.0,
            corrections_applied: 0,
            corrections_superseded: 0,
            mean_sync_latency_ms: 0.0,
            satisfied: 0,
            degraded: 0,
            violated: 0,
            inert: 0,
            violation_events: 0,
            sustained_violations: Vec::new(),
            ownership_churn: BTreeMap::new(),
            untrusted_participants: Vec::new(),
        }
    }
}

/// Inputs gathered by the session for one monitoring pass.
#[derive(Debug, Clone, Default)]
pub struct Observation<'a> {
    pub states: &'a [ConnectionState],
    pub drift_rates: HashMap<ParticipantId, f64>,
    pub ownership_churn: HashMap<ParticipantId, u64>,
    pub untrusted: Vec<ParticipantId>,
}

#[derive(Debug)]
pub struct SessionMonitor {
    config: MonitorConfig,
    tick: u64,
    mode: SessionMode,
    corrections: VecDeque<DateTime<Utc>>,
    corrections_applied: u64,
    corrections_superseded: u64,
    latencies: VecDeque<(DateTime<Utc>, f64)>,
    violation_events: u64,
    reported_sustained: HashSet<ConnectionId>,
    signals: broadcast::Sender<SessionSignal>,
}

impl SessionMonitor {
    pub fn new(config: MonitorConfig, broadcast_capacity: usize) -> Self {
        let (signals, _) = broadcast::channel(broadcast_capacity.max(1));
        Self {
            config,
            tick: 0,
            mode: SessionMode::Nominal,
            corrections: VecDeque::new(),
            corrections_applied: 0,
            corrections_superseded: 0,
            latencies: VecDeque::new(),
            violation_events: 0,
            reported_sustained: HashSet::new(),
            signals,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionSignal> {
        self.signals.subscribe()
    }

    pub fn signal_sender(&self) -> broadcast::Sender<SessionSignal> {
        self.signals.clone()
    }

    pub fn mode(&self) -> &SessionMode {
        &self.mode
    }

    /// Multiplier applied to every connection tolerance in the current mode.
    pub fn tolerance_scale(&self) -> f64 {
        if self.mode.is_degraded() {
            self.config.degraded_tolerance_multiplier
        } else {
            1.0
        }
    }

    pub fn record_correction(&mut self, outcome: CorrectionOutcome, now: DateTime<Utc>) {
        match outcome {
            CorrectionOutcome::Applied { .. } => {
                self.corrections_applied += 1;
                self.corrections.push_back(now);
            }
            CorrectionOutcome::Superseded => self.corrections_superseded += 1,
        }
    }

    /// Record how long one update waited between submission and processing.
    pub fn record_latency(&mut self, latency_ms: f64, now: DateTime<Utc>) {
        if latency_ms.is_finite() && latency_ms >= 0.0 {
            self.latencies.push_back((now, latency_ms));
        }
    }

    /// Fold one tick's results into the metrics and re-decide the session mode.
    pub fn observe(&mut self, now: DateTime<Utc>, observation: Observation<'_>) -> MetricsSnapshot {
        self.tick += 1;
        self.prune(now);

        let window_secs = self.config.metrics_window_ms as f64 / 1000.0;
        let correction_frequency_hz = self.corrections.len() as f64 / window_secs;
        let mean_sync_latency_ms = if self.latencies.is_empty() {
            0.0
        } else {
            self.latencies.iter().map(|(_, ms)| ms).sum::<f64>() / self.latencies.len() as f64
        };

        let mut counts = [0usize; 4];
        let mut sustained = Vec::new();
        let threshold = Duration::milliseconds(self.config.sustained_violation_ms as i64);
        let mut still_violated = HashSet::new();
        for state in observation.states {
            let slot = match state.status {
                ConnectionStatus::Satisfied => 0,
                ConnectionStatus::Degraded => 1,
                ConnectionStatus::Violated => 2,
                ConnectionStatus::Inert => 3,
            };
            counts[slot] += 1;
            let Some(since) = state.violated_since else {
                continue;
            };
            if since == now {
                self.violation_events += 1;
            }
            still_violated.insert(state.connection_id.clone());
            if now - since >= threshold {
                sustained.push(state.connection_id.clone());
                if self.reported_sustained.insert(state.connection_id.clone()) {
                    let duration_ms = (now - since).num_milliseconds();
                    warn!(
                        "Connection {} violated for {} ms",
                        state.connection_id, duration_ms
                    );
                    self.emit(SessionSignal::SustainedViolation {
                        connection_id: state.connection_id.clone(),
                        since,
                        duration_ms,
                    });
                }
            }
        }
        self.reported_sustained
            .retain(|id| still_violated.contains(id));

        let drift_rates: BTreeMap<ParticipantId, f64> = observation.drift_rates.into_iter().collect();
        self.decide_mode(&drift_rates, mean_sync_latency_ms, correction_frequency_hz, sustained.len());

        let mut untrusted = observation.untrusted;
        untrusted.sort();
        MetricsSnapshot {
            tick: self.tick,
            at: now,
            mode: self.mode.clone(),
            drift_rates,
            correction_frequency_hz,
            corrections_applied: self.corrections_applied,
            corrections_superseded: self.corrections_superseded,
            mean_sync_latency_ms,
            satisfied: counts[0],
            degraded: counts[1],
            violated: counts[2],
            inert: counts[3],
            violation_events: self.violation_events,
            sustained_violations: sustained,
            ownership_churn: observation.ownership_churn.into_iter().collect(),
            untrusted_participants: untrusted,
        }
    }

    fn decide_mode(
        &mut self,
        drift_rates: &BTreeMap<ParticipantId, f64>,
        mean_latency_ms: f64,
        correction_hz: f64,
        sustained: usize,
    ) {
        // Entering uses the thresholds as-is; leaving needs clear headroom
        let ratio = if self.mode.is_degraded() {
            self.config.recovery_ratio
        } else {
            1.0
        };
        let mut reasons = Vec::new();
        for (participant, rate) in drift_rates {
            if *rate > self.config.max_drift_rate_mps * ratio {
                reasons.push(DegradedReason::DriftRate {
                    participant: participant.clone(),
                    rate_mps: *rate,
                });
            }
        }
        if mean_latency_ms > self.config.max_sync_latency_ms * ratio {
            reasons.push(DegradedReason::SyncLatency {
                mean_ms: mean_latency_ms,
            });
        }
        if correction_hz > self.config.max_correction_rate_hz * ratio {
            reasons.push(DegradedReason::CorrectionRate { hz: correction_hz });
        }
        if sustained > 0 {
            reasons.push(DegradedReason::SustainedViolation {
                connections: sustained,
            });
        }

        let next = if reasons.is_empty() {
            SessionMode::Nominal
        } else {
            SessionMode::Degraded { reasons }
        };
        let changed = next.is_degraded() != self.mode.is_degraded();
        self.mode = next;
        if changed {
            if self.mode.is_degraded() {
                warn!("Session entering degraded mode: {:?}", self.mode);
            } else {
                info!("Session back to nominal mode");
            }
            self.emit(SessionSignal::ModeChanged {
                mode: self.mode.clone(),
            });
        }
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = now - Duration::milliseconds(self.config.metrics_window_ms as i64);
        while self.corrections.front().is_some_and(|t| *t < cutoff) {
            self.corrections.pop_front();
        }
        while self.latencies.front().is_some_and(|(t, _)| *t < cutoff) {
            self.latencies.pop_front();
        }
    }

    fn emit(&self, signal: SessionSignal) {
        // Nobody listening is fine
        let _ = self.signals.send(signal);
    }
}
