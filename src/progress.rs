/// Structured progress events, cooperative cancellation, and the ETA
/// heuristics shared by the long-running operations.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SpcdbError};

/// Lightweight cancellation token.
///
/// You can pass an explicit token (and call `cancel()`), or provide a check
/// callback that returns true when cancellation is requested. All long loops
/// call `raise_if_cancelled` at well-defined yield points.
#[derive(Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
    check: Option<Arc<dyn Fn() -> bool + Send + Sync>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_check(check: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            check: Some(Arc::new(check)),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn cancelled(&self) -> bool {
        if self.cancelled.load(Ordering::SeqCst) {
            return true;
        }
        match &self.check {
            Some(f) => f(),
            None => false,
        }
    }

    pub fn raise_if_cancelled(&self) -> Result<()> {
        if self.cancelled() {
            return Err(SpcdbError::Cancelled("Cancelled".to_string()));
        }
        Ok(())
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken").field("cancelled", &self.cancelled.load(Ordering::SeqCst)).finish()
    }
}

/// One structured progress message from a long operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub phase: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    #[serde(default)]
    pub indeterminate: bool,
}

impl ProgressEvent {
    pub fn indeterminate(phase: &str, message: impl Into<String>) -> Self {
        Self {
            phase: phase.to_string(),
            message: message.into(),
            current: None,
            total: None,
            indeterminate: true,
        }
    }

    pub fn counted(phase: &str, message: impl Into<String>, current: u64, total: u64) -> Self {
        Self {
            phase: phase.to_string(),
            message: message.into(),
            current: Some(current),
            total: Some(total),
            indeterminate: false,
        }
    }
}

/// Map fine-grained build phases into the user-visible buckets.
pub fn map_build_phase_group(raw_phase: &str) -> String {
    let p = raw_phase.trim().to_lowercase();
    match p.as_str() {
        "copy" | "prune" => "Copy".to_string(),
        "finalize" | "done" => "Finalize".to_string(),
        "import" | "copy songs" | "textures" | "write" | "melody" | "chc" | "config" => "Merge".to_string(),
        "preflight" | "resolve" | "plan" => "Preflight".to_string(),
        _ => raw_phase.to_string(),
    }
}

const PHASE_DURATION_ALPHA: f64 = 0.30;
const SECONDS_PER_UNIT_ALPHA: f64 = 0.25;
const MIN_SAMPLE_INTERVAL_SEC: f64 = 0.2;

/// ETA heuristics: an exponentially-weighted moving average of phase
/// durations (for indeterminate phases) and of seconds-per-unit (for
/// determinate ones). Timestamps are monotonic seconds supplied by the
/// caller so the math is deterministic under test.
#[derive(Debug, Default)]
pub struct EtaEstimator {
    phase: Option<String>,
    total: Option<u64>,
    current: Option<u64>,
    last_ts: Option<f64>,
    last_current: Option<u64>,
    spu_ema: Option<f64>,
    phase_start_ts: Option<f64>,
    indeterminate: bool,
    hist_current_key: Option<String>,
    hist_phase_start_ts: Option<f64>,
    phase_ema_sec: HashMap<String, f64>,
}

fn full_key(op: &str, phase: &str) -> String {
    format!("{}:{}", op.trim().to_lowercase(), phase.trim().to_lowercase())
}

impl EtaEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update the EMA duration for a phase key.
    pub fn record_phase_sample(&mut self, key: &str, duration_sec: f64) {
        if key.is_empty() || !duration_sec.is_finite() || duration_sec < 0.0 {
            return;
        }
        let ema = match self.phase_ema_sec.get(key) {
            Some(prev) => PHASE_DURATION_ALPHA * duration_sec + (1.0 - PHASE_DURATION_ALPHA) * prev,
            None => duration_sec,
        };
        self.phase_ema_sec.insert(key.to_string(), ema);
    }

    pub fn phase_ema(&self, op: &str, phase: &str) -> Option<f64> {
        self.phase_ema_sec.get(&full_key(op, phase)).copied()
    }

    /// Track phase boundaries and record phase duration samples.
    pub fn track_phase(&mut self, op: &str, phase: &str, now: f64) {
        let key = full_key(op, phase);
        if self.hist_current_key.as_deref() == Some(key.as_str()) {
            return;
        }
        if let (Some(cur_key), Some(start)) = (self.hist_current_key.take(), self.hist_phase_start_ts.take()) {
            self.record_phase_sample(&cur_key, (now - start).max(0.0));
        }
        self.hist_current_key = Some(key);
        self.hist_phase_start_ts = Some(now);
    }

    /// Finalize in-flight phase timing when an operation ends.
    pub fn finalize(&mut self, now: f64) {
        if let (Some(cur_key), Some(start)) = (self.hist_current_key.take(), self.hist_phase_start_ts.take()) {
            self.record_phase_sample(&cur_key, (now - start).max(0.0));
        }
        self.phase = None;
        self.total = None;
        self.current = None;
        self.last_ts = None;
        self.last_current = None;
        self.spu_ema = None;
        self.phase_start_ts = None;
        self.indeterminate = true;
    }

    /// Feed a progress sample into the seconds-per-unit estimator.
    pub fn update(&mut self, phase: &str, current: Option<u64>, total: Option<u64>, indeterminate: bool, now: f64) {
        let (cur, tot) = match (current, total) {
            (Some(c), Some(t)) if !indeterminate && t > 0 => (c, t),
            _ => {
                self.indeterminate = true;
                self.current = None;
                self.total = None;
                if self.phase.as_deref() != Some(phase) || self.phase_start_ts.is_none() {
                    self.phase_start_ts = Some(now);
                }
                self.phase = Some(phase.to_string());
                self.last_ts = None;
                self.last_current = None;
                self.spu_ema = None;
                return;
            }
        };

        let needs_reset = self.phase.as_deref() != Some(phase)
            || self.total.map(|t| t != tot).unwrap_or(false)
            || self.current.map(|c| cur < c).unwrap_or(false);

        if needs_reset {
            self.phase = Some(phase.to_string());
            self.total = Some(tot);
            self.current = Some(cur);
            self.phase_start_ts = Some(now);
            self.last_ts = Some(now);
            self.last_current = Some(cur);
            self.spu_ema = None;
            self.indeterminate = false;
            return;
        }

        if let (Some(last_ts), Some(last_cur)) = (self.last_ts, self.last_current) {
            let dt = (now - last_ts).max(0.0);
            if dt >= MIN_SAMPLE_INTERVAL_SEC && cur > last_cur {
                let sample_spu = dt / (cur - last_cur) as f64;
                self.spu_ema = Some(match self.spu_ema {
                    Some(prev) => SECONDS_PER_UNIT_ALPHA * sample_spu + (1.0 - SECONDS_PER_UNIT_ALPHA) * prev,
                    None => sample_spu,
                });
            }
        }

        self.indeterminate = false;
        self.total = Some(tot);
        self.current = Some(cur);
        self.last_ts = Some(now);
        self.last_current = Some(cur);
    }

    /// Estimated seconds remaining, if the heuristics have enough data.
    pub fn remaining_secs(&self, op: &str, now: f64) -> Option<f64> {
        if !self.indeterminate {
            let (cur, tot) = (self.current?, self.total?);
            if cur >= tot {
                return Some(0.0);
            }
            let spu = self.spu_ema?;
            return Some((tot - cur) as f64 * spu);
        }
        let phase = self.phase.as_deref()?;
        let expected = self.phase_ema_sec.get(&full_key(op, phase)).copied()?;
        let start = self.phase_start_ts?;
        Some((expected - (now - start)).max(0.0))
    }
}
