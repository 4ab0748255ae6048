/// Number of consecutive at-or-over-threshold samples required to raise an alarm.
pub const ALARM_EDGE_COUNT: u32 = 10;

/// Consecutive-violation counter with a latched alarm flag.
///
/// The alarm only rises after [`ALARM_EDGE_COUNT`] violations in a row and drops on the
/// first sample that is absent or below threshold, so the flag and the counter always
/// reset together.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HysteresisAlarm {
    consecutive_violations: u32,
    alarmed: bool,
}

impl HysteresisAlarm {
    pub const fn new() -> Self {
        Self {
            consecutive_violations: 0,
            alarmed: false,
        }
    }

    /// Feed one sample. Returns `true` only on the step where the alarm rises.
    pub fn update(&mut self, sample: Option<f64>, threshold: f64) -> bool {
        match sample {
            Some(value) if value >= threshold => {
                self.consecutive_violations = self.consecutive_violations.saturating_add(1);
                if !self.alarmed && self.consecutive_violations >= ALARM_EDGE_COUNT {
                    self.alarmed = true;
                    true
                } else {
                    false
                }
            }
            _ => {
                self.consecutive_violations = 0;
                self.alarmed = false;
                false
            }
        }
    }

    pub fn consecutive_violations(&self) -> u32 {
        self.consecutive_violations
    }

    pub fn alarmed(&self) -> bool {
        self.alarmed
    }
}
