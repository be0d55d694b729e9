//! Current value plus a fixed-capacity ring of lagged values.

use cellsim_common::{EvalError, EvalErrorExtra, EvalErrorKind};
use smallvec::SmallVec;

/// `lagged[0]` is the value computed one step before `current`,
/// `lagged[i]` the value from `i + 1` steps before.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueHistory {
    current: f64,
    lagged: SmallVec<[f64; 4]>,
}

impl ValueHistory {
    /// History of depth `max_lag` with every slot set to `initial`.
    pub fn new(initial: f64, max_lag: u32) -> Self {
        Self {
            current: initial,
            lagged: SmallVec::from_elem(initial, max_lag as usize),
        }
    }

    /// History of depth `max_lag` seeded with explicit lagged values
    /// (`lags[0]` is lag 1). Missing slots repeat the oldest given value.
    pub fn with_lags(current: f64, lags: &[f64], max_lag: u32) -> Self {
        let depth = max_lag as usize;
        let mut lagged: SmallVec<[f64; 4]> = lags.iter().copied().take(depth).collect();
        let fill = lagged.last().copied().unwrap_or(current);
        lagged.resize(depth, fill);
        Self { current, lagged }
    }

    /// Declared maximum lag.
    #[inline]
    pub fn depth(&self) -> u32 {
        self.lagged.len() as u32
    }

    #[inline]
    pub fn current(&self) -> f64 {
        self.current
    }

    /// Rotate `current` into the lag ring, dropping the oldest entry, and
    /// store `value` as the new current value.
    pub fn push(&mut self, value: f64) {
        if !self.lagged.is_empty() {
            self.lagged.rotate_right(1);
            self.lagged[0] = self.current;
        }
        self.current = value;
    }

    /// Value `lag` steps back; lag 0 is `current`.
    pub fn read(&self, lag: u32) -> Result<f64, EvalError> {
        match lag {
            0 => Ok(self.current),
            l => self.lagged.get(l as usize - 1).copied().ok_or_else(|| {
                EvalError::new(EvalErrorKind::InvalidLag).with_extra(EvalErrorExtra::Lag {
                    requested: l,
                    available: self.depth(),
                })
            }),
        }
    }

    /// Overwrite the current value without rotating.
    pub fn overwrite(&mut self, value: f64) {
        self.current = value;
    }
}
