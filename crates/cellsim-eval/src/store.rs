//! In-memory `HistoryStore`.

use cellsim_common::Step;
use dashmap::DashMap;

use crate::cell::{CellId, VariableCell};
use crate::traits::HistoryStore;

#[derive(Debug)]
struct Series {
    /// Step of `values[0]`.
    start: Step,
    values: Vec<f64>,
}

/// Keeps one dense series per persisted cell, starting at the first step the
/// cell was recorded. Steps skipped between two records (periodic cells)
/// repeat the previous value, as a per-step save would.
#[derive(Debug, Default)]
pub struct MemoryHistory {
    series: DashMap<CellId, Series>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// First recorded step and number of recorded steps.
    pub fn range(&self, cell: &VariableCell) -> Option<(Step, usize)> {
        self.series
            .get(&cell.id())
            .map(|s| (s.start, s.values.len()))
    }
}

impl HistoryStore for MemoryHistory {
    fn record(&self, cell: &VariableCell, step: Step, value: f64) {
        let mut series = self.series.entry(cell.id()).or_insert_with(|| Series {
            start: step,
            values: Vec::new(),
        });
        if step < series.start {
            return;
        }
        let idx = (step - series.start) as usize;
        if idx < series.values.len() {
            series.values[idx] = value;
            return;
        }
        let fill = series.values.last().copied().unwrap_or(value);
        series.values.resize(idx, fill);
        series.values.push(value);
    }

    fn fetch(&self, cell: &VariableCell, step: Step) -> Option<f64> {
        let series = self.series.get(&cell.id())?;
        let idx = step.checked_sub(series.start)? as usize;
        series.values.get(idx).copied()
    }

    fn forget(&self, cell: &VariableCell) {
        self.series.remove(&cell.id());
    }
}
