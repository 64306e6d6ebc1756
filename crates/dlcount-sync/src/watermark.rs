//! Per-source watermarks and incremental fetch windows.
//!
//! A watermark is the last date (inclusive) already folded into a source's
//! archive. The next window starts the day after it and ends at the settle
//! horizon `today - lag`. Watermarks only move forward.

use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{Days, NaiveDate};
use dlcount_core::{DateWindow, InvariantViolation, SourceId, Watermark};
use dlcount_storage::{encode_watermarks, read_watermarks, WatermarkFile};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowState {
    /// There is at least one settled day to fetch.
    Open(DateWindow),
    /// Everything up to the horizon is archived already.
    Empty { watermark: NaiveDate },
}

impl WindowState {
    pub fn window(&self) -> Option<DateWindow> {
        match self {
            WindowState::Open(window) => Some(*window),
            WindowState::Empty { .. } => None,
        }
    }
}

/// Last settled day for a run on `today` with `lag_days` of safety margin.
pub fn settle_horizon(today: NaiveDate, lag_days: u32) -> NaiveDate {
    today
        .checked_sub_days(Days::new(u64::from(lag_days)))
        .unwrap_or(NaiveDate::MIN)
}

/// Window following `watermark` up to `horizon`.
pub fn window_after(
    source_id: SourceId,
    watermark: NaiveDate,
    horizon: NaiveDate,
) -> Result<WindowState, InvariantViolation> {
    if watermark == horizon {
        return Ok(WindowState::Empty { watermark });
    }
    if watermark > horizon {
        return Err(InvariantViolation::InvertedWindow {
            source_id,
            watermark,
            horizon,
        });
    }
    // watermark < horizon, so the successor exists and is <= horizon.
    let start = watermark.succ_opt().unwrap_or(horizon);
    Ok(WindowState::Open(DateWindow {
        start,
        end: horizon,
    }))
}

#[derive(Debug, Clone)]
pub struct WatermarkStore {
    path: PathBuf,
    marks: WatermarkFile,
}

impl WatermarkStore {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let marks = read_watermarks(&path)?;
        Ok(Self { path, marks })
    }

    pub fn from_marks(path: impl Into<PathBuf>, marks: WatermarkFile) -> Self {
        Self {
            path: path.into(),
            marks,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn watermark(&self, source_id: SourceId) -> Result<Watermark, InvariantViolation> {
        self.marks
            .get(&source_id)
            .copied()
            .ok_or(InvariantViolation::MissingWatermark { source_id })
    }

    pub fn next_window(
        &self,
        source_id: SourceId,
        today: NaiveDate,
        lag_days: u32,
    ) -> Result<WindowState, InvariantViolation> {
        let watermark = self.watermark(source_id)?;
        window_after(source_id, watermark.end_date, settle_horizon(today, lag_days))
    }

    /// Moves the in-memory watermark to `end_date`. Persisting is the caller's job.
    pub fn advance(
        &mut self,
        source_id: SourceId,
        end_date: NaiveDate,
    ) -> Result<(), InvariantViolation> {
        if let Some(current) = self.marks.get(&source_id) {
            if end_date < current.end_date {
                return Err(InvariantViolation::WatermarkRegression {
                    source_id,
                    current: current.end_date,
                    proposed: end_date,
                });
            }
        }
        self.marks.insert(source_id, Watermark { end_date });
        Ok(())
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        encode_watermarks(&self.marks)
    }
}
