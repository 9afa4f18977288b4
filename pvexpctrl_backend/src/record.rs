//! Reduced measurement output: a `[time | Reference | PC | PL]` matrix.
//!
//! A [`MeasurementRecord`] keeps the matrix as measured next to the working copy. Sign flips,
//! per-channel offsets and time crops only touch the working copy; [`revert`](MeasurementRecord::revert)
//! restores the measured data.

use indexmap::IndexMap;
use ndarray::{s, Array2, ArrayView1, ArrayView2, Axis};
use pvcompiler_backend::InvertedChannels;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Input signals sampled on the card, in acquisition order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InputChannel {
    Reference,
    Pc,
    Pl,
}

impl InputChannel {
    pub const ALL: [InputChannel; 3] = [
        InputChannel::Reference,
        InputChannel::Pc,
        InputChannel::Pl,
    ];

    /// Column of this channel in a [`MeasurementRecord`]; column 0 is time.
    pub fn column(&self) -> usize {
        match self {
            InputChannel::Reference => 1,
            InputChannel::Pc => 2,
            InputChannel::Pl => 3,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            InputChannel::Reference => "Reference",
            InputChannel::Pc => "PC",
            InputChannel::Pl => "PL",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementRecord {
    data: Array2<f64>,
    raw: Array2<f64>,
}

impl MeasurementRecord {
    /// Splits a channel-blocked buffer (all of channel 0, then all of channel 1, ...) into columns
    /// and prepends the time column.
    pub fn from_blocked(
        time: ArrayView1<f64>,
        blocked: ArrayView1<f64>,
        channel_count: usize,
    ) -> Result<Self> {
        if channel_count == 0 || blocked.len() % channel_count != 0 {
            return Err(Error::LayoutMismatch {
                expected: channel_count * (blocked.len() / channel_count.max(1) + 1),
                actual: blocked.len(),
            });
        }
        let rows = blocked.len() / channel_count;
        if time.len() != rows {
            return Err(Error::LayoutMismatch {
                expected: rows,
                actual: time.len(),
            });
        }
        let mut data = Array2::zeros((rows, channel_count + 1));
        data.column_mut(0).assign(&time);
        for chan in 0..channel_count {
            data.column_mut(chan + 1)
                .assign(&blocked.slice(s![chan * rows..(chan + 1) * rows]));
        }
        Ok(Self::from_data(data))
    }

    fn from_data(data: Array2<f64>) -> Self {
        Self {
            raw: data.clone(),
            data,
        }
    }

    pub fn rows(&self) -> usize {
        self.data.nrows()
    }

    pub fn channel_count(&self) -> usize {
        self.data.ncols() - 1
    }

    pub fn time(&self) -> ArrayView1<f64> {
        self.data.column(0)
    }

    pub fn channel(&self, channel: InputChannel) -> ArrayView1<f64> {
        self.data.column(channel.column())
    }

    pub fn data(&self) -> ArrayView2<f64> {
        self.data.view()
    }

    /// The matrix as measured, before any sign flip, offset or crop.
    pub fn raw(&self) -> ArrayView2<f64> {
        self.raw.view()
    }

    pub fn into_inner(self) -> Array2<f64> {
        self.data
    }

    pub fn invert(&mut self, channel: InputChannel) {
        self.data.column_mut(channel.column()).mapv_inplace(|v| -v);
    }

    /// Flips every channel flagged in `inverted`.
    pub fn apply_inversion(&mut self, inverted: &InvertedChannels) {
        for (channel, flag) in [
            (InputChannel::Reference, inverted.reference),
            (InputChannel::Pc, inverted.pc),
            (InputChannel::Pl, inverted.pl),
        ] {
            if flag {
                self.invert(channel);
            }
        }
    }

    /// Adds a constant to one channel.
    pub fn offset(&mut self, channel: InputChannel, offset: f64) {
        self.data.column_mut(channel.column()).mapv_inplace(|v| v + offset);
    }

    /// Drops the rows at or before `start` seconds.
    pub fn crop_start(&mut self, start: f64) {
        self.retain_rows(|t| t > start);
    }

    /// Drops the last `end` seconds, measured from the end of the raw time axis so repeated crops
    /// do not accumulate.
    pub fn crop_end(&mut self, end: f64) {
        let last = match self.raw.nrows() {
            0 => return,
            rows => self.raw[[rows - 1, 0]],
        };
        let cutoff = last - end;
        self.retain_rows(|t| t < cutoff);
    }

    /// Restores the measured data.
    pub fn revert(&mut self) {
        self.data = self.raw.clone();
    }

    fn retain_rows<F: Fn(f64) -> bool>(&mut self, keep: F) {
        let rows: Vec<usize> = self
            .data
            .column(0)
            .iter()
            .enumerate()
            .filter(|(_, t)| keep(**t))
            .map(|(i, _)| i)
            .collect();
        self.data = if rows.is_empty() {
            Array2::zeros((0, self.data.ncols()))
        } else {
            self.data.select(Axis(0), &rows)
        };
    }

    /// Block-averages every `bin_amount` consecutive rows of the working copy. Trailing rows that do
    /// not fill a whole block are dropped. The result is a new record whose raw data is the binned
    /// matrix.
    pub fn binned(&self, bin_amount: usize) -> Self {
        if bin_amount <= 1 {
            return self.clone();
        }
        let bins = self.rows() / bin_amount;
        let mut data = Array2::zeros((bins, self.data.ncols()));
        for (i, mut row) in data.axis_iter_mut(Axis(0)).enumerate() {
            let block = self.data.slice(s![i * bin_amount..(i + 1) * bin_amount, ..]);
            row.assign(&(block.sum_axis(Axis(0)) / bin_amount as f64));
        }
        Self::from_data(data)
    }
}

/// Dark-reading statistics of the PC channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PcCalibration {
    pub mean: f64,
    pub std: f64,
}

impl PcCalibration {
    /// `None` for an empty record.
    pub fn from_record(record: &MeasurementRecord) -> Option<Self> {
        let pc = record.channel(InputChannel::Pc);
        let mean = pc.mean()?;
        Some(Self {
            mean,
            std: pc.std(0.),
        })
    }

    pub fn as_dict(&self) -> IndexMap<String, Value> {
        let mut dict = IndexMap::new();
        dict.insert("pc_calibration_mean".to_string(), Value::from(self.mean));
        dict.insert("pc_calibration_std".to_string(), Value::from(self.std));
        dict
    }
}
