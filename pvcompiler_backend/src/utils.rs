// The "utils" module collects the small numeric helpers shared by synthesis and acquisition
use std::time::Instant;

use ndarray::Array1;

/// `num` evenly spaced values over `[start, stop]`, both ends included.
///
/// The last element is written as `stop` exactly, so grids built for different buffers that share
/// a span always agree on their final value. `num == 1` yields `[start]` and `num == 0` an empty
/// array.
pub fn linspace(start: f64, stop: f64, num: usize) -> Array1<f64> {
    match num {
        0 => Array1::zeros(0),
        1 => Array1::from_elem(1, start),
        _ => {
            let step = (stop - start) / (num - 1) as f64;
            let mut arr = Array1::from_shape_fn(num, |i| start + i as f64 * step);
            arr[num - 1] = stop;
            arr
        }
    }
}

/// Values `start, start + step, ...` strictly below `stop`.
pub fn arange(start: f64, stop: f64, step: f64) -> Array1<f64> {
    if !(step > 0.) || !(stop > start) {
        return Array1::zeros(0);
    }
    let num = ((stop - start) / step).ceil() as usize;
    Array1::from_shape_fn(num, |i| start + i as f64 * step)
}

/// `num` values spaced evenly on a log10 scale between `10^start` and `10^stop`.
pub fn logspace(start: f64, stop: f64, num: usize) -> Array1<f64> {
    linspace(start, stop, num).mapv(|exp| 10f64.powf(exp))
}

/// Number of samples spanning `duration` seconds at `rate` Hz, rounded to the nearest sample.
pub fn round_samples(rate: f64, duration: f64) -> usize {
    (rate * duration).round().max(0.) as usize
}

/// Number of whole samples that fit into `duration` seconds at `rate` Hz.
///
/// Products such as `1.011 * 1200` land a hair below the integer they represent; the epsilon keeps
/// those from losing a sample to truncation.
pub fn floor_samples(rate: f64, duration: f64) -> usize {
    (rate * duration + 1e-9).floor().max(0.) as usize
}

// Utility class for time-tracking
pub struct TickTimer {
    last: Instant,
}

impl Default for TickTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl TickTimer {
    pub fn new() -> Self {
        Self {
            last: Instant::now(),
        }
    }

    /// Milliseconds since construction or the previous tick.
    pub fn tick(&mut self) -> f64 {
        let now = Instant::now();
        let diff = now.duration_since(self.last).as_secs_f64() * 1e3;
        self.last = now;
        diff
    }

    pub fn tick_print(&mut self, msg: &str) -> f64 {
        let diff = self.tick();
        log::debug!("{}: {:.3} ms", msg, diff);
        diff
    }
}
