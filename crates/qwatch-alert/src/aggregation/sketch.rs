//! Mergeable quantile sketches with bounded relative error.

use sketches_ddsketch::{Config, DDSketch};

/// A mergeable summary of a value distribution.
///
/// Implementations answer quantile queries within a bounded relative error
/// and can be merged, so per-bucket sketches combine into a window-wide one.
pub trait QuantileSketch: Clone + Send {
    fn accept(&mut self, value: f64);

    /// Estimated value at quantile `q` in `[0, 1]`. Returns 0 when empty.
    fn value_at_quantile(&self, q: f64) -> f64;

    fn merge(&mut self, other: &Self);

    fn count(&self) -> u64;

    fn sum(&self) -> f64;

    fn min(&self) -> f64;

    fn max(&self) -> f64;

    fn mean(&self) -> f64 {
        match self.count() {
            0 => 0.0,
            n => self.sum() / n as f64,
        }
    }

    fn is_empty(&self) -> bool {
        self.count() == 0
    }
}

pub const DEFAULT_ALPHA: f64 = 0.01;

const MAX_BINS: u32 = 2048;

/// Values with a magnitude below this are counted as zero.
const MIN_INDEXABLE: f64 = 1e-9;

/// [`QuantileSketch`] over a [`DDSketch`] with relative accuracy `alpha`.
///
/// ```
/// use qwatch_alert::aggregation::sketch::{LogSketch, QuantileSketch};
///
/// let mut sketch = LogSketch::new(0.01);
/// for v in 1..=100 {
///     sketch.accept(v as f64);
/// }
/// let p50 = sketch.value_at_quantile(0.5);
/// assert!((p50 - 50.0).abs() <= 50.0 * 0.03);
/// ```
#[derive(Clone)]
pub struct LogSketch {
    alpha: f64,
    inner: DDSketch,
}

impl LogSketch {
    /// `alpha` is clamped to `(0, 0.5]`.
    pub fn new(alpha: f64) -> Self {
        let alpha = if alpha.is_finite() && alpha > 0.0 {
            alpha.min(0.5)
        } else {
            DEFAULT_ALPHA
        };
        Self {
            alpha,
            inner: DDSketch::new(Config::new(alpha, MAX_BINS, MIN_INDEXABLE)),
        }
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn clear(&mut self) {
        *self = Self::new(self.alpha);
    }
}

impl Default for LogSketch {
    fn default() -> Self {
        Self::new(DEFAULT_ALPHA)
    }
}

impl std::fmt::Debug for LogSketch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogSketch")
            .field("alpha", &self.alpha)
            .field("count", &self.count())
            .field("min", &self.min())
            .field("max", &self.max())
            .finish_non_exhaustive()
    }
}

/// Equal accuracy and equal summary statistics.
impl PartialEq for LogSketch {
    fn eq(&self, other: &Self) -> bool {
        self.alpha.to_bits() == other.alpha.to_bits()
            && self.count() == other.count()
            && self.sum().to_bits() == other.sum().to_bits()
            && self.min().to_bits() == other.min().to_bits()
            && self.max().to_bits() == other.max().to_bits()
    }
}

impl QuantileSketch for LogSketch {
    fn accept(&mut self, value: f64) {
        if value.is_finite() {
            self.inner.add(value);
        }
    }

    fn value_at_quantile(&self, q: f64) -> f64 {
        if self.is_empty() {
            return 0.0;
        }
        if q <= 0.0 {
            return self.min();
        }
        if q >= 1.0 {
            return self.max();
        }
        match self.inner.quantile(q) {
            Ok(Some(v)) => v.clamp(self.min(), self.max()),
            _ => 0.0,
        }
    }

    /// Sketches of different accuracy cannot be combined; such a merge is
    /// skipped.
    fn merge(&mut self, other: &Self) {
        if other.is_empty() {
            return;
        }
        if let Err(e) = self.inner.merge(&other.inner) {
            tracing::warn!(
                alpha = self.alpha,
                other_alpha = other.alpha,
                error = %e,
                "sketch merge skipped"
            );
        }
    }

    fn count(&self) -> u64 {
        self.inner.count() as u64
    }

    fn sum(&self) -> f64 {
        self.inner.sum().unwrap_or(0.0)
    }

    fn min(&self) -> f64 {
        self.inner.min().unwrap_or(0.0)
    }

    fn max(&self) -> f64 {
        self.inner.max().unwrap_or(0.0)
    }
}
