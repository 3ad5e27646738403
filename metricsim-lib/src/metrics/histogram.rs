use hdrhistogram::{AdditionError, CreationError, Histogram, RecordError};

/// Histogram over signed values.
///
/// `hdrhistogram` only tracks unsigned values, so negative samples are
/// kept by magnitude in a histogram of their own. Quantiles walk the
/// negative side from the largest magnitude down before continuing
/// with the non-negative side.
#[derive(Debug, Clone)]
pub(super) struct SignedHistogram {
    negative: Histogram<u64>,
    positive: Histogram<u64>,
}

impl SignedHistogram {
    /// 3 significant figures, auto-resizing.
    pub(super) fn try_new() -> Result<Self, CreationError> {
        let positive = Histogram::new(3)?;
        Ok(Self {
            negative: Histogram::new_from(&positive),
            positive,
        })
    }

    /// Empty histogram with the same settings as `template`.
    pub(super) fn new_from(template: &Self) -> Self {
        Self {
            negative: Histogram::new_from(&template.negative),
            positive: Histogram::new_from(&template.positive),
        }
    }

    pub(super) fn record(&mut self, value: i64) -> Result<(), RecordError> {
        if value < 0 {
            self.negative.record(value.unsigned_abs())
        } else {
            self.positive.record(value as u64)
        }
    }

    pub(super) fn add(&mut self, other: &Self) -> Result<(), AdditionError> {
        self.negative.add(&other.negative)?;
        self.positive.add(&other.positive)
    }

    pub(super) fn len(&self) -> u64 {
        self.negative.len() + self.positive.len()
    }

    /// Smallest recorded value (at histogram precision) such that at least
    /// `quantile` of all samples are at or below it, `None` when empty.
    pub(super) fn value_at_quantile(&self, quantile: f64) -> Option<i64> {
        let total = self.len();
        if total == 0 {
            return None;
        }
        let rank = ((quantile.clamp(0., 1.) * total as f64).ceil() as u64).clamp(1, total);

        let negatives = self.negative.len();
        if rank <= negatives {
            // the rank-th smallest value has the (negatives - rank + 1)-th smallest magnitude
            let magnitude = value_at_rank(&self.negative, negatives - rank + 1);
            Some(0_i64.saturating_sub_unsigned(magnitude))
        } else {
            let value = value_at_rank(&self.positive, rank - negatives);
            Some(i64::try_from(value).unwrap_or(i64::MAX))
        }
    }
}

fn value_at_rank(histogram: &Histogram<u64>, rank: u64) -> u64 {
    let mut seen = 0;
    for step in histogram.iter_recorded() {
        seen += step.count_at_value();
        if seen >= rank {
            return step.value_iterated_to();
        }
    }
    histogram.max()
}
