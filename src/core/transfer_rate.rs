use std::{
    cmp::Ordering,
    collections::VecDeque,
    fmt::Display,
    ops::{Add, AddAssign},
    time::Duration,
};

use size::Size;

#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub struct TransferRate(pub Size, pub Duration);

impl Display for TransferRate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let size_per_second = Size::from_bytes(self.bytes_per_second());
        write!(f, "{}/s", size_per_second)
    }
}

impl TransferRate {
    pub const EMPTY: Self = Self(Size::from_const(0), Duration::ZERO);

    pub fn bytes_per_second(&self) -> f64 {
        let seconds = self.1.as_secs_f64();
        if seconds == 0.0 {
            return 0.0;
        }
        (self.0.bytes() as f64) / seconds
    }
}

impl Add for TransferRate {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        let mut sum = self;
        sum += rhs;
        sum
    }
}

impl AddAssign for TransferRate {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
        self.1 += rhs.1;
    }
}

impl PartialOrd for TransferRate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TransferRate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.bytes_per_second()
            .total_cmp(&other.bytes_per_second())
    }
}

/// Transfer rate averaged over the last `window` samples.
#[derive(Debug, Clone)]
pub struct RollingRate {
    window: usize,
    samples: VecDeque<TransferRate>,
}

impl RollingRate {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            samples: VecDeque::with_capacity(window),
        }
    }

    pub fn record(&mut self, sample: TransferRate) {
        if self.samples.len() == self.window {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn rate(&self) -> TransferRate {
        self.samples
            .iter()
            .fold(TransferRate::EMPTY, |total, sample| total + *sample)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEC: Duration = Duration::from_secs(1);

    #[test]
    fn add() {
        let a = TransferRate(Size::from_kibibytes(10), SEC);
        let b = TransferRate(Size::from_kibibytes(20), SEC);

        assert_eq!(
            a + b,
            TransferRate(Size::from_kibibytes(30), Duration::from_secs(2))
        );
    }

    #[test]
    fn ordering() {
        let rate_10_kbps = TransferRate(Size::from_kibibytes(10), SEC);
        let rate_20_kbps = TransferRate(Size::from_kibibytes(20), SEC);
        let rate_30_kbps = TransferRate(Size::from_kibibytes(30), SEC);
        let mut rates = vec![&rate_10_kbps, &rate_30_kbps, &rate_20_kbps];
        rates.sort();

        assert_eq!(rates, vec![&rate_10_kbps, &rate_20_kbps, &rate_30_kbps]);
    }

    #[test]
    fn empty_rate_is_zero() {
        assert_eq!(TransferRate::EMPTY.bytes_per_second(), 0.0);
        assert!(TransferRate::EMPTY < TransferRate(Size::from_bytes(1), SEC));
    }

    #[test]
    fn rolling_window_drops_old_samples() {
        let mut rate = RollingRate::new(2);
        rate.record(TransferRate(Size::from_bytes(100), SEC));
        rate.record(TransferRate(Size::from_bytes(10), SEC));
        rate.record(TransferRate(Size::from_bytes(30), SEC));

        assert_eq!(rate.rate().bytes_per_second(), 20.0);
    }
}
