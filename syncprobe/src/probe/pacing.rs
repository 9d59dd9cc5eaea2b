use rand::Rng;
use std::time::Duration;

/// Randomised pause between iterations, a whole number of seconds in `[0, range)`.
#[derive(Debug, Clone, Copy)]
pub struct Pacing {
    range_secs: u64,
}

impl Pacing {
    pub fn new(range_secs: u64) -> Self {
        Self { range_secs }
    }

    pub fn none() -> Self {
        Self::new(0)
    }

    pub fn range_secs(&self) -> u64 {
        self.range_secs
    }

    pub fn pause_with_rng<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        if self.range_secs == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs(rng.gen_range(0..self.range_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn pauses_stay_below_range() {
        let pacing = Pacing::new(15);
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..500 {
            assert!(pacing.pause_with_rng(&mut rng) < Duration::from_secs(15));
        }
    }

    #[test]
    fn pauses_are_whole_seconds_and_vary() {
        let pacing = Pacing::new(15);
        let mut rng = StdRng::seed_from_u64(42);
        let pauses: Vec<_> = (0..50).map(|_| pacing.pause_with_rng(&mut rng)).collect();
        assert!(pauses.iter().all(|pause| pause.subsec_nanos() == 0));
        assert!(pauses.iter().any(|pause| *pause != pauses[0]));
    }

    #[test]
    fn zero_range_never_pauses() {
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(Pacing::none().pause_with_rng(&mut rng), Duration::ZERO);
    }
}
