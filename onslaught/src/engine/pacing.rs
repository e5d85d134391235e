use core::time::Duration;

use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::cfg::PacingWindow;

/// Picks the delay before each next request, uniformly from a window.
#[derive(Debug)]
pub struct Pacer {
    window: PacingWindow,
    rng: StdRng,
}

impl Pacer {
    pub fn new(window: PacingWindow) -> Self {
        Self { window, rng: StdRng::from_entropy() }
    }

    #[inline]
    pub fn next_delay(&mut self) -> Duration {
        if self.window.is_zero() {
            return Duration::ZERO;
        }

        let PacingWindow { min, max } = self.window;
        if max <= min {
            return min;
        }

        let us = self.rng.gen_range(min.as_micros() as u64..=max.as_micros() as u64);
        Duration::from_micros(us)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn delay_within_window() {
        let window = PacingWindow::from_millis(100, 500);
        let mut pacer = Pacer::new(window);

        for _ in 0..1000 {
            let delay = pacer.next_delay();
            assert!(delay >= window.min && delay <= window.max, "{delay:?}");
        }
    }

    #[test]
    fn fixed_delay() {
        let mut pacer = Pacer::new(PacingWindow::from_millis(42, 42));

        assert_eq!(Duration::from_millis(42), pacer.next_delay());
    }

    #[test]
    fn zero_window() {
        let mut pacer = Pacer::new(PacingWindow::from_millis(0, 0));

        assert!(pacer.next_delay().is_zero());
    }
}
