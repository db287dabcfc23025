//! Frame pacing for drivers without their own clock

use std::time::{Duration, Instant};

/// Sleeps until the next frame slot at a fixed rate.
///
/// When the caller falls more than one interval behind, the schedule is
/// restarted from now instead of bursting to catch up.
#[derive(Debug)]
pub struct FramePacer {
    interval: Duration,
    next: Option<Instant>,
}

impl FramePacer {
    pub fn new(fps: u32) -> Self {
        Self {
            interval: Duration::from_secs(1) / fps.max(1),
            next: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Block until the next slot; the first call returns immediately
    pub fn wait(&mut self) {
        let now = Instant::now();
        let Some(next) = self.next else {
            self.next = Some(now + self.interval);
            return;
        };

        if next > now {
            std::thread::sleep(next - now);
            self.next = Some(next + self.interval);
        } else if now - next > self.interval {
            self.next = Some(now + self.interval);
        } else {
            self.next = Some(next + self.interval);
        }
    }

    pub fn reset(&mut self) {
        self.next = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_from_fps() {
        assert_eq!(FramePacer::new(25).interval(), Duration::from_millis(40));
        // zero fps is clamped rather than dividing by zero
        assert_eq!(FramePacer::new(0).interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_paces_to_rate() {
        let mut pacer = FramePacer::new(50);
        let start = Instant::now();
        for _ in 0..6 {
            pacer.wait();
        }
        // five full intervals after the immediate first slot
        assert!(start.elapsed() >= Duration::from_millis(95));
    }

    #[test]
    fn test_resyncs_after_stall() {
        let mut pacer = FramePacer::new(100);
        pacer.wait();
        std::thread::sleep(Duration::from_millis(60));

        let start = Instant::now();
        pacer.wait();
        pacer.wait();
        pacer.wait();
        // no burst of back-to-back frames, and no long sleep either
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(15));
        assert!(elapsed < Duration::from_millis(60));
    }
}
