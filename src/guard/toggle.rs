use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Sliding-window counter of relay transitions with a rate-limited alert
#[derive(Debug)]
pub(crate) struct ToggleMonitor {
    threshold: usize,
    window: Duration,
    cooldown: Duration,
    transitions: VecDeque<Instant>,
    last_alert: Option<Instant>,
}

impl ToggleMonitor {
    pub(crate) fn new(threshold: usize, window: Duration, cooldown: Duration) -> Self {
        Self {
            threshold,
            window,
            cooldown,
            transitions: VecDeque::new(),
            last_alert: None,
        }
    }

    /// Record a transition at `now`; returns the window count when an alert is due
    pub(crate) fn record(&mut self, now: Instant) -> Option<usize> {
        self.transitions.push_back(now);
        while let Some(&oldest) = self.transitions.front()
            && now.saturating_duration_since(oldest) > self.window
        {
            self.transitions.pop_front();
        }

        if self.transitions.len() < self.threshold {
            return None;
        }
        let cooled = self
            .last_alert
            .is_none_or(|t| now.saturating_duration_since(t) >= self.cooldown);
        if !cooled {
            return None;
        }
        self.last_alert = Some(now);
        Some(self.transitions.len())
    }

    pub(crate) fn window(&self) -> Duration {
        self.window
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> ToggleMonitor {
        ToggleMonitor::new(4, Duration::from_secs(300), Duration::from_secs(3600))
    }

    #[test]
    fn alerts_on_fourth_transition_in_window() {
        let mut m = monitor();
        let t0 = Instant::now();
        assert_eq!(m.record(t0), None);
        assert_eq!(m.record(t0 + Duration::from_secs(60)), None);
        assert_eq!(m.record(t0 + Duration::from_secs(120)), None);
        assert_eq!(m.record(t0 + Duration::from_secs(180)), Some(4));
    }

    #[test]
    fn old_transitions_fall_out_of_window() {
        let mut m = monitor();
        let t0 = Instant::now();
        for i in 0..3 {
            assert_eq!(m.record(t0 + Duration::from_secs(i * 10)), None);
        }
        assert_eq!(m.record(t0 + Duration::from_secs(400)), None);
    }

    #[test]
    fn alert_is_rate_limited() {
        let mut m = monitor();
        let t0 = Instant::now();
        for i in 0..4 {
            m.record(t0 + Duration::from_secs(i));
        }
        assert_eq!(m.record(t0 + Duration::from_secs(10)), None);
        assert_eq!(m.record(t0 + Duration::from_secs(20)), None);

        let later = t0 + Duration::from_secs(3700);
        for i in 0..3 {
            assert_eq!(m.record(later + Duration::from_secs(i)), None);
        }
        assert_eq!(m.record(later + Duration::from_secs(3)), Some(4));
    }
}
