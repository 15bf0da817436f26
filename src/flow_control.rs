use tracing::debug;

/// RTT above which conditions count as bad
pub const RTT_THRESHOLD_MS: f32 = 250.0;

/// Penalty the controller starts with
pub const INITIAL_PENALTY_TIME: f32 = 4.0;
pub const MIN_PENALTY_TIME: f32 = 1.0;
pub const MAX_PENALTY_TIME: f32 = 60.0;

/// A good streak shorter than this is punished when it ends
pub const SHORT_GOOD_STREAK: f32 = 10.0;

/// Sustained good time needed to halve the penalty
pub const PENALTY_REDUCTION_INTERVAL: f32 = 10.0;

/// Send rates in packets per second
pub const GOOD_SEND_RATE: f32 = 30.0;
pub const BAD_SEND_RATE: f32 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowMode {
    Good,
    Bad,
}

/// Two-mode send rate controller driven by the link RTT.
///
/// Starts in `Bad`. Good conditions must last longer than the penalty time
/// before the link is upgraded, and a good period that ends quickly doubles
/// the penalty so the link doesn't flap between modes.
#[derive(Debug, Clone)]
pub struct FlowControl {
    mode: FlowMode,
    penalty_time: f32,
    good_conditions_time: f32,
    penalty_reduction_accumulator: f32,
}

impl Default for FlowControl {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowControl {
    pub fn new() -> Self {
        Self {
            mode: FlowMode::Bad,
            penalty_time: INITIAL_PENALTY_TIME,
            good_conditions_time: 0.0,
            penalty_reduction_accumulator: 0.0,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Feeds one RTT sample (milliseconds) covering `delta_time` seconds.
    pub fn update(&mut self, delta_time: f32, rtt_ms: f32) {
        match self.mode {
            FlowMode::Good => self.update_good(delta_time, rtt_ms),
            FlowMode::Bad => self.update_bad(delta_time, rtt_ms),
        }
    }

    fn update_good(&mut self, delta_time: f32, rtt_ms: f32) {
        if rtt_ms > RTT_THRESHOLD_MS {
            self.mode = FlowMode::Bad;
            if self.good_conditions_time < SHORT_GOOD_STREAK
                && self.penalty_time < MAX_PENALTY_TIME
            {
                self.penalty_time = (self.penalty_time * 2.0).min(MAX_PENALTY_TIME);
                debug!(penalty_time = self.penalty_time, "flow control penalty increased");
            }
            debug!(rtt_ms, "flow control dropping to bad mode");
            self.good_conditions_time = 0.0;
            self.penalty_reduction_accumulator = 0.0;
            return;
        }

        self.good_conditions_time += delta_time;
        self.penalty_reduction_accumulator += delta_time;

        if self.penalty_reduction_accumulator > PENALTY_REDUCTION_INTERVAL
            && self.penalty_time > MIN_PENALTY_TIME
        {
            self.penalty_time = (self.penalty_time / 2.0).max(MIN_PENALTY_TIME);
            self.penalty_reduction_accumulator = 0.0;
            debug!(penalty_time = self.penalty_time, "flow control penalty reduced");
        }
    }

    fn update_bad(&mut self, delta_time: f32, rtt_ms: f32) {
        if rtt_ms <= RTT_THRESHOLD_MS {
            self.good_conditions_time += delta_time;
        } else {
            self.good_conditions_time = 0.0;
        }

        if self.good_conditions_time > self.penalty_time {
            debug!(penalty_time = self.penalty_time, "flow control upgrading to good mode");
            self.good_conditions_time = 0.0;
            self.penalty_reduction_accumulator = 0.0;
            self.mode = FlowMode::Good;
        }
    }

    /// Packets per second the caller's pacing loop should use
    pub fn send_rate(&self) -> f32 {
        match self.mode {
            FlowMode::Good => GOOD_SEND_RATE,
            FlowMode::Bad => BAD_SEND_RATE,
        }
    }

    pub fn mode(&self) -> FlowMode {
        self.mode
    }

    pub fn penalty_time(&self) -> f32 {
        self.penalty_time
    }

    pub fn good_conditions_time(&self) -> f32 {
        self.good_conditions_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(flow: &mut FlowControl, seconds: f32, step: f32, rtt_ms: f32) {
        let steps = (seconds / step).round() as usize;
        for _ in 0..steps {
            flow.update(step, rtt_ms);
        }
    }

    #[test]
    fn test_starts_bad() {
        let flow = FlowControl::new();
        assert_eq!(flow.mode(), FlowMode::Bad);
        assert_eq!(flow.penalty_time(), 4.0);
        assert_eq!(flow.send_rate(), 10.0);
    }

    #[test]
    fn test_good_then_short_streak_doubles_penalty() {
        let mut flow = FlowControl::new();
        feed(&mut flow, 5.0, 0.25, 100.0);
        assert_eq!(flow.mode(), FlowMode::Good);
        assert_eq!(flow.send_rate(), 30.0);

        flow.update(0.25, 300.0);
        assert_eq!(flow.mode(), FlowMode::Bad);
        assert_eq!(flow.penalty_time(), 8.0);
        assert_eq!(flow.good_conditions_time(), 0.0);
    }

    #[test]
    fn test_bad_sample_resets_good_streak() {
        let mut flow = FlowControl::new();
        feed(&mut flow, 3.0, 0.5, 100.0);
        flow.update(0.5, 400.0);
        assert_eq!(flow.good_conditions_time(), 0.0);
        feed(&mut flow, 3.0, 0.5, 100.0);
        assert_eq!(flow.mode(), FlowMode::Bad);
        feed(&mut flow, 1.5, 0.5, 100.0);
        assert_eq!(flow.mode(), FlowMode::Good);
    }

    #[test]
    fn test_threshold_is_inclusive_for_good() {
        let mut flow = FlowControl::new();
        feed(&mut flow, 5.0, 0.5, RTT_THRESHOLD_MS);
        assert_eq!(flow.mode(), FlowMode::Good);
        flow.update(0.5, RTT_THRESHOLD_MS);
        assert_eq!(flow.mode(), FlowMode::Good);
    }

    #[test]
    fn test_sustained_good_conditions_halve_penalty() {
        let mut flow = FlowControl::new();
        feed(&mut flow, 5.0, 0.5, 100.0);
        assert_eq!(flow.mode(), FlowMode::Good);

        // first reduction once the accumulator passes 10 s
        feed(&mut flow, 10.5, 0.5, 100.0);
        assert_eq!(flow.penalty_time(), 2.0);
        feed(&mut flow, 10.5, 0.5, 100.0);
        assert_eq!(flow.penalty_time(), 1.0);
        feed(&mut flow, 30.0, 0.5, 100.0);
        assert_eq!(flow.penalty_time(), 1.0);

        // a long streak ending does not raise the penalty
        flow.update(0.5, 500.0);
        assert_eq!(flow.mode(), FlowMode::Bad);
        assert_eq!(flow.penalty_time(), 1.0);
    }

    #[test]
    fn test_penalty_is_clamped_at_sixty_seconds() {
        let mut flow = FlowControl::new();
        for _ in 0..10 {
            let penalty = flow.penalty_time();
            feed(&mut flow, penalty + 1.0, 0.5, 100.0);
            assert_eq!(flow.mode(), FlowMode::Good);
            flow.update(0.5, 1000.0);
            assert_eq!(flow.mode(), FlowMode::Bad);
        }
        assert_eq!(flow.penalty_time(), MAX_PENALTY_TIME);
    }

    #[test]
    fn test_reset() {
        let mut flow = FlowControl::new();
        feed(&mut flow, 5.0, 0.5, 100.0);
        flow.reset();
        assert_eq!(flow.mode(), FlowMode::Bad);
        assert_eq!(flow.penalty_time(), INITIAL_PENALTY_TIME);
    }
}
