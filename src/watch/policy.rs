use crate::portal::FetchError;

/// Tracks consecutive failed cycles for one subscriber. Only the first
/// non-transient failure of a streak is worth telling the subscriber about;
/// repeats escalate silently in the logs.
#[derive(Debug, Default, Clone)]
pub struct FailureStreak {
    consecutive: u32,
    notified: bool,
}

impl FailureStreak {
    /// Records a failure and returns whether it warrants a notice.
    pub fn record(&mut self, error: &FetchError) -> bool {
        self.consecutive = self.consecutive.saturating_add(1);
        if error.is_transient() || self.notified {
            return false;
        }
        self.notified = true;
        true
    }

    /// Clears the streak after a successful fetch, returning its length.
    pub fn reset(&mut self) -> u32 {
        let length = self.consecutive;
        *self = Self::default();
        length
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }
}
