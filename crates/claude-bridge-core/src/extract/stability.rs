//! Response stability tracking
//!
//! A streamed reply is accepted once its length stops changing for
//! `required` consecutive polls. Any streaming indicator starts over.

/// What a single poll observed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StabilityVerdict {
    /// Still generating, nothing usable yet
    Waiting,
    /// Text length changed since the last poll
    Growing { len: usize },
    /// Same length as the previous poll
    Holding { len: usize, stable: u32 },
    /// Held long enough, accept it
    Stable { len: usize },
}

#[derive(Debug, Clone)]
pub struct StabilityTracker {
    required: u32,
    min_len: usize,
    last_len: usize,
    stable: u32,
}

impl StabilityTracker {
    pub fn new(required: u32, min_len: usize) -> Self {
        Self {
            required,
            min_len,
            last_len: 0,
            stable: 0,
        }
    }

    pub fn reset(&mut self) {
        self.last_len = 0;
        self.stable = 0;
    }

    /// A streaming indicator was visible
    pub fn observe_streaming(&mut self) -> StabilityVerdict {
        self.reset();
        StabilityVerdict::Waiting
    }

    /// Feed the extracted text of one poll
    pub fn observe(&mut self, text: Option<&str>) -> StabilityVerdict {
        let len = match text {
            Some(t) => t.chars().count(),
            None => return StabilityVerdict::Waiting,
        };
        if len <= self.min_len {
            return StabilityVerdict::Waiting;
        }

        if len == self.last_len {
            self.stable += 1;
            if self.stable >= self.required {
                StabilityVerdict::Stable { len }
            } else {
                StabilityVerdict::Holding {
                    len,
                    stable: self.stable,
                }
            }
        } else {
            self.last_len = len;
            self.stable = 0;
            StabilityVerdict::Growing { len }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(chunks: usize) -> String {
        "0123456789abcdefghijklmnopqrstuvwxyz".repeat(chunks)
    }

    #[test]
    fn test_accepts_on_third_identical_sample() {
        let mut tracker = StabilityTracker::new(2, 50);
        let (a, ab, abc) = (text(2), text(3), text(4));

        assert_eq!(tracker.observe(Some(&a)), StabilityVerdict::Growing { len: 72 });
        assert_eq!(tracker.observe(Some(&ab)), StabilityVerdict::Growing { len: 108 });
        assert_eq!(tracker.observe(Some(&abc)), StabilityVerdict::Growing { len: 144 });
        assert_eq!(
            tracker.observe(Some(&abc)),
            StabilityVerdict::Holding { len: 144, stable: 1 }
        );
        assert_eq!(tracker.observe(Some(&abc)), StabilityVerdict::Stable { len: 144 });
    }

    #[test]
    fn test_streaming_resets_progress() {
        let mut tracker = StabilityTracker::new(2, 50);
        let abc = text(4);

        tracker.observe(Some(&abc));
        tracker.observe(Some(&abc));
        assert_eq!(tracker.observe_streaming(), StabilityVerdict::Waiting);

        assert_eq!(tracker.observe(Some(&abc)), StabilityVerdict::Growing { len: 144 });
        assert_eq!(
            tracker.observe(Some(&abc)),
            StabilityVerdict::Holding { len: 144, stable: 1 }
        );
    }

    #[test]
    fn test_short_or_missing_text_is_ignored() {
        let mut tracker = StabilityTracker::new(2, 50);
        let abc = text(4);

        tracker.observe(Some(&abc));
        assert_eq!(tracker.observe(Some("short")), StabilityVerdict::Waiting);
        assert_eq!(tracker.observe(None), StabilityVerdict::Waiting);
        assert_eq!(
            tracker.observe(Some(&abc)),
            StabilityVerdict::Holding { len: 144, stable: 1 }
        );
    }
}
