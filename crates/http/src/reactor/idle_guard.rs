use crate::reactor::ReactorError;

/// Detects a reactor spinning without doing anything.
///
/// An iteration counts as idle when it saw no event, fired no timer, applied no pending
/// change and its poll returned before the timeout. Too many idle iterations in a row
/// mean the poller keeps waking up for nothing.
#[derive(Debug)]
pub(crate) struct IdleGuard {
    threshold: Option<u32>,
    idle: u32,
}

impl IdleGuard {
    pub(crate) fn new(threshold: Option<u32>) -> Self {
        Self { threshold, idle: 0 }
    }

    pub(crate) fn record(&mut self, worked: bool) -> Result<(), ReactorError> {
        let Some(threshold) = self.threshold else {
            return Ok(());
        };

        if worked {
            self.idle = 0;
            return Ok(());
        }

        self.idle += 1;
        if self.idle > threshold {
            return Err(ReactorError::Livelock { iterations: self.idle });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trips_after_threshold() {
        let mut guard = IdleGuard::new(Some(2));
        guard.record(false).unwrap();
        guard.record(false).unwrap();
        assert!(matches!(guard.record(false), Err(ReactorError::Livelock { iterations: 3 })));
    }

    #[test]
    fn work_resets_the_count() {
        let mut guard = IdleGuard::new(Some(1));
        guard.record(false).unwrap();
        guard.record(true).unwrap();
        guard.record(false).unwrap();
    }

    #[test]
    fn disabled() {
        let mut guard = IdleGuard::new(None);
        for _ in 0..100 {
            guard.record(false).unwrap();
        }
    }
}
