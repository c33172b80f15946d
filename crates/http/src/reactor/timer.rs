//! Time-ordered connection timers.
//!
//! Entries are keyed by `(deadline, sequence)` so equal deadlines keep their scheduling
//! order. Expired entries are removed from the set before the reactor acts on them.

use std::collections::BTreeMap;
use std::time::Instant;

use mio::Token;

/// What a connection was waiting for when its timer fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Accepted, no request byte yet.
    Startup,
    /// Inside a request, waiting for more bytes.
    Read,
    /// Output pending, waiting for the socket to drain.
    Write,
    /// Idle between two requests.
    KeepAlive,
}

pub(crate) type TimerKey = (Instant, u64);

#[derive(Debug, Default)]
pub(crate) struct Timers {
    entries: BTreeMap<TimerKey, (Token, TimerKind)>,
    seq: u64,
}

impl Timers {
    pub(crate) fn new() -> Self {
        Default::default()
    }

    pub(crate) fn schedule(&mut self, token: Token, kind: TimerKind, deadline: Instant) -> TimerKey {
        self.seq += 1;
        let key = (deadline, self.seq);
        self.entries.insert(key, (token, kind));
        key
    }

    pub(crate) fn cancel(&mut self, key: TimerKey) {
        self.entries.remove(&key);
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.entries.first_key_value().map(|((deadline, _), _)| *deadline)
    }

    /// Removes and returns every entry due at `now`, earliest first.
    pub(crate) fn expire(&mut self, now: Instant) -> Vec<(Token, TimerKind)> {
        let mut expired = Vec::new();
        while let Some(entry) = self.entries.first_entry() {
            if entry.key().0 > now {
                break;
            }
            expired.push(entry.remove());
        }
        expired
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn expire_in_deadline_order() {
        let now = Instant::now();
        let mut timers = Timers::new();
        timers.schedule(Token(2), TimerKind::Read, now + Duration::from_millis(20));
        timers.schedule(Token(1), TimerKind::Startup, now + Duration::from_millis(10));
        timers.schedule(Token(3), TimerKind::Write, now + Duration::from_secs(60));

        assert_eq!(timers.next_deadline(), Some(now + Duration::from_millis(10)));
        assert!(timers.expire(now).is_empty());

        let expired = timers.expire(now + Duration::from_millis(25));
        assert_eq!(expired, vec![(Token(1), TimerKind::Startup), (Token(2), TimerKind::Read)]);
        assert_eq!(timers.len(), 1);
    }

    #[test]
    fn same_deadline_keeps_schedule_order() {
        let deadline = Instant::now();
        let mut timers = Timers::new();
        timers.schedule(Token(7), TimerKind::KeepAlive, deadline);
        timers.schedule(Token(3), TimerKind::KeepAlive, deadline);
        let expired = timers.expire(deadline);
        assert_eq!(expired[0].0, Token(7));
        assert_eq!(expired[1].0, Token(3));
    }

    #[test]
    fn cancelled_timer_never_fires() {
        let now = Instant::now();
        let mut timers = Timers::new();
        let key = timers.schedule(Token(1), TimerKind::Read, now);
        timers.cancel(key);
        assert!(timers.expire(now + Duration::from_secs(1)).is_empty());
        assert_eq!(timers.next_deadline(), None);
    }
}
