/// Connection admission with a hysteresis band.
///
/// Accepting stops once the open connection count reaches the maximum and only
/// resumes after it fell below half of it, so a busy server does not flap its
/// listener registrations on every close.
#[derive(Debug)]
pub(crate) struct Admission {
    max: usize,
    accepting: bool,
}

impl Admission {
    pub(crate) fn new(max: usize) -> Self {
        Self { max, accepting: true }
    }

    #[inline]
    pub(crate) fn is_accepting(&self) -> bool {
        self.accepting
    }

    /// Returns the new state when `count` makes it flip.
    pub(crate) fn update(&mut self, count: usize) -> Option<bool> {
        if self.accepting && count >= self.max {
            self.accepting = false;
            return Some(false);
        }
        if !self.accepting && count * 2 < self.max {
            self.accepting = true;
            return Some(true);
        }
        None
    }
}
