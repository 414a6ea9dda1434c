// discovery/throttle.rs

/// Rate limiter for continuous drag input.
///
/// The first value offered in a window arms a single flush; later values in
/// the same window only replace the pending one. A commit drops whatever is
/// pending and invalidates the armed flush, so the final value always goes
/// out exactly once.
#[derive(Debug)]
pub struct DragThrottle<T> {
    pending: Option<T>,
    armed: Option<u64>,
    ticket: u64,
}

impl<T> Default for DragThrottle<T> {
    fn default() -> Self {
        Self {
            pending: None,
            armed: None,
            ticket: 0,
        }
    }
}

impl<T> DragThrottle<T> {
    /// Returns a ticket when the caller must schedule a flush for it.
    pub fn offer(&mut self, value: T) -> Option<u64> {
        self.pending = Some(value);
        if self.armed.is_some() {
            return None;
        }
        self.ticket += 1;
        self.armed = Some(self.ticket);
        Some(self.ticket)
    }

    pub fn flush(&mut self, ticket: u64) -> Option<T> {
        if self.armed != Some(ticket) {
            return None;
        }
        self.armed = None;
        self.pending.take()
    }

    pub fn commit(&mut self, value: T) -> T {
        self.reset();
        value
    }

    pub fn reset(&mut self) {
        self.pending = None;
        self.armed = None;
    }
}
