//! Deadline supervision for the guarded legs of a request.
//!
//! The engine arms at most one deadline at a time; arming a new one or
//! cancelling invalidates every token handed out before. The supervisor is
//! pure state: actual timers live in the session driver, which posts the
//! token back when its sleep elapses. A token that no longer matches is a
//! stale firing and resolves to nothing.

/// What a deadline firing means to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadlineKind {
    Scan,
    Connect,
    ServiceDiscovery,
    CharacteristicDiscovery,
}

/// Ties a scheduled timer back to the deadline it was armed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeadlineToken(u64);

/// Single-deadline supervisor with generation-counted tokens.
#[derive(Debug, Default)]
pub struct TimeoutSupervisor {
    generation: u64,
    armed: Option<(DeadlineToken, DeadlineKind)>,
}

impl TimeoutSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a deadline, superseding any previously armed one.
    pub fn arm(&mut self, kind: DeadlineKind) -> DeadlineToken {
        self.generation += 1;
        let token = DeadlineToken(self.generation);
        self.armed = Some((token, kind));
        token
    }

    /// Disarm without firing. Outstanding tokens become stale.
    pub fn cancel(&mut self) {
        self.generation += 1;
        self.armed = None;
    }

    /// Resolve a timer firing. Returns the armed kind only when `token`
    /// still names the current deadline; stale firings return `None`.
    pub fn try_fire(&mut self, token: DeadlineToken) -> Option<DeadlineKind> {
        match self.armed {
            Some((armed, kind)) if armed == token => {
                self.armed = None;
                Some(kind)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_armed_deadline_fires_once() {
        let mut timeouts = TimeoutSupervisor::new();
        let token = timeouts.arm(DeadlineKind::Connect);

        assert_eq!(timeouts.try_fire(token), Some(DeadlineKind::Connect));
        // A second firing of the same token is stale
        assert_eq!(timeouts.try_fire(token), None);
    }

    #[test]
    fn test_cancelled_deadline_is_stale() {
        let mut timeouts = TimeoutSupervisor::new();
        let token = timeouts.arm(DeadlineKind::Scan);
        timeouts.cancel();

        assert_eq!(timeouts.try_fire(token), None);
    }

    #[test]
    fn test_rearming_supersedes_previous_token() {
        let mut timeouts = TimeoutSupervisor::new();
        let first = timeouts.arm(DeadlineKind::ServiceDiscovery);
        let second = timeouts.arm(DeadlineKind::CharacteristicDiscovery);

        // The old leg's timer may still fire after the machine moved on
        assert_eq!(timeouts.try_fire(first), None);
        assert_eq!(
            timeouts.try_fire(second),
            Some(DeadlineKind::CharacteristicDiscovery)
        );
    }
}
