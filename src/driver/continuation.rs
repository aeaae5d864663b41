//! The single pending "play the next beat" continuation of a driver.

/// Identifies one armed continuation. A token that is no longer current
/// must be ignored by whoever fires it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(u64);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scheduled {
    pub token: Token,
    /// Absolute time in seconds.
    pub due: f64,
}

#[derive(Debug, Default)]
pub struct Continuation {
    issued: u64,
    pending: Option<Scheduled>,
}

impl Continuation {
    /// Arm a continuation at `due`, replacing any pending one.
    pub fn arm(&mut self, due: f64) -> Token {
        self.issued += 1;
        let token = Token(self.issued);
        self.pending = Some(Scheduled { token, due });
        token
    }

    /// Returns true when something was pending.
    pub fn cancel(&mut self) -> bool {
        self.pending.take().is_some()
    }

    pub fn pending(&self) -> Option<Scheduled> {
        self.pending
    }

    /// Consume the pending continuation if `token` is still current and
    /// return its due time.
    pub fn claim(&mut self, token: Token) -> Option<f64> {
        match self.pending {
            Some(s) if s.token == token => {
                self.pending = None;
                Some(s.due)
            }
            _ => None,
        }
    }
}
