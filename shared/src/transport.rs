//! Transport kinds, the ordered preference offered on connect, and the
//! per-session upgrade attempt budget.

use std::fmt;

/// Available transport types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Request/response emulated channel; survives proxies and NATs
    Reliable,
    /// Long-lived low-latency stream
    Persistent,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Reliable => write!(f, "reliable"),
            TransportKind::Persistent => write!(f, "persistent"),
        }
    }
}

/// Ordered list of transports to try on the next connect attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportPreference(&'static [TransportKind]);

impl TransportPreference {
    /// `[Reliable]`
    pub const RELIABLE: Self = Self(&[TransportKind::Reliable]);
    /// `[Persistent, Reliable]`
    pub const UPGRADE: Self = Self(&[TransportKind::Persistent, TransportKind::Reliable]);

    pub fn primary(&self) -> TransportKind {
        self.0[0]
    }

    pub fn as_slice(&self) -> &'static [TransportKind] {
        self.0
    }
}

impl Default for TransportPreference {
    fn default() -> Self {
        Self::RELIABLE
    }
}

impl fmt::Display for TransportPreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, kind) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", kind)?;
        }
        write!(f, "]")
    }
}

/// Failed upgrade attempts, bounded by `max`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptCounter {
    failed: u32,
    max: u32,
}

impl AttemptCounter {
    pub fn new(max: u32) -> Self {
        Self { failed: 0, max }
    }

    /// Record a failed upgrade attempt and return the new count.
    ///
    /// Saturates at `max`.
    pub fn record_failure(&mut self) -> u32 {
        if self.failed < self.max {
            self.failed += 1;
        }
        self.failed
    }

    pub fn count(&self) -> u32 {
        self.failed
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    pub fn is_exhausted(&self) -> bool {
        self.failed >= self.max
    }
}
