//! Public types for the drain engine.

/// Engine lifecycle state.
///
/// ```text
/// Created → Idle ⇄ Draining → Saving → Acknowledging ─┐
///                     ▲                               │
///                     └───────────────────────────────┘
/// any state ──stop()──► Stopped (at the next suspension point)
/// ```
///
/// Use [`super::SyncEngine::state()`] to check the current state or
/// [`super::SyncEngine::state_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Constructed, `serve()` not running yet
    Created,
    /// Waiting out the backoff after an empty ledger or a failed pass
    Idle,
    /// Looking for the oldest dirty entry
    Draining,
    /// Writing an entry to the durable store
    Saving,
    /// Acknowledging the saved revision in the ledger
    Acknowledging,
    /// `serve()` returned
    Stopped,
}

impl EngineState {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "Created",
            Self::Idle => "Idle",
            Self::Draining => "Draining",
            Self::Saving => "Saving",
            Self::Acknowledging => "Acknowledging",
            Self::Stopped => "Stopped",
        }
    }
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counters since the engine was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainStats {
    /// Entries saved to the durable store (includes re-saves after a stale ack)
    pub persisted: u64,
    /// Failed save / ledger calls
    pub failed: u64,
    /// Keys moved to quarantine after a decode failure
    pub quarantined: u64,
    /// Acknowledges skipped because a newer revision landed
    pub stale_acks: u64,
}

/// How a drain pass ended (internal).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum PassOutcome {
    /// Ledger empty; carries the number of acknowledged entries
    Drained(usize),
    /// Cancellation observed mid-pass
    Stopped,
}
