//! Batch metadata: where each candidate cluster stands in the current episode.
//!
//! Built fresh every pass from the candidate clusters and the releases that
//! exist for them, and never persisted.

use chartfleet_state::ObjectKey;

/// State of one candidate's release within the current episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseState {
    /// No release has been reconciled for this episode yet.
    Missing,
    /// A release of this episode exists but is not ready.
    Pending,
    /// A release of this episode exists and is ready.
    Ready,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchEntry {
    pub cluster: ObjectKey,
    pub state: ReleaseState,
}

impl BatchEntry {
    pub fn new(cluster: ObjectKey, state: ReleaseState) -> Self {
        Self { cluster, state }
    }

    pub fn exists(&self) -> bool {
        self.state != ReleaseState::Missing
    }
}

/// Readiness gate derived from batch metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RolloutGate {
    /// No release of the episode exists yet.
    Unknown,
    /// At least one release of the episode is not ready.
    WaitingForReadiness,
    /// Every release of the episode is ready.
    AdvanceReady,
}

/// Candidate clusters in rollout order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchMetadata {
    entries: Vec<BatchEntry>,
}

impl BatchMetadata {
    /// Sort entries by `"namespace/name"` so every pass walks the fleet in
    /// the same order.
    pub fn new(entries: impl IntoIterator<Item = BatchEntry>) -> Self {
        let mut entries: Vec<_> = entries.into_iter().collect();
        entries.sort_by_cached_key(|e| e.cluster.to_string());
        Self { entries }
    }

    pub fn entries(&self) -> &[BatchEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of candidates with a release of the episode.
    pub fn existing(&self) -> usize {
        self.entries.iter().filter(|e| e.exists()).count()
    }

    pub fn gate(&self) -> RolloutGate {
        let mut any = false;
        for entry in &self.entries {
            match entry.state {
                ReleaseState::Missing => {}
                ReleaseState::Pending => return RolloutGate::WaitingForReadiness,
                ReleaseState::Ready => any = true,
            }
        }
        if any {
            RolloutGate::AdvanceReady
        } else {
            RolloutGate::Unknown
        }
    }
}
