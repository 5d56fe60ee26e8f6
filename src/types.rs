//! Shared identifiers and value types

use serde::{Deserialize, Serialize};

/// Seconds since the Unix epoch, as reported by the ledger
pub type Timestamp = u64;

/// Current wall-clock time in seconds since the Unix epoch
pub fn unix_now() -> Timestamp {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Account address of a player (hex felt in the ledger's encoding)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    /// Normalizes to lowercase so `0xAB` and `0xab` compare equal
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a minted quest record
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub u64);

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The three independently completable trials
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrialKind {
    /// Waza - proof of game ownership
    Technique,
    /// Chi - the quiz
    Wisdom,
    /// Shin - the time-locked vow
    Spirit,
}

impl TrialKind {
    pub const ALL: [TrialKind; 3] = [TrialKind::Technique, TrialKind::Wisdom, TrialKind::Spirit];

    /// Slot of this trial in fixed-size per-trial arrays
    pub fn index(self) -> usize {
        match self {
            Self::Technique => 0,
            Self::Wisdom => 1,
            Self::Spirit => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Technique => "technique",
            Self::Wisdom => "wisdom",
            Self::Spirit => "spirit",
        }
    }
}

impl std::fmt::Display for TrialKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One boolean per trial, as the ledger's progress read returns it
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrialFlags([bool; 3]);

impl TrialFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, trial: TrialKind) -> bool {
        self.0[trial.index()]
    }

    pub fn set(&mut self, trial: TrialKind, value: bool) {
        self.0[trial.index()] = value;
    }

    pub fn with(mut self, trial: TrialKind) -> Self {
        self.set(trial, true);
        self
    }

    /// Trials whose flag is set
    pub fn iter_set(&self) -> impl Iterator<Item = TrialKind> + '_ {
        TrialKind::ALL.into_iter().filter(move |t| self.get(*t))
    }

    pub fn count(&self) -> usize {
        self.0.iter().filter(|v| **v).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_normalization() {
        assert_eq!(Address::new("0xABC"), Address::new("0xabc"));
    }

    #[test]
    fn test_trial_flags() {
        let flags = TrialFlags::new().with(TrialKind::Spirit);
        assert!(flags.get(TrialKind::Spirit));
        assert!(!flags.get(TrialKind::Technique));
        assert_eq!(flags.iter_set().collect::<Vec<_>>(), vec![TrialKind::Spirit]);
        assert_eq!(flags.count(), 1);
    }
}
