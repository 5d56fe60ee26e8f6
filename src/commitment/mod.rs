//! Answer commitments for the Wisdom trial
//!
//! The client never holds the plaintext correct answers. Each answer is
//! committed as `sha256(domain || question_id || answer)` over
//! the question's stable id and the canonical option text, so neither the
//! display order of questions nor the display order of options leaks into the
//! digest. The ledger keeps the published set of correct commitments and
//! decides pass/fail.

mod quiz;

pub use quiz::{DisplayedQuestion, Question, QuestionBank, QuizAttempt};

use crate::error::QuestError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// Stable identifier of a quiz question
pub type QuestionId = u32;

const COMMITMENT_DOMAIN: &[u8] = b"ronin-quest/chi-answer/v1";

/// One-way digest of a `(question, answer)` pair
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Commitment([u8; 32]);

impl Commitment {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }
}

impl std::fmt::Debug for Commitment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Commitment({})", self.to_hex())
    }
}

impl std::fmt::Display for Commitment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<Commitment> for String {
    fn from(c: Commitment) -> Self {
        c.to_hex()
    }
}

impl TryFrom<String> for Commitment {
    type Error = QuestError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        let digits = raw.strip_prefix("0x").unwrap_or(&raw);
        let bytes = hex::decode(digits)
            .map_err(|e| QuestError::InvalidAnswers(format!("bad commitment hex: {}", e)))?;
        let array: [u8; 32] = bytes
            .try_into()
            .map_err(|_| QuestError::InvalidAnswers("commitment must be 32 bytes".into()))?;
        Ok(Self(array))
    }
}

/// Commit to an answer for the question with the given stable id.
pub fn commit(question_id: QuestionId, answer_text: &str) -> Commitment {
    let mut hasher = Sha256::new();
    hasher.update(COMMITMENT_DOMAIN);
    hasher.update(question_id.to_be_bytes());
    hasher.update(answer_text.as_bytes());
    Commitment(hasher.finalize().into())
}

/// Commitments for one submitted attempt, ordered by question id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedAnswers {
    entries: Vec<(QuestionId, Commitment)>,
}

impl SealedAnswers {
    pub fn new(mut entries: Vec<(QuestionId, Commitment)>) -> Self {
        entries.sort_by_key(|(id, _)| *id);
        Self { entries }
    }

    pub fn question_ids(&self) -> Vec<QuestionId> {
        self.entries.iter().map(|(id, _)| *id).collect()
    }

    pub fn commitments(&self) -> Vec<Commitment> {
        self.entries.iter().map(|(_, c)| *c).collect()
    }

    pub fn entries(&self) -> &[(QuestionId, Commitment)] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Published correct commitments, keyed by question id.
///
/// Held by the ledger (and optionally by the client for advisory scoring).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnswerKey {
    correct: HashMap<QuestionId, Commitment>,
}

impl AnswerKey {
    pub fn new(correct: HashMap<QuestionId, Commitment>) -> Self {
        Self { correct }
    }

    /// Build a key by committing each plaintext answer (publisher side)
    pub fn from_plaintext<'a>(answers: impl IntoIterator<Item = (QuestionId, &'a str)>) -> Self {
        Self {
            correct: answers
                .into_iter()
                .map(|(id, text)| (id, commit(id, text)))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.correct.len()
    }

    pub fn is_empty(&self) -> bool {
        self.correct.is_empty()
    }

    /// Number of submitted commitments that match the key.
    ///
    /// Advisory only; the ledger applies its own pass rule.
    pub fn score(&self, answers: &SealedAnswers) -> usize {
        answers
            .entries()
            .iter()
            .filter(|(id, c)| self.correct.get(id) == Some(c))
            .count()
    }
}
