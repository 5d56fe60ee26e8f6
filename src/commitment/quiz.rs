//! Question bank and per-attempt answer collection

use super::{commit, QuestionId, SealedAnswers};
use crate::error::{QuestError, Result};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    pub id: QuestionId,
    pub text: String,
    /// Canonical option texts; their order here is not meaningful to players
    pub options: Vec<String>,
}

/// Static question bank. Never mutated by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionBank {
    questions: Vec<Question>,
}

impl QuestionBank {
    pub fn new(questions: Vec<Question>) -> Result<Self> {
        let mut seen = HashSet::new();
        for q in &questions {
            if !seen.insert(q.id) {
                return Err(QuestError::Config(format!("duplicate question id {}", q.id)));
            }
            if q.options.len() < 2 {
                return Err(QuestError::Config(format!(
                    "question {} needs at least two options",
                    q.id
                )));
            }
        }
        Ok(Self { questions })
    }

    pub fn questions(&self) -> &[Question] {
        &self.questions
    }

    pub fn get(&self, id: QuestionId) -> Option<&Question> {
        self.questions.iter().find(|q| q.id == id)
    }

    pub fn len(&self) -> usize {
        self.questions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.questions.is_empty()
    }
}

/// A question as shown in one attempt: options in display order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayedQuestion<'a> {
    pub id: QuestionId,
    pub text: &'a str,
    pub options: Vec<&'a str>,
}

/// Presentation slot of one attempt
#[derive(Debug)]
struct Slot {
    /// Index into the bank
    question: usize,
    /// `display position -> canonical option index`
    option_order: Vec<usize>,
    /// Canonical option index picked by the player
    selected: Option<usize>,
}

/// One pass through the quiz.
///
/// Question order and option order are shuffled per attempt. Selections are
/// recorded by display position and translated to canonical option text only
/// when sealing. `seal` consumes the attempt, so the display mapping and the
/// chosen answers cannot outlive a submission.
///
/// # Example
///
/// ```rust,ignore
/// let mut attempt = QuizAttempt::start(&bank, 5, &mut rand::thread_rng());
/// for slot in 0..attempt.len() {
///     let shown = attempt.question(slot).unwrap();
///     attempt.select(slot, player_choice(&shown))?;
/// }
/// let payload = TrialPayload::Wisdom { answers: attempt.seal()? };
/// ```
#[derive(Debug)]
pub struct QuizAttempt<'a> {
    bank: &'a QuestionBank,
    slots: Vec<Slot>,
}

impl<'a> QuizAttempt<'a> {
    /// Draw `count` questions (all of them if `count` exceeds the bank)
    pub fn start<R: Rng + ?Sized>(bank: &'a QuestionBank, count: usize, rng: &mut R) -> Self {
        let mut picked: Vec<usize> = (0..bank.len()).collect();
        picked.shuffle(rng);
        picked.truncate(count.min(bank.len()));

        let slots = picked
            .into_iter()
            .map(|question| {
                let mut option_order: Vec<usize> =
                    (0..bank.questions[question].options.len()).collect();
                option_order.shuffle(rng);
                Slot {
                    question,
                    option_order,
                    selected: None,
                }
            })
            .collect();

        Self { bank, slots }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn question(&self, slot: usize) -> Option<DisplayedQuestion<'a>> {
        let slot = self.slots.get(slot)?;
        let question = &self.bank.questions[slot.question];
        Some(DisplayedQuestion {
            id: question.id,
            text: &question.text,
            options: slot
                .option_order
                .iter()
                .map(|canonical| question.options[*canonical].as_str())
                .collect(),
        })
    }

    /// Record the player's pick for `slot` by its displayed position
    pub fn select(&mut self, slot: usize, display_option: usize) -> Result<()> {
        let entry = self
            .slots
            .get_mut(slot)
            .ok_or_else(|| QuestError::InvalidAnswers(format!("no question in slot {}", slot)))?;
        let canonical = *entry.option_order.get(display_option).ok_or_else(|| {
            QuestError::InvalidAnswers(format!("slot {} has no option {}", slot, display_option))
        })?;
        entry.selected = Some(canonical);
        Ok(())
    }

    pub fn answered(&self) -> usize {
        self.slots.iter().filter(|s| s.selected.is_some()).count()
    }

    pub fn is_complete(&self) -> bool {
        self.answered() == self.slots.len()
    }

    /// Turn the selections into commitments and discard the attempt
    pub fn seal(self) -> Result<SealedAnswers> {
        if self.slots.is_empty() {
            return Err(QuestError::InvalidAnswers("no questions drawn".into()));
        }
        let mut entries = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            let question = &self.bank.questions[slot.question];
            let canonical = slot.selected.ok_or_else(|| {
                QuestError::InvalidAnswers(format!("question {} is unanswered", question.id))
            })?;
            entries.push((question.id, commit(question.id, &question.options[canonical])));
        }
        Ok(SealedAnswers::new(entries))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn bank() -> QuestionBank {
        QuestionBank::new(vec![
            Question {
                id: 10,
                text: "What stores game state?".into(),
                options: vec!["Models".into(), "Systems".into(), "Events".into()],
            },
            Question {
                id: 20,
                text: "What indexes the world?".into(),
                options: vec!["Katana".into(), "Torii".into(), "Sozo".into()],
            },
            Question {
                id: 30,
                text: "What runs the devnet?".into(),
                options: vec!["Katana".into(), "Saya".into()],
            },
        ])
        .unwrap()
    }

    /// Pick the displayed option whose text matches
    fn choose(attempt: &mut QuizAttempt<'_>, slot: usize, text: &str) {
        let shown = attempt.question(slot).unwrap();
        let pos = shown.options.iter().position(|o| *o == text).unwrap();
        attempt.select(slot, pos).unwrap();
    }

    fn correct_text(id: QuestionId) -> &'static str {
        match id {
            10 => "Models",
            20 => "Torii",
            _ => "Katana",
        }
    }

    #[test]
    fn test_rejects_duplicate_ids() {
        let q = Question {
            id: 1,
            text: "q".into(),
            options: vec!["a".into(), "b".into()],
        };
        assert!(QuestionBank::new(vec![q.clone(), q]).is_err());
    }

    #[test]
    fn test_shuffle_does_not_change_commitments() {
        let bank = bank();
        let mut sealed = Vec::new();
        for seed in [1u64, 2, 3, 42] {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut attempt = QuizAttempt::start(&bank, 3, &mut rng);
            for slot in 0..attempt.len() {
                let id = attempt.question(slot).unwrap().id;
                choose(&mut attempt, slot, correct_text(id));
            }
            sealed.push(attempt.seal().unwrap());
        }
        assert!(sealed.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(sealed[0].question_ids(), vec![10, 20, 30]);
        assert_eq!(sealed[0].commitments()[1], commit(20, "Torii"));
    }

    #[test]
    fn test_subset_draw() {
        let bank = bank();
        let attempt = QuizAttempt::start(&bank, 2, &mut StdRng::seed_from_u64(7));
        assert_eq!(attempt.len(), 2);
        let big = QuizAttempt::start(&bank, 10, &mut StdRng::seed_from_u64(7));
        assert_eq!(big.len(), 3);
    }

    #[test]
    fn test_unanswered_question_blocks_seal() {
        let bank = bank();
        let mut attempt = QuizAttempt::start(&bank, 3, &mut StdRng::seed_from_u64(5));
        let first = attempt.question(0).unwrap().id;
        choose(&mut attempt, 0, correct_text(first));
        assert_eq!(attempt.answered(), 1);
        assert!(!attempt.is_complete());
        assert!(matches!(attempt.seal(), Err(QuestError::InvalidAnswers(_))));
    }

    #[test]
    fn test_select_out_of_range() {
        let bank = bank();
        let mut attempt = QuizAttempt::start(&bank, 3, &mut StdRng::seed_from_u64(5));
        assert!(attempt.select(0, 9).is_err());
        assert!(attempt.select(9, 0).is_err());
    }
}
