//! Question Source
//!
//! External collaborator supplying quiz content. A room's question
//! sequence (including the answer keys) is fetched once at creation and
//! frozen; it is never re-read mid-match, so upstream edits cannot
//! drift a running battle.

use serde::{Deserialize, Serialize};

/// Number of answer options per question.
pub const OPTION_COUNT: usize = 4;

/// A single quiz item with its baked-in answer key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Question {
    /// Source-assigned identifier, used for deduplication.
    pub id: String,
    /// Question text.
    pub prompt: String,
    /// The four answer options, in display order.
    pub options: [String; OPTION_COUNT],
    /// Index into `options` of the correct answer.
    pub correct_option: u8,
}

/// Question source errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QuestionError {
    /// Fewer distinct questions available than requested. Room creation
    /// must fail rather than pad with repeats.
    #[error("insufficient questions: {available} available, {requested} requested")]
    Insufficient {
        /// Distinct questions the source could provide.
        available: usize,
        /// Questions the caller asked for.
        requested: usize,
    },

    /// Source unreachable or returned malformed data.
    #[error("question source unavailable: {0}")]
    Unavailable(String),
}

/// Supplies ordered, deduplicated question sets for new rooms.
pub trait QuestionSource: Send + Sync {
    /// Fetch exactly `count` distinct questions.
    fn fetch(
        &self,
        count: usize,
    ) -> impl std::future::Future<Output = Result<Vec<Question>, QuestionError>> + Send;
}

/// In-memory question bank.
///
/// Backing store for tests and single-node deployments; duplicates by
/// `id` are dropped at construction.
pub struct MemoryQuestionSource {
    bank: Vec<Question>,
}

impl MemoryQuestionSource {
    /// Build from a list of questions, deduplicating by id.
    pub fn new(questions: Vec<Question>) -> Self {
        let mut seen = std::collections::BTreeSet::new();
        let bank = questions
            .into_iter()
            .filter(|q| seen.insert(q.id.clone()))
            .collect();
        Self { bank }
    }

    /// Number of distinct questions in the bank.
    pub fn len(&self) -> usize {
        self.bank.len()
    }

    /// Whether the bank is empty.
    pub fn is_empty(&self) -> bool {
        self.bank.is_empty()
    }
}

impl QuestionSource for MemoryQuestionSource {
    async fn fetch(&self, count: usize) -> Result<Vec<Question>, QuestionError> {
        if self.bank.len() < count {
            return Err(QuestionError::Insufficient {
                available: self.bank.len(),
                requested: count,
            });
        }
        Ok(self.bank[..count].to_vec())
    }
}
