//! Lead-capture sub-flow.
//!
//! The orchestrator owns the question pointer so barge-ins and retries
//! never skip or repeat a question; the pointer only advances on an
//! accepted `capture_lead_answer`.

use vl_domain::tenant::{LeadAnswerKind, LeadQuestion};

pub struct LeadFlow {
    questions: Vec<LeadQuestion>,
    next_idx: usize,
}

impl LeadFlow {
    pub fn new(questions: Vec<LeadQuestion>) -> Self {
        Self {
            questions,
            next_idx: 0,
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.questions.is_empty()
    }

    pub fn current(&self) -> Option<&LeadQuestion> {
        self.questions.get(self.next_idx)
    }

    pub fn completed(&self) -> bool {
        self.is_configured() && self.next_idx >= self.questions.len()
    }

    pub fn kind_of(&self, question_id: &str) -> Option<LeadAnswerKind> {
        self.questions
            .iter()
            .find(|q| q.id == question_id)
            .map(|q| q.kind)
    }

    /// Validate and accept an answer for `question_id`. Answers to past
    /// questions are accepted idempotently without moving the pointer;
    /// answers to future questions are refused.
    pub fn accept(&mut self, question_id: &str, answer: &str) -> AcceptOutcome {
        let Some(pos) = self.questions.iter().position(|q| q.id == question_id) else {
            return AcceptOutcome::UnknownQuestion;
        };
        let question = &self.questions[pos];
        if !validate_answer(question.kind, answer) {
            return AcceptOutcome::Invalid {
                kind: question.kind,
            };
        }
        if pos > self.next_idx {
            return AcceptOutcome::OutOfOrder {
                expected: self.questions[self.next_idx].id.clone(),
            };
        }
        if pos == self.next_idx {
            self.next_idx += 1;
        }
        AcceptOutcome::Accepted {
            next: self.current().cloned(),
        }
    }
}

#[derive(Debug)]
pub enum AcceptOutcome {
    Accepted { next: Option<LeadQuestion> },
    Invalid { kind: LeadAnswerKind },
    OutOfOrder { expected: String },
    UnknownQuestion,
}

/// Keep only the digits of a spoken or keyed phone number.
pub fn normalize_phone(answer: &str) -> String {
    answer.chars().filter(|c| c.is_ascii_digit()).collect()
}

pub fn validate_answer(kind: LeadAnswerKind, answer: &str) -> bool {
    match kind {
        LeadAnswerKind::Text => !answer.trim().is_empty(),
        LeadAnswerKind::Email => {
            let trimmed = answer.trim();
            match trimmed.split_once('@') {
                Some((local, domain)) => {
                    !local.is_empty() && domain.contains('.') && !domain.ends_with('.')
                }
                None => false,
            }
        }
        LeadAnswerKind::Phone => normalize_phone(answer).len() >= 10,
    }
}
