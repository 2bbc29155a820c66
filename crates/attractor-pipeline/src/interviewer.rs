//! Interviewer trait and built-in implementations for human interaction.

use async_trait::async_trait;
use attractor_types::Result;

/// One selectable answer to a [`Question`], derived from an outgoing edge
/// label. An optional `&`-prefix accelerator (`"&Yes"`) is stripped from
/// `text` before display/matching but kept in `accelerator` so a concrete
/// `Interviewer` front-end can offer the shortcut key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Choice {
    pub text: String,
    pub accelerator: Option<char>,
}

impl Choice {
    pub fn plain(text: impl Into<String>) -> Self {
        Self { text: text.into(), accelerator: None }
    }
}

#[derive(Debug, Clone)]
pub struct Question {
    pub prompt: String,
    pub choices: Vec<Choice>,
    pub default: Option<String>,
    pub timeout: Option<std::time::Duration>,
}

#[derive(Debug, Clone)]
pub struct Answer {
    pub choice: String,
    pub custom_text: Option<String>,
}

#[async_trait]
pub trait Interviewer: Send + Sync {
    async fn ask(&self, question: &Question) -> Result<Answer>;
}

// ---------------------------------------------------------------------------
// AutoApproveInterviewer
// ---------------------------------------------------------------------------

pub struct AutoApproveInterviewer;

#[async_trait]
impl Interviewer for AutoApproveInterviewer {
    async fn ask(&self, question: &Question) -> Result<Answer> {
        let choice = question
            .default
            .clone()
            .or_else(|| question.choices.first().map(|c| c.text.clone()))
            .unwrap_or_default();
        Ok(Answer {
            choice,
            custom_text: None,
        })
    }
}

// ---------------------------------------------------------------------------
// ConsoleInterviewer
// ---------------------------------------------------------------------------

pub struct ConsoleInterviewer;

#[async_trait]
impl Interviewer for ConsoleInterviewer {
    async fn ask(&self, question: &Question) -> Result<Answer> {
        println!("\n{}", question.prompt);
        for (i, choice) in question.choices.iter().enumerate() {
            match choice.accelerator {
                Some(key) => println!("  [{}] {} ({})", i + 1, choice.text, key),
                None => println!("  [{}] {}", i + 1, choice.text),
            }
        }
        let mut input = String::new();
        std::io::stdin()
            .read_line(&mut input)
            .map_err(attractor_types::AttractorError::Io)?;
        let trimmed = input.trim();
        if let Ok(idx) = trimmed.parse::<usize>() {
            if idx > 0 && idx <= question.choices.len() {
                return Ok(Answer {
                    choice: question.choices[idx - 1].text.clone(),
                    custom_text: None,
                });
            }
        }
        if let Some(matched) = question.choices.iter().find(|c| {
            c.accelerator
                .is_some_and(|a| a.eq_ignore_ascii_case(&trimmed.chars().next().unwrap_or('\0')))
                && trimmed.len() == 1
        }) {
            return Ok(Answer {
                choice: matched.text.clone(),
                custom_text: None,
            });
        }
        Ok(Answer {
            choice: trimmed.to_string(),
            custom_text: Some(trimmed.to_string()),
        })
    }
}

// ---------------------------------------------------------------------------
// RecordingInterviewer
// ---------------------------------------------------------------------------

pub struct RecordingInterviewer {
    answers: std::sync::Mutex<Vec<Answer>>,
    questions: std::sync::Mutex<Vec<Question>>,
}

impl RecordingInterviewer {
    pub fn new(answers: Vec<Answer>) -> Self {
        let mut reversed = answers;
        reversed.reverse();
        Self {
            answers: std::sync::Mutex::new(reversed),
            questions: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn questions(&self) -> Vec<Question> {
        self.questions.lock().unwrap().clone()
    }
}

#[async_trait]
impl Interviewer for RecordingInterviewer {
    async fn ask(&self, question: &Question) -> Result<Answer> {
        self.questions.lock().unwrap().push(question.clone());
        let answer = self
            .answers
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(|| Answer {
                choice: question
                    .choices
                    .first()
                    .map(|c| c.text.clone())
                    .unwrap_or_default(),
                custom_text: None,
            });
        Ok(answer)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
