//! Interviewer trait and built-in implementations for human-in-the-loop
//! interaction.
//!
//! `ask` is the only intentional suspension point outside retry backoff: it
//! blocks the current node (and therefore the whole sequential traversal)
//! until an answer arrives. Asynchronous frontends adapt by buffering or
//! queuing answers behind this synchronous-looking contract; the engine never
//! learns which implementation is wired in.

use async_trait::async_trait;
use trellis_types::Result;

#[derive(Debug, Clone)]
pub struct Question {
    /// Id of the node asking, for display and audit.
    pub node_id: String,
    pub prompt: String,
    pub choices: Vec<String>,
    /// Used when the question times out.
    pub default_choice: Option<String>,
    pub timeout: Option<std::time::Duration>,
}

#[derive(Debug, Clone)]
pub struct Answer {
    pub choice: String,
    pub custom_text: Option<String>,
    /// The human explicitly declined to answer; terminal for the node's gate.
    pub skipped: bool,
}

impl Answer {
    pub fn choice(choice: impl Into<String>) -> Self {
        Self {
            choice: choice.into(),
            custom_text: None,
            skipped: false,
        }
    }

    pub fn skip() -> Self {
        Self {
            choice: String::new(),
            custom_text: None,
            skipped: true,
        }
    }
}

#[async_trait]
pub trait Interviewer: Send + Sync {
    /// Ask one question, blocking until an answer is available.
    async fn ask(&self, question: &Question) -> Result<Answer>;

    /// Ask several questions; the default implementation asks them in order.
    async fn ask_multiple(&self, questions: &[Question]) -> Result<Vec<Answer>> {
        let mut answers = Vec::with_capacity(questions.len());
        for q in questions {
            answers.push(self.ask(q).await?);
        }
        Ok(answers)
    }

    /// One-way notification; no answer expected.
    async fn inform(&self, _message: &str, _node_id: &str) {}
}

// ---------------------------------------------------------------------------
// AutoApproveInterviewer — for unattended automation
// ---------------------------------------------------------------------------

/// Picks the default choice, falling back to the first option. Never skips.
pub struct AutoApproveInterviewer;

#[async_trait]
impl Interviewer for AutoApproveInterviewer {
    async fn ask(&self, question: &Question) -> Result<Answer> {
        let choice = question
            .default_choice
            .clone()
            .or_else(|| question.choices.first().cloned())
            .unwrap_or_default();
        Ok(Answer::choice(choice))
    }
}

// ---------------------------------------------------------------------------
// ConsoleInterviewer — stdin/stdout
// ---------------------------------------------------------------------------

pub struct ConsoleInterviewer;

#[async_trait]
impl Interviewer for ConsoleInterviewer {
    async fn ask(&self, question: &Question) -> Result<Answer> {
        println!("\n[{}] {}", question.node_id, question.prompt);
        for (i, choice) in question.choices.iter().enumerate() {
            println!("  [{}] {}", i + 1, choice);
        }
        println!("  (empty line to skip)");

        let mut input = String::new();
        std::io::stdin()
            .read_line(&mut input)
            .map_err(trellis_types::TrellisError::Io)?;
        let trimmed = input.trim();

        if trimmed.is_empty() {
            return Ok(Answer::skip());
        }
        if let Ok(idx) = trimmed.parse::<usize>() {
            if idx > 0 && idx <= question.choices.len() {
                return Ok(Answer::choice(question.choices[idx - 1].clone()));
            }
        }
        Ok(Answer {
            choice: trimmed.to_string(),
            custom_text: Some(trimmed.to_string()),
            skipped: false,
        })
    }

    async fn inform(&self, message: &str, node_id: &str) {
        println!("[{node_id}] {message}");
    }
}

// ---------------------------------------------------------------------------
// CallbackInterviewer — delegate to a closure
// ---------------------------------------------------------------------------

type AskCallback = dyn Fn(&Question) -> Answer + Send + Sync;

/// Delegates every question to a caller-supplied function. This is how
/// frontends with their own event loop plug in.
pub struct CallbackInterviewer {
    callback: Box<AskCallback>,
}

impl CallbackInterviewer {
    pub fn new(callback: impl Fn(&Question) -> Answer + Send + Sync + 'static) -> Self {
        Self {
            callback: Box::new(callback),
        }
    }
}

#[async_trait]
impl Interviewer for CallbackInterviewer {
    async fn ask(&self, question: &Question) -> Result<Answer> {
        Ok((self.callback)(question))
    }
}

// ---------------------------------------------------------------------------
// QueueInterviewer — pre-filled answers for deterministic tests
// ---------------------------------------------------------------------------

/// Pops answers from a pre-filled queue, first-queued first. When the queue
/// runs dry it falls back to the question's default, then its first choice.
pub struct QueueInterviewer {
    answers: std::sync::Mutex<Vec<Answer>>,
}

impl QueueInterviewer {
    pub fn new(answers: Vec<Answer>) -> Self {
        let mut reversed = answers;
        reversed.reverse();
        Self {
            answers: std::sync::Mutex::new(reversed),
        }
    }
}

#[async_trait]
impl Interviewer for QueueInterviewer {
    async fn ask(&self, question: &Question) -> Result<Answer> {
        let queued = self.answers.lock().expect("queue poisoned").pop();
        Ok(queued.unwrap_or_else(|| {
            Answer::choice(
                question
                    .default_choice
                    .clone()
                    .or_else(|| question.choices.first().cloned())
                    .unwrap_or_default(),
            )
        }))
    }
}

// ---------------------------------------------------------------------------
// RecordingInterviewer — transparent wrapper that records the exchange
// ---------------------------------------------------------------------------

/// Wraps another interviewer and records every question, answer, and inform
/// call. Useful for audits and for asserting on interaction in tests.
pub struct RecordingInterviewer<I: Interviewer> {
    inner: I,
    questions: std::sync::Mutex<Vec<Question>>,
    answers: std::sync::Mutex<Vec<Answer>>,
    informs: std::sync::Mutex<Vec<(String, String)>>,
}

impl<I: Interviewer> RecordingInterviewer<I> {
    pub fn new(inner: I) -> Self {
        Self {
            inner,
            questions: std::sync::Mutex::new(Vec::new()),
            answers: std::sync::Mutex::new(Vec::new()),
            informs: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn questions(&self) -> Vec<Question> {
        self.questions.lock().expect("recording poisoned").clone()
    }

    pub fn answers(&self) -> Vec<Answer> {
        self.answers.lock().expect("recording poisoned").clone()
    }

    pub fn informs(&self) -> Vec<(String, String)> {
        self.informs.lock().expect("recording poisoned").clone()
    }
}

#[async_trait]
impl<I: Interviewer> Interviewer for RecordingInterviewer<I> {
    async fn ask(&self, question: &Question) -> Result<Answer> {
        self.questions
            .lock()
            .expect("recording poisoned")
            .push(question.clone());
        let answer = self.inner.ask(question).await?;
        self.answers
            .lock()
            .expect("recording poisoned")
            .push(answer.clone());
        Ok(answer)
    }

    async fn inform(&self, message: &str, node_id: &str) {
        self.informs
            .lock()
            .expect("recording poisoned")
            .push((message.to_string(), node_id.to_string()));
        self.inner.inform(message, node_id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn question(prompt: &str, choices: &[&str], default: Option<&str>) -> Question {
        Question {
            node_id: "gate".into(),
            prompt: prompt.into(),
            choices: choices.iter().map(|s| s.to_string()).collect(),
            default_choice: default.map(String::from),
            timeout: None,
        }
    }

    #[tokio::test]
    async fn auto_approve_prefers_default_then_first() {
        let interviewer = AutoApproveInterviewer;

        let with_default = question("Pick", &["Alpha", "Beta"], Some("Beta"));
        assert_eq!(interviewer.ask(&with_default).await.unwrap().choice, "Beta");

        let without = question("Pick", &["Alpha", "Beta"], None);
        assert_eq!(interviewer.ask(&without).await.unwrap().choice, "Alpha");
    }

    #[tokio::test]
    async fn callback_interviewer_delegates() {
        let interviewer = CallbackInterviewer::new(|q: &Question| {
            Answer::choice(q.choices.last().cloned().unwrap_or_default())
        });
        let answer = interviewer
            .ask(&question("Pick", &["A", "B", "C"], None))
            .await
            .unwrap();
        assert_eq!(answer.choice, "C");
    }

    #[tokio::test]
    async fn queue_plays_back_in_order_then_falls_back() {
        let interviewer = QueueInterviewer::new(vec![
            Answer::choice("Yes"),
            Answer::skip(),
        ]);
        let q = question("Continue?", &["Yes", "No"], None);

        assert_eq!(interviewer.ask(&q).await.unwrap().choice, "Yes");
        assert!(interviewer.ask(&q).await.unwrap().skipped);
        // Queue exhausted: first choice.
        assert_eq!(interviewer.ask(&q).await.unwrap().choice, "Yes");
    }

    #[tokio::test]
    async fn ask_multiple_default_asks_in_order() {
        let interviewer = QueueInterviewer::new(vec![
            Answer::choice("one"),
            Answer::choice("two"),
        ]);
        let qs = vec![
            question("First?", &["one"], None),
            question("Second?", &["two"], None),
        ];
        let answers = interviewer.ask_multiple(&qs).await.unwrap();
        assert_eq!(answers.len(), 2);
        assert_eq!(answers[0].choice, "one");
        assert_eq!(answers[1].choice, "two");
    }

    #[tokio::test]
    async fn recording_wrapper_captures_exchange() {
        let interviewer = RecordingInterviewer::new(AutoApproveInterviewer);
        let q = question("Deploy?", &["Ship it", "Hold"], None);

        let answer = interviewer.ask(&q).await.unwrap();
        assert_eq!(answer.choice, "Ship it");
        interviewer.inform("deployed", "release").await;

        assert_eq!(interviewer.questions().len(), 1);
        assert_eq!(interviewer.questions()[0].prompt, "Deploy?");
        assert_eq!(interviewer.answers()[0].choice, "Ship it");
        assert_eq!(
            interviewer.informs(),
            vec![("deployed".to_string(), "release".to_string())]
        );
    }
}
