//! Built-in book steps.
//!
//! Each generative step builds a prompt from the payload keys it reads, calls
//! the [`Generator`], and writes the single key it owns. `quality` and
//! `final` are local computations and never call the generator.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use regex::Regex;

use folio_types::{FolioError, GenerationRequest, Generator, Result, SharedState};

use crate::quality::{quality_score, SCORE_KEYS};
use crate::step::StepHandler;

const SYSTEM_PROMPT: &str = "You are one stage of a technical book writing pipeline. \
Answer with the requested content only.";

fn prompt_header(state: &SharedState) -> String {
    format!("Topic: {}", state.document_id)
}

fn append_section(prompt: &mut String, state: &SharedState, key: &str) {
    let text = state.get_str(key);
    if !text.is_empty() {
        prompt.push_str(&format!("\n\n[{key}]\n{text}"));
    }
}

fn empty_output(step: &str) -> FolioError {
    FolioError::StepFailed {
        step: step.to_string(),
        message: "generator returned no content".into(),
    }
}

// ---------------------------------------------------------------------------
// GenerativeStep
// ---------------------------------------------------------------------------

/// A step that turns some payload keys into one new payload key.
pub struct GenerativeStep {
    name: String,
    output_key: String,
    inputs: Vec<String>,
    instruction: String,
    generator: Arc<dyn Generator>,
}

impl GenerativeStep {
    pub fn new(
        name: impl Into<String>,
        output_key: impl Into<String>,
        instruction: impl Into<String>,
        generator: Arc<dyn Generator>,
    ) -> Self {
        Self {
            name: name.into(),
            output_key: output_key.into(),
            inputs: Vec::new(),
            instruction: instruction.into(),
            generator,
        }
    }

    /// Payload keys whose text is included in the prompt.
    pub fn reads<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inputs = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn output_key(&self) -> &str {
        &self.output_key
    }

    fn prompt(&self, state: &SharedState) -> String {
        let mut prompt = format!("{}\n{}", prompt_header(state), self.instruction);
        for key in &self.inputs {
            append_section(&mut prompt, state, key);
        }
        prompt
    }
}

#[async_trait]
impl StepHandler for GenerativeStep {
    async fn execute(&self, mut state: SharedState) -> Result<SharedState> {
        tracing::debug!(step = %self.name, "Requesting generation");
        let request = GenerationRequest::new(&self.name, self.prompt(&state)).with_system(SYSTEM_PROMPT);
        let text = self.generator.generate(request).await?;
        if text.trim().is_empty() {
            return Err(empty_output(&self.name));
        }
        state.set(self.output_key.clone(), text);
        Ok(state)
    }
}

// ---------------------------------------------------------------------------
// ReviewStep
// ---------------------------------------------------------------------------

fn score_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)(technical[ _]accuracy|engagement|consistency)\s*(?:score)?\s*[:=]\s*([0-9]+(?:\.[0-9]+)?)")
            .expect("score pattern is a valid regex")
    })
}

/// Pull the three review scores out of free-form review text. Scores above 1
/// are read as marks out of ten. Missing scores are `None`.
pub fn parse_scores(text: &str) -> [Option<f64>; 3] {
    let mut scores = [None; 3];
    for caps in score_pattern().captures_iter(text) {
        let label = caps[1].to_ascii_lowercase();
        let Ok(mut value) = caps[2].parse::<f64>() else {
            continue;
        };
        if value > 1.0 {
            value /= 10.0;
        }
        let value = value.clamp(0.0, 1.0);
        let slot = if label.starts_with("technical") {
            0
        } else if label == "engagement" {
            1
        } else {
            2
        };
        scores[slot].get_or_insert(value);
    }
    scores
}

/// Reviews the chapters and records `review_notes` and the three scores.
pub struct ReviewStep {
    name: String,
    generator: Arc<dyn Generator>,
}

impl ReviewStep {
    pub fn new(name: impl Into<String>, generator: Arc<dyn Generator>) -> Self {
        Self {
            name: name.into(),
            generator,
        }
    }

    pub const NOTES_KEY: &'static str = "review_notes";

    /// Keys the review step writes.
    pub fn owned_keys() -> Vec<String> {
        std::iter::once(Self::NOTES_KEY)
            .chain(SCORE_KEYS)
            .map(String::from)
            .collect()
    }
}

#[async_trait]
impl StepHandler for ReviewStep {
    async fn execute(&self, mut state: SharedState) -> Result<SharedState> {
        let mut prompt = format!(
            "{}\nReview the chapters. Rate technical accuracy, engagement and consistency \
             from 0 to 10, one per line as `Name: score`, then list concrete fixes.",
            prompt_header(&state)
        );
        append_section(&mut prompt, &state, "chapters");

        let request = GenerationRequest::new(&self.name, prompt).with_system(SYSTEM_PROMPT);
        let text = self.generator.generate(request).await?;
        if text.trim().is_empty() {
            return Err(empty_output(&self.name));
        }

        let scores = parse_scores(&text);
        if scores.iter().all(Option::is_none) {
            state.push_warning(format!("{}: review contained no scores", self.name));
        }
        // A stale score from an earlier round must not outlive this review.
        for (key, score) in SCORE_KEYS.iter().zip(scores) {
            let value = score.map_or(serde_json::Value::Null, serde_json::Value::from);
            state.set(*key, value);
        }
        state.set(Self::NOTES_KEY, text);
        Ok(state)
    }
}

// ---------------------------------------------------------------------------
// ReviseStep
// ---------------------------------------------------------------------------

/// Rewrites `chapters` following the latest review notes.
pub struct ReviseStep {
    name: String,
    generator: Arc<dyn Generator>,
}

impl ReviseStep {
    pub fn new(name: impl Into<String>, generator: Arc<dyn Generator>) -> Self {
        Self {
            name: name.into(),
            generator,
        }
    }
}

#[async_trait]
impl StepHandler for ReviseStep {
    async fn execute(&self, mut state: SharedState) -> Result<SharedState> {
        let mut prompt = format!(
            "{}\nRevision round {}. Rewrite the chapters addressing every review note.",
            prompt_header(&state),
            state.revision_rounds
        );
        append_section(&mut prompt, &state, "chapters");
        append_section(&mut prompt, &state, ReviewStep::NOTES_KEY);

        let request = GenerationRequest::new(&self.name, prompt).with_system(SYSTEM_PROMPT);
        let text = self.generator.generate(request).await?;
        if text.trim().is_empty() {
            return Err(empty_output(&self.name));
        }
        state.set("chapters", text);
        Ok(state)
    }
}

// ---------------------------------------------------------------------------
// QualityCheckStep / FinalStep
// ---------------------------------------------------------------------------

/// Content keys a complete book is expected to have.
pub const CONTENT_KEYS: [&str; 6] = ["outline", "chapters", "enhancements", "glossary", "quiz", "proofread_notes"];

/// Summarises what the document contains into `quality_report`.
pub struct QualityCheckStep;

#[async_trait]
impl StepHandler for QualityCheckStep {
    async fn execute(&self, mut state: SharedState) -> Result<SharedState> {
        let (present, missing): (Vec<&str>, Vec<&str>) = CONTENT_KEYS
            .iter()
            .copied()
            .partition(|key| !state.get_str(key).is_empty());
        for key in &missing {
            state.push_warning(format!("quality: section '{key}' is missing"));
        }
        let report = serde_json::json!({
            "score": quality_score(&state),
            "revision_rounds": state.revision_rounds,
            "present": present,
            "missing": missing,
            "error_count": state.errors.len(),
        });
        state.set("quality_report", report);
        Ok(state)
    }
}

/// Compiles the available sections into `compiled_book` (markdown).
pub struct FinalStep;

impl FinalStep {
    pub const OUTPUT_KEY: &'static str = "compiled_book";

    pub fn compile(state: &SharedState) -> String {
        let mut book = format!("# {}\n", state.document_id);
        for (key, title) in [
            ("outline", "Outline"),
            ("chapters", "Chapters"),
            ("enhancements", "Further Reading"),
            ("glossary", "Glossary"),
            ("quiz", "Quiz"),
        ] {
            let text = state.get_str(key);
            if !text.is_empty() {
                book.push_str(&format!("\n## {title}\n\n{}\n", text.trim_end()));
            }
        }
        book
    }
}

#[async_trait]
impl StepHandler for FinalStep {
    async fn execute(&self, mut state: SharedState) -> Result<SharedState> {
        let book = Self::compile(&state);
        state.set(Self::OUTPUT_KEY, book);
        Ok(state)
    }
}

// ---------------------------------------------------------------------------
// DryRunGenerator
// ---------------------------------------------------------------------------

/// Offline generator producing deterministic placeholder text. Lets the whole
/// pipeline run without a model backend.
#[derive(Debug, Default, Clone)]
pub struct DryRunGenerator;

#[async_trait]
impl Generator for DryRunGenerator {
    async fn generate(&self, request: GenerationRequest) -> Result<String> {
        let topic = request
            .prompt
            .lines()
            .next()
            .and_then(|l| l.strip_prefix("Topic: "))
            .unwrap_or("untitled");
        let text = match request.step.as_str() {
            "reviewer" => "Technical accuracy: 9/10\nEngagement: 8.5\nConsistency: 9\n\
                           - Tighten the introduction."
                .to_string(),
            "outline" => format!("1. Introduction to {topic}\n2. Core concepts\n3. Practice"),
            step => format!("[{step}] placeholder content about {topic}."),
        };
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Returns a fixed reply and records every request.
    struct Recording {
        reply: String,
        requests: Mutex<Vec<GenerationRequest>>,
    }

    impl Recording {
        fn new(reply: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: reply.to_string(),
                requests: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Generator for Recording {
        async fn generate(&self, request: GenerationRequest) -> Result<String> {
            self.requests.lock().unwrap().push(request);
            Ok(self.reply.clone())
        }
    }

    #[tokio::test]
    async fn generative_step_reads_inputs_and_writes_output() {
        let generator = Recording::new("Chapter 1 ...");
        let step = GenerativeStep::new("chapter", "chapters", "Write the chapters.", generator.clone())
            .reads(["outline", "draft"]);

        let mut state = SharedState::new("Rust");
        state.set("outline", "1. Ownership");
        let out = step.execute(state).await.unwrap();

        assert_eq!(out.get_str("chapters"), "Chapter 1 ...");
        let requests = generator.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].step, "chapter");
        assert!(requests[0].prompt.starts_with("Topic: Rust"));
        assert!(requests[0].prompt.contains("1. Ownership"));
        assert!(!requests[0].prompt.contains("[draft]"));
    }

    #[tokio::test]
    async fn empty_generation_is_an_error() {
        let step = GenerativeStep::new("outline", "outline", "Outline it.", Recording::new("  \n"));
        let err = step.execute(SharedState::new("Rust")).await.unwrap_err();
        assert!(matches!(err, FolioError::StepFailed { .. }));
    }

    #[test]
    fn parse_scores_handles_scales_and_labels() {
        let scores = parse_scores("Technical Accuracy: 8/10\nengagement = 0.65\nConsistency score: 12");
        assert_eq!(scores[0], Some(0.8));
        assert_eq!(scores[1], Some(0.65));
        assert_eq!(scores[2], Some(1.0));
    }

    #[test]
    fn parse_scores_missing_values() {
        assert_eq!(parse_scores("Looks fine."), [None, None, None]);
        assert_eq!(parse_scores("Engagement: 7"), [None, Some(0.7), None]);
    }

    #[tokio::test]
    async fn review_overwrites_stale_scores() {
        let step = ReviewStep::new("reviewer", Recording::new("Engagement: 6\nMore examples please."));
        let mut state = SharedState::new("Rust");
        state.set("technical_accuracy_score", 0.1);

        let out = step.execute(state).await.unwrap();
        assert_eq!(out.get_f64("technical_accuracy_score"), None);
        assert_eq!(out.get_f64("engagement_score"), Some(0.6));
        assert!(out.get_str("review_notes").contains("More examples"));
        assert_eq!(quality_score(&out), Some(0.6));
    }

    #[tokio::test]
    async fn review_without_scores_warns() {
        let step = ReviewStep::new("reviewer", Recording::new("Nice."));
        let out = step.execute(SharedState::new("Rust")).await.unwrap();
        assert_eq!(out.warnings.len(), 1);
        assert_eq!(quality_score(&out), None);
    }

    #[tokio::test]
    async fn revise_rewrites_chapters_with_notes() {
        let generator = Recording::new("Better chapters");
        let step = ReviseStep::new("revise", generator.clone());
        let mut state = SharedState::new("Rust");
        state.set("chapters", "Old chapters");
        state.set("review_notes", "Add lifetimes");

        let out = step.execute(state).await.unwrap();
        assert_eq!(out.get_str("chapters"), "Better chapters");
        let prompt = &generator.requests.lock().unwrap()[0].prompt;
        assert!(prompt.contains("Old chapters"));
        assert!(prompt.contains("Add lifetimes"));
    }

    #[tokio::test]
    async fn quality_check_reports_missing_sections() {
        let mut state = SharedState::new("Rust");
        state.set("outline", "1. Intro");
        state.set("chapters", "text");
        let out = QualityCheckStep.execute(state).await.unwrap();

        let report = out.get("quality_report").unwrap();
        assert_eq!(report["present"], serde_json::json!(["outline", "chapters"]));
        assert_eq!(report["missing"].as_array().unwrap().len(), 4);
        assert_eq!(out.warnings.len(), 4);
    }

    #[tokio::test]
    async fn final_compiles_present_sections() {
        let mut state = SharedState::new("Rust");
        state.set("outline", "1. Intro");
        state.set("glossary", "borrow: a reference");
        let out = FinalStep.execute(state).await.unwrap();

        let book = out.get_str(FinalStep::OUTPUT_KEY);
        assert!(book.starts_with("# Rust\n"));
        assert!(book.contains("## Outline\n\n1. Intro"));
        assert!(book.contains("## Glossary"));
        assert!(!book.contains("## Quiz"));
    }

    #[tokio::test]
    async fn dry_run_review_passes_the_default_gate() {
        let text = DryRunGenerator
            .generate(GenerationRequest::new("reviewer", "Topic: Rust"))
            .await
            .unwrap();
        let scores = parse_scores(&text);
        let mean = scores.iter().flatten().sum::<f64>() / 3.0;
        assert!(mean >= 0.7);
    }

    #[tokio::test]
    async fn dry_run_mentions_topic() {
        let text = DryRunGenerator
            .generate(GenerationRequest::new("glossary", "Topic: Rust\nWrite a glossary."))
            .await
            .unwrap();
        assert_eq!(text, "[glossary] placeholder content about Rust.");
    }
}
