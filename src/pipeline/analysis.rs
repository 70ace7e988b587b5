//! Topic extraction for the analysis stage.

use std::collections::HashSet;
use std::ops::RangeInclusive;
use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, instrument};

use crate::clients::{CompletionRequest, LanguageModel};
use crate::schema::language_model::TOPICS_RESPONSE_SCHEMA;
use crate::schema::validate_json;
use crate::util::error::PipelineError;
use crate::util::text::{count_words, extract_json_object, truncate_chars};

/// 解析成功時のトピック数。
pub const TOPIC_COUNT: RangeInclusive<usize> = 5..=15;

const SERVICE: &str = "topic-extractor";
const TOPIC_TEMPERATURE: f32 = 0.2;
const SOURCE_EXCERPT_CHARS: usize = 12_000;

#[derive(Debug, Deserialize)]
struct TopicsResponse {
    topics: Vec<String>,
}

pub struct TopicExtractor {
    model: Arc<dyn LanguageModel>,
    max_tokens: u32,
    min_words: usize,
}

impl TopicExtractor {
    #[must_use]
    pub fn new(model: Arc<dyn LanguageModel>, max_tokens: u32, min_words: usize) -> Self {
        Self {
            model,
            max_tokens,
            min_words,
        }
    }

    /// 語数が下限未満なら `InsufficientContent`。リトライはしない。
    ///
    /// # Errors
    /// テキストの語数が下限に満たない場合。
    pub fn check_length(&self, text: &str) -> Result<usize, PipelineError> {
        let words = count_words(text);
        if words < self.min_words {
            return Err(PipelineError::InsufficientContent {
                words,
                minimum: self.min_words,
            });
        }
        Ok(words)
    }

    /// Ask the model for topics and enforce the count contract.
    ///
    /// A malformed response or a topic count outside [`TOPIC_COUNT`] is reported as a
    /// transient failure of the extractor so the stage retry budget applies.
    ///
    /// # Errors
    /// 短すぎるテキスト、モデル呼び出しの失敗、または契約違反の応答。
    #[instrument(skip(self, text))]
    pub async fn extract(&self, text: &str, attempt: usize) -> Result<Vec<String>, PipelineError> {
        self.check_length(text)?;

        let request = CompletionRequest {
            prompt: build_prompt(text),
            temperature: TOPIC_TEMPERATURE,
            max_tokens: self.max_tokens,
            seed: None,
        };
        let raw = self.model.complete(&request).await?;
        let topics = parse_topics(&raw).map_err(|message| PipelineError::transient(SERVICE, message))?;

        if !TOPIC_COUNT.contains(&topics.len()) {
            return Err(PipelineError::transient(
                SERVICE,
                format!(
                    "returned {} topics (expected {}-{})",
                    topics.len(),
                    TOPIC_COUNT.start(),
                    TOPIC_COUNT.end()
                ),
            ));
        }

        debug!(attempt, topic_count = topics.len(), "topics extracted");
        Ok(topics)
    }
}

fn build_prompt(text: &str) -> String {
    format!(
        "Read the following content and list its key topics.\n\
         Return between {min} and {max} short topics (one to four words each), most important first.\n\
         Respond with JSON only: {{\"topics\": [\"...\"]}}\n\n\
         Content:\n{excerpt}",
        min = TOPIC_COUNT.start(),
        max = TOPIC_COUNT.end(),
        excerpt = truncate_chars(text, SOURCE_EXCERPT_CHARS),
    )
}

/// JSONを検証し、前後の空白や `#` を除いて大文字小文字を無視した重複を取り除く。
fn parse_topics(raw: &str) -> Result<Vec<String>, String> {
    let json = extract_json_object(raw).ok_or("response contains no JSON object")?;
    let value: serde_json::Value =
        serde_json::from_str(json).map_err(|e| format!("invalid JSON: {e}"))?;

    let validation = validate_json(&TOPICS_RESPONSE_SCHEMA, &value);
    if !validation.valid {
        return Err(format!("schema violation: {}", validation.errors.join("; ")));
    }

    let response: TopicsResponse =
        serde_json::from_value(value).map_err(|e| format!("unexpected shape: {e}"))?;

    let mut seen = HashSet::new();
    Ok(response
        .topics
        .into_iter()
        .map(|topic| {
            topic
                .trim()
                .trim_start_matches('#')
                .split_whitespace()
                .collect::<Vec<_>>()
                .join(" ")
        })
        .filter(|topic| !topic.is_empty() && seen.insert(topic.to_lowercase()))
        .collect())
}
