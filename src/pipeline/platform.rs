//! Platform agents.
//!
//! The platform set is closed, so agents are an enum rather than trait objects. Every
//! agent shares the same capability: build a prompt, call the language model at a fixed
//! temperature, tidy the raw output and validate it against the platform's contract.
//! Output that violates the contract is rejected as-is; it is never truncated or padded.

mod instagram;
mod linkedin;
mod twitter;
mod youtube_shorts;

use tracing::{debug, instrument};

use crate::clients::{CompletionRequest, LanguageModel};
use crate::pipeline::style::StylePatterns;
use crate::pipeline::validate::{ConstraintValidator, ValidationResult};
use crate::store::models::Platform;
use crate::util::error::PipelineError;
use crate::util::text::{split_paragraphs, strip_code_fences, truncate_chars};

/// 全プラットフォーム共通のサンプリング温度。
pub const GENERATION_TEMPERATURE: f32 = 0.7;

const SOURCE_EXCERPT_CHARS: usize = 6000;
const EXAMPLE_EXCERPT_CHARS: usize = 800;

/// Everything an agent needs to write one piece.
#[derive(Debug, Clone, Copy)]
pub struct GenerationInput<'a> {
    pub topics: &'a [String],
    pub style: &'a StylePatterns,
    pub source_text: &'a str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlatformAgent {
    LinkedIn,
    TwitterThread,
    Instagram,
    YouTubeShorts,
}

impl PlatformAgent {
    #[must_use]
    pub fn for_platform(platform: Platform) -> Self {
        match platform {
            Platform::LinkedIn => PlatformAgent::LinkedIn,
            Platform::Twitter => PlatformAgent::TwitterThread,
            Platform::Instagram => PlatformAgent::Instagram,
            Platform::YouTubeShorts => PlatformAgent::YouTubeShorts,
        }
    }

    #[must_use]
    pub fn platform(self) -> Platform {
        match self {
            PlatformAgent::LinkedIn => Platform::LinkedIn,
            PlatformAgent::TwitterThread => Platform::Twitter,
            PlatformAgent::Instagram => Platform::Instagram,
            PlatformAgent::YouTubeShorts => Platform::YouTubeShorts,
        }
    }

    fn format_rules(self) -> String {
        match self {
            PlatformAgent::LinkedIn => linkedin::format_rules(),
            PlatformAgent::TwitterThread => twitter::format_rules(),
            PlatformAgent::Instagram => instagram::format_rules(),
            PlatformAgent::YouTubeShorts => youtube_shorts::format_rules(),
        }
    }

    /// モデル出力の体裁だけを整える。内容の追加や削除はしない。
    fn tidy(self, raw: &str) -> String {
        let normalized = normalize_output(raw);
        match self {
            PlatformAgent::LinkedIn | PlatformAgent::Instagram => join_paragraphs(&normalized),
            PlatformAgent::TwitterThread => twitter::tidy(&normalized),
            PlatformAgent::YouTubeShorts => youtube_shorts::tidy(&normalized),
        }
    }

    /// プラットフォーム固有のプロンプトを組み立てる。
    #[must_use]
    pub fn build_prompt(self, input: &GenerationInput<'_>) -> String {
        let platform = self.platform().display_name();
        let noun = self.platform().prompt_noun();
        let characteristics = &input.style.characteristics;

        let mut prompt = format!(
            "You are ghostwriting {noun} for a creator. Write in their voice.\n\n\
             Voice:\n\
             - Sentences: {sentences}\n\
             - Vocabulary: {vocabulary}\n\
             - Tone: {tone}\n\
             - Emoji: {emoji}\n",
            sentences = characteristics.sentence_length.describe(),
            vocabulary = characteristics.vocabulary.as_str(),
            tone = characteristics.tone.as_str(),
            emoji = describe_emoji_rate(characteristics.emoji_rate),
        );

        if !input.style.examples.is_empty() {
            prompt.push_str("\nExamples of their writing:\n");
            for example in &input.style.examples {
                prompt.push_str("---\n");
                prompt.push_str(&truncate_chars(&example.text, EXAMPLE_EXCERPT_CHARS));
                prompt.push('\n');
            }
            prompt.push_str("---\n");
        }

        prompt.push_str(&format!(
            "\nTopics to cover: {topics}\n\n\
             Source material:\n{source}\n\n\
             Formatting rules:\n{rules}\n\n\
             Return only the {platform} text, with no commentary.",
            topics = input.topics.join(", "),
            source = truncate_chars(input.source_text, SOURCE_EXCERPT_CHARS),
            rules = self.format_rules(),
        ));
        prompt
    }

    /// 生成して検証する。制約違反は `ConstraintViolation` として返す。
    ///
    /// # Errors
    /// 言語モデルの失敗、または出力がプラットフォーム制約を満たさない場合。
    #[instrument(skip(self, model, input), fields(platform = %self.platform()))]
    pub async fn generate(
        self,
        model: &dyn LanguageModel,
        input: &GenerationInput<'_>,
        seed: u64,
        max_tokens: u32,
    ) -> Result<String, PipelineError> {
        let request = CompletionRequest {
            prompt: self.build_prompt(input),
            temperature: GENERATION_TEMPERATURE,
            max_tokens,
            seed: Some(seed),
        };
        let raw = model.complete(&request).await?;
        let content = self.tidy(&raw);

        let result = self.validate(&content);
        if !result.is_valid() {
            return Err(PipelineError::ConstraintViolation {
                platform: self.platform(),
                errors: result.errors,
            });
        }
        if !result.warnings.is_empty() {
            debug!(warnings = ?result.warnings, "generated content is near a platform limit");
        }
        Ok(content)
    }

    #[must_use]
    pub fn validate(self, content: &str) -> ValidationResult {
        ConstraintValidator::validate(self.platform(), content)
    }
}

fn describe_emoji_rate(rate: f32) -> String {
    if rate <= f32::EPSILON {
        "never uses emoji".to_string()
    } else {
        format!("about {rate:.1} emoji per 100 words")
    }
}

fn normalize_output(raw: &str) -> String {
    strip_code_fences(raw).replace("\r\n", "\n").trim().to_string()
}

fn join_paragraphs(text: &str) -> String {
    split_paragraphs(text).join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::style::{StyleExample, WritingCharacteristics};
    use crate::pipeline::validate::fixtures;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use uuid::Uuid;

    struct RecordingModel {
        response: String,
        requests: Mutex<Vec<CompletionRequest>>,
    }

    impl RecordingModel {
        fn new(response: String) -> Self {
            Self {
                response,
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl LanguageModel for RecordingModel {
        async fn complete(&self, request: &CompletionRequest) -> Result<String, PipelineError> {
            self.requests.lock().unwrap().push(request.clone());
            Ok(self.response.clone())
        }
    }

    fn style() -> StylePatterns {
        StylePatterns {
            examples: vec![StyleExample {
                exemplar_id: Uuid::nil(),
                text: "I shipped the thing. Then I wrote about it.".to_string(),
                score: 0.92,
            }],
            characteristics: WritingCharacteristics::default(),
        }
    }

    #[test]
    fn every_platform_has_an_agent() {
        for platform in Platform::ALL {
            assert_eq!(PlatformAgent::for_platform(platform).platform(), platform);
        }
    }

    #[test]
    fn prompt_combines_voice_topics_and_rules() {
        let topics = vec!["podcasting".to_string(), "reuse".to_string()];
        let style = style();
        let input = GenerationInput {
            topics: &topics,
            style: &style,
            source_text: "Long transcript text",
        };

        let prompt = PlatformAgent::TwitterThread.build_prompt(&input);
        assert!(prompt.starts_with("You are ghostwriting a Twitter thread for a creator."));
        assert!(prompt.contains("podcasting, reuse"));
        assert!(prompt.contains("I shipped the thing."));
        assert!(prompt.contains("Long transcript text"));
        assert!(prompt.contains("never uses emoji"));
        assert!(prompt.contains("280"));

        let prompt = PlatformAgent::Instagram.build_prompt(&input);
        assert!(prompt.starts_with("You are ghostwriting an Instagram caption for a creator."));
    }

    #[tokio::test]
    async fn generate_uses_fixed_temperature_and_seed() {
        let model = RecordingModel::new(format!("```\n{}\n```", fixtures::linkedin_post()));
        let style = style();
        let topics = vec!["reuse".to_string()];
        let input = GenerationInput {
            topics: &topics,
            style: &style,
            source_text: "source",
        };

        let text = PlatformAgent::LinkedIn
            .generate(&model, &input, 42, 800)
            .await
            .expect("fixture satisfies LinkedIn rules");

        assert_eq!(text, fixtures::linkedin_post());
        let requests = model.requests.lock().unwrap();
        assert_eq!(requests[0].temperature, GENERATION_TEMPERATURE);
        assert_eq!(requests[0].seed, Some(42));
        assert_eq!(requests[0].max_tokens, 800);
    }

    #[tokio::test]
    async fn violating_output_is_rejected_not_repaired() {
        let model = RecordingModel::new("Too short to be a LinkedIn post.".to_string());
        let style = style();
        let input = GenerationInput {
            topics: &[],
            style: &style,
            source_text: "source",
        };

        let error = PlatformAgent::LinkedIn
            .generate(&model, &input, 1, 800)
            .await
            .unwrap_err();

        match error {
            PipelineError::ConstraintViolation { platform, errors } => {
                assert_eq!(platform, Platform::LinkedIn);
                assert!(!errors.is_empty());
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
