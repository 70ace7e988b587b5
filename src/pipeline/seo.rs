//! SEO metadata: titles, hashtags and alt text for a generated piece.
//!
//! Each field is produced independently. A field that cannot be produced is left
//! absent and never blocks the others.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use unicode_normalization::UnicodeNormalization;
use unicode_segmentation::UnicodeSegmentation;

use crate::clients::{CompletionRequest, LanguageModel};
use crate::schema::language_model::TITLES_RESPONSE_SCHEMA;
use crate::schema::validate_json;
use crate::store::models::Platform;
use crate::util::error::PipelineError;
use crate::util::text::{extract_json_object, truncate_chars};

pub const TITLE_COUNT: usize = 5;
pub const MIN_HASHTAGS: usize = 4;
pub const MAX_HASHTAGS: usize = 8;
pub const ALT_TEXT_MAX_CHARS: usize = 125;

const TITLE_TEMPERATURE: f32 = 0.7;
const CONTENT_EXCERPT_CHARS: usize = 1500;
const MIN_KEYWORD_CHARS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TitleApproach {
    Curiosity,
    Benefit,
    Listicle,
    Question,
    Statement,
}

impl TitleApproach {
    pub const ALL: [TitleApproach; 5] = [
        TitleApproach::Curiosity,
        TitleApproach::Benefit,
        TitleApproach::Listicle,
        TitleApproach::Question,
        TitleApproach::Statement,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            TitleApproach::Curiosity => "curiosity",
            TitleApproach::Benefit => "benefit",
            TitleApproach::Listicle => "listicle",
            TitleApproach::Question => "question",
            TitleApproach::Statement => "statement",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeoTitle {
    pub approach: TitleApproach,
    pub title: String,
}

/// 生成物に付与するSEOメタデータ。生成できなかった項目は `None`。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeoMetadata {
    pub titles: Option<Vec<SeoTitle>>,
    pub hashtags: Option<Vec<String>>,
    pub alt_text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TitlesResponse {
    titles: Vec<SeoTitle>,
}

static STOPWORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "about", "after", "again", "being", "because", "before", "could", "every", "first",
        "their", "there", "these", "thing", "things", "those", "through", "today", "under",
        "until", "where", "which", "while", "would", "should", "really", "still", "other",
        "great", "never", "always", "people", "maybe", "without", "within", "something",
    ]
    .into_iter()
    .collect()
});

/// Instagram向けに不足分を補うエンゲージメントタグ。
const INSTAGRAM_BOOSTERS: &[&str] = &[
    "#ContentCreator",
    "#CreatorTips",
    "#BehindTheScenes",
    "#InstaDaily",
];

struct HashtagPolicy {
    count: usize,
    max_token_chars: usize,
}

fn hashtag_policy(platform: Platform) -> HashtagPolicy {
    match platform {
        Platform::Twitter => HashtagPolicy {
            count: 4,
            max_token_chars: 15,
        },
        Platform::Instagram => HashtagPolicy {
            count: MAX_HASHTAGS,
            max_token_chars: 30,
        },
        Platform::LinkedIn | Platform::YouTubeShorts => HashtagPolicy {
            count: 5,
            max_token_chars: 30,
        },
    }
}

/// 任意の文字列を `#CamelCase` 形式のタグにする。NFKC正規化後、英数字以外は区切りとして扱う。
fn to_hashtag(phrase: &str) -> Option<String> {
    let normalized: String = phrase.nfkc().collect();
    let token: String = normalized
        .split(|c: char| !c.is_alphanumeric())
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            chars.next().map_or_else(String::new, |first| {
                first.to_uppercase().chain(chars).collect::<String>()
            })
        })
        .collect();

    (!token.is_empty()).then(|| format!("#{token}"))
}

fn content_keywords(content: &str) -> Vec<String> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for word in content.unicode_words() {
        let word = word.to_lowercase();
        if word.chars().count() < MIN_KEYWORD_CHARS
            || !word.chars().all(char::is_alphabetic)
            || STOPWORDS.contains(word.as_str())
        {
            continue;
        }
        *counts.entry(word).or_insert(0) += 1;
    }

    let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.into_iter().map(|(word, _)| word).collect()
}

/// トピックと本文のキーワードからハッシュタグを選ぶ。最低数に届かない場合は `None`。
#[must_use]
pub fn derive_hashtags(platform: Platform, topics: &[String], content: &str) -> Option<Vec<String>> {
    let policy = hashtag_policy(platform);
    let mut seen = HashSet::new();
    let mut tags = Vec::with_capacity(policy.count);

    let mut push = |tag: String, tags: &mut Vec<String>| {
        if tags.len() < policy.count
            && tag.chars().count() - 1 <= policy.max_token_chars
            && seen.insert(tag.to_lowercase())
        {
            tags.push(tag);
        }
    };

    if platform == Platform::YouTubeShorts {
        push("#Shorts".to_string(), &mut tags);
    }

    let topic_limit = match platform {
        Platform::Instagram => policy.count - INSTAGRAM_BOOSTERS.len() / 2,
        _ => policy.count,
    };
    for tag in topics.iter().filter_map(|topic| to_hashtag(topic)) {
        if tags.len() >= topic_limit {
            break;
        }
        push(tag, &mut tags);
    }
    for tag in content_keywords(content).iter().filter_map(|word| to_hashtag(word)) {
        if tags.len() >= topic_limit {
            break;
        }
        push(tag, &mut tags);
    }
    if platform == Platform::Instagram {
        for booster in INSTAGRAM_BOOSTERS {
            push((*booster).to_string(), &mut tags);
        }
    }

    if tags.len() < MIN_HASHTAGS {
        debug!(%platform, candidates = tags.len(), "not enough hashtag candidates");
        return None;
    }
    Some(tags)
}

/// 画像説明から125文字以内の代替テキストを作る。
#[must_use]
pub fn derive_alt_text(image_description: Option<&str>) -> Option<String> {
    let collapsed = image_description?
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    if collapsed.is_empty() {
        return None;
    }
    Some(truncate_chars(&collapsed, ALT_TEXT_MAX_CHARS))
}

/// モデル応答を検証し、5種類のアプローチが1つずつ揃っている場合のみ返す。
fn parse_titles(raw: &str) -> Result<Vec<SeoTitle>, String> {
    let json = extract_json_object(raw).ok_or("response contains no JSON object")?;
    let value: serde_json::Value =
        serde_json::from_str(json).map_err(|e| format!("invalid JSON: {e}"))?;

    let validation = validate_json(&TITLES_RESPONSE_SCHEMA, &value);
    if !validation.valid {
        return Err(validation.errors.join("; "));
    }

    let response: TitlesResponse =
        serde_json::from_value(value).map_err(|e| format!("unexpected shape: {e}"))?;
    let mut titles: Vec<SeoTitle> = response
        .titles
        .into_iter()
        .map(|t| SeoTitle {
            approach: t.approach,
            title: t.title.trim().to_string(),
        })
        .collect();
    titles.sort_by_key(|t| t.approach);

    let approaches: Vec<TitleApproach> = titles.iter().map(|t| t.approach).collect();
    if approaches != TitleApproach::ALL {
        return Err("titles must cover each approach exactly once".to_string());
    }
    let distinct: HashSet<String> = titles.iter().map(|t| t.title.to_lowercase()).collect();
    if distinct.len() != TITLE_COUNT || titles.iter().any(|t| t.title.is_empty()) {
        return Err("titles must be non-empty and distinct".to_string());
    }

    Ok(titles)
}

fn build_titles_prompt(platform: Platform, content: &str, topics: &[String]) -> String {
    format!(
        "You write search-friendly titles for a {platform} post.\n\
         Topics: {topics}\n\n\
         Post:\n{excerpt}\n\n\
         Return JSON only, in the form \
         {{\"titles\": [{{\"approach\": \"...\", \"title\": \"...\"}}]}}, with exactly five titles, \
         one for each approach: curiosity, benefit, listicle, question, statement. \
         Titles must be distinct and under 100 characters.",
        platform = platform.display_name(),
        topics = topics.join(", "),
        excerpt = truncate_chars(content, CONTENT_EXCERPT_CHARS),
    )
}

pub struct SeoAnnotator {
    model: Arc<dyn LanguageModel>,
    max_tokens: u32,
}

impl SeoAnnotator {
    #[must_use]
    pub fn new(model: Arc<dyn LanguageModel>, max_tokens: u32) -> Self {
        Self { model, max_tokens }
    }

    /// Titles come from the model; hashtags and alt text are derived locally.
    pub async fn annotate(
        &self,
        platform: Platform,
        content: &str,
        topics: &[String],
        image_description: Option<&str>,
        seed: u64,
    ) -> SeoMetadata {
        let titles = match self.generate_titles(platform, content, topics, seed).await {
            Ok(titles) => Some(titles),
            Err(e) => {
                warn!(%platform, error = %e, "title generation failed; leaving titles absent");
                None
            }
        };

        SeoMetadata {
            titles,
            hashtags: derive_hashtags(platform, topics, content),
            alt_text: derive_alt_text(image_description),
        }
    }

    async fn generate_titles(
        &self,
        platform: Platform,
        content: &str,
        topics: &[String],
        seed: u64,
    ) -> Result<Vec<SeoTitle>, PipelineError> {
        let request = CompletionRequest {
            prompt: build_titles_prompt(platform, content, topics),
            temperature: TITLE_TEMPERATURE,
            max_tokens: self.max_tokens,
            seed: Some(seed),
        };
        let raw = self.model.complete(&request).await?;
        parse_titles(&raw).map_err(|e| PipelineError::Validation(format!("titles: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rstest::rstest;

    struct FixedModel(Result<String, ()>);

    #[async_trait]
    impl LanguageModel for FixedModel {
        async fn complete(&self, _request: &CompletionRequest) -> Result<String, PipelineError> {
            self.0
                .clone()
                .map_err(|()| PipelineError::transient("language-model", "down"))
        }
    }

    const VALID_TITLES: &str = r#"Here you go:
```json
{"titles": [
  {"approach": "statement", "title": "Repurposing Is a Workflow"},
  {"approach": "curiosity", "title": "The Hidden Week Inside Every Podcast"},
  {"approach": "question", "title": "Why Post Once When You Can Post Ten Times?"},
  {"approach": "benefit", "title": "Save Hours by Reusing Your Recordings"},
  {"approach": "listicle", "title": "5 Steps to Turn One Episode Into a Week"}
]}
```"#;

    fn topics() -> Vec<String> {
        vec![
            "content repurposing".to_string(),
            "podcasting".to_string(),
            "creator economy".to_string(),
            "AI".to_string(),
            "workflow design".to_string(),
        ]
    }

    #[test]
    fn parses_titles_in_approach_order() {
        let titles = parse_titles(VALID_TITLES).unwrap();
        let approaches: Vec<_> = titles.iter().map(|t| t.approach).collect();
        assert_eq!(approaches, TitleApproach::ALL);
    }

    #[test]
    fn rejects_duplicate_approach() {
        let raw = VALID_TITLES.replace("\"statement\"", "\"question\"");
        assert!(parse_titles(&raw).is_err());
    }

    #[test]
    fn rejects_identical_titles() {
        let raw = VALID_TITLES.replace("Repurposing Is a Workflow", "Save Hours by Reusing Your Recordings");
        assert!(parse_titles(&raw).is_err());
    }

    #[rstest]
    #[case(Platform::Twitter, 4)]
    #[case(Platform::Instagram, 8)]
    #[case(Platform::LinkedIn, 5)]
    #[case(Platform::YouTubeShorts, 5)]
    fn hashtag_counts_per_platform(#[case] platform: Platform, #[case] expected: usize) {
        let content = "Repurposing recordings saves creators hours. Recordings become posts, \
                       clips and threads. Creators reuse recordings weekly.";
        let tags = derive_hashtags(platform, &topics(), content).expect("enough candidates");
        assert_eq!(tags.len(), expected);
        assert!(tags.iter().all(|t| t.starts_with('#') && !t.contains(char::is_whitespace)));
    }

    #[test]
    fn twitter_prefers_short_tags() {
        let tags = derive_hashtags(Platform::Twitter, &topics(), "Recordings recordings creators").unwrap();
        assert!(tags.iter().all(|t| t.chars().count() <= 16));
        assert!(!tags.contains(&"#ContentRepurposing".to_string()));
    }

    #[test]
    fn hashtags_are_normalized_and_deduplicated() {
        let topics = vec![
            "Ｒｕｓｔ".to_string(),
            "rust".to_string(),
            "async runtime".to_string(),
            "type safety".to_string(),
            "zero-cost abstractions".to_string(),
        ];
        let tags = derive_hashtags(Platform::LinkedIn, &topics, "").unwrap();
        assert_eq!(tags[0], "#Rust");
        assert_eq!(tags.iter().filter(|t| t.eq_ignore_ascii_case("#rust")).count(), 1);
        assert!(tags.contains(&"#ZeroCostAbstractions".to_string()));
    }

    #[test]
    fn too_few_candidates_leaves_hashtags_absent() {
        assert_eq!(derive_hashtags(Platform::LinkedIn, &["one".to_string()], "tiny"), None);
    }

    #[test]
    fn alt_text_is_bounded_and_optional() {
        assert_eq!(derive_alt_text(None), None);
        assert_eq!(derive_alt_text(Some("   ")), None);

        let long = "A creator at a desk with two microphones ".repeat(10);
        let alt = derive_alt_text(Some(&long)).unwrap();
        assert!(alt.chars().count() <= ALT_TEXT_MAX_CHARS);
        assert!(alt.starts_with("A creator at a desk"));
    }

    #[tokio::test]
    async fn annotate_keeps_other_fields_when_titles_fail() {
        let annotator = SeoAnnotator::new(Arc::new(FixedModel(Err(()))), 256);
        let seo = annotator
            .annotate(Platform::Instagram, "Recordings become posts", &topics(), Some("A desk"), 1)
            .await;

        assert_eq!(seo.titles, None);
        assert_eq!(seo.hashtags.map(|t| t.len()), Some(MAX_HASHTAGS));
        assert_eq!(seo.alt_text.as_deref(), Some("A desk"));
    }

    #[tokio::test]
    async fn annotate_returns_five_distinct_titles() {
        let annotator = SeoAnnotator::new(Arc::new(FixedModel(Ok(VALID_TITLES.to_string()))), 256);
        let seo = annotator
            .annotate(Platform::LinkedIn, "Recordings become posts", &topics(), None, 1)
            .await;

        let titles = seo.titles.expect("titles present");
        assert_eq!(titles.len(), TITLE_COUNT);
        assert_eq!(seo.alt_text, None);
    }
}
