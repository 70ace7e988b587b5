//! Style retrieval: nearest exemplars for a user and the writing characteristics derived from them.
//!
//! Characteristics are computed per exemplar at ingestion time and aggregated at retrieval
//! time. Aggregation is order-independent so the same neighbour set always yields the same
//! patterns regardless of the order the vector index returns it in.

pub mod cache;

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::clients::VectorSearch;
use crate::observability::metrics::Metrics;
use crate::util::error::PipelineError;
use crate::util::text::{count_emoji, split_sentences};

pub use cache::StyleCache;

/// 取得する近傍エグザンプラの数。
pub const STYLE_TOP_K: usize = 3;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SentenceLength {
    Short,
    #[default]
    Medium,
    Long,
}

impl SentenceLength {
    #[must_use]
    pub fn describe(self) -> &'static str {
        match self {
            SentenceLength::Short => "short, punchy sentences (under 12 words)",
            SentenceLength::Medium => "medium-length sentences (12 to 20 words)",
            SentenceLength::Long => "long, flowing sentences (over 20 words)",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VocabularyRegister {
    #[default]
    Conversational,
    Casual,
    Professional,
    Technical,
}

impl VocabularyRegister {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            VocabularyRegister::Conversational => "conversational",
            VocabularyRegister::Casual => "casual",
            VocabularyRegister::Professional => "professional",
            VocabularyRegister::Technical => "technical",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToneLabel {
    #[default]
    Neutral,
    Enthusiastic,
    Inquisitive,
    Reflective,
    Authoritative,
}

impl ToneLabel {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ToneLabel::Neutral => "neutral",
            ToneLabel::Enthusiastic => "enthusiastic",
            ToneLabel::Inquisitive => "inquisitive",
            ToneLabel::Reflective => "reflective",
            ToneLabel::Authoritative => "authoritative",
        }
    }
}

/// 1つのエグザンプラから導出した文体特徴。
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ExemplarCharacteristics {
    pub sentence_length: SentenceLength,
    pub vocabulary: VocabularyRegister,
    pub uses_emoji: bool,
    /// 100語あたりの絵文字数
    pub emoji_rate: f32,
    pub tone: ToneLabel,
}

static CONTRACTION_SUFFIXES: &[&str] = &["'s", "'re", "'ve", "'ll", "'d", "'m", "n't"];

static AUTHORITATIVE_MARKERS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "must", "should", "always", "never", "proven", "essential", "critical", "key",
        "clearly", "required",
    ]
    .into_iter()
    .collect()
});

static REFLECTIVE_MARKERS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "i", "my", "me", "learned", "realized", "remember", "felt", "looking", "journey",
        "lesson",
    ]
    .into_iter()
    .collect()
});

const LONG_WORD_CHARS: usize = 9;

impl ExemplarCharacteristics {
    /// テキストから文体特徴を決定的に導出する。
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn analyze(text: &str) -> Self {
        use unicode_segmentation::UnicodeSegmentation;

        let words: Vec<String> = text
            .unicode_words()
            .map(|word| word.replace('\u{2019}', "'").to_lowercase())
            .collect();
        if words.is_empty() {
            return Self::default();
        }

        let word_count = words.len() as f32;
        let sentences = split_sentences(text);
        let sentence_count = sentences.len().max(1) as f32;

        let avg_sentence_words = word_count / sentence_count;
        let sentence_length = if avg_sentence_words < 12.0 {
            SentenceLength::Short
        } else if avg_sentence_words <= 20.0 {
            SentenceLength::Medium
        } else {
            SentenceLength::Long
        };

        let letters: usize = words.iter().map(|word| word.chars().count()).sum();
        let avg_word_chars = letters as f32 / word_count;
        let long_ratio = words
            .iter()
            .filter(|word| word.chars().count() >= LONG_WORD_CHARS)
            .count() as f32
            / word_count;
        let has_contractions = words
            .iter()
            .any(|word| CONTRACTION_SUFFIXES.iter().any(|suffix| word.ends_with(suffix)));
        let vocabulary = if long_ratio >= 0.2 {
            VocabularyRegister::Technical
        } else if avg_word_chars >= 5.2 {
            VocabularyRegister::Professional
        } else if has_contractions {
            VocabularyRegister::Casual
        } else {
            VocabularyRegister::Conversational
        };

        let emoji = count_emoji(text);
        let emoji_rate = emoji as f32 * 100.0 / word_count;

        let exclamations = sentences.iter().filter(|s| s.trim_end().ends_with('!')).count() as f32;
        let questions = sentences.iter().filter(|s| s.trim_end().ends_with('?')).count() as f32;
        let per_hundred = |markers: &HashSet<&str>| {
            words
                .iter()
                .filter(|word| markers.contains(word.as_str()))
                .count() as f32
                * 100.0
                / word_count
        };

        let tone = if exclamations / sentence_count >= 0.2 {
            ToneLabel::Enthusiastic
        } else if questions / sentence_count >= 0.2 {
            ToneLabel::Inquisitive
        } else if per_hundred(&AUTHORITATIVE_MARKERS) >= 2.0 {
            ToneLabel::Authoritative
        } else if per_hundred(&REFLECTIVE_MARKERS) >= 3.0 {
            ToneLabel::Reflective
        } else {
            ToneLabel::Neutral
        };

        Self {
            sentence_length,
            vocabulary,
            uses_emoji: emoji > 0,
            emoji_rate,
            tone,
        }
    }
}

/// Aggregate voice across the retrieved exemplars.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct WritingCharacteristics {
    pub sentence_length: SentenceLength,
    pub vocabulary: VocabularyRegister,
    pub emoji_rate: f32,
    pub tone: ToneLabel,
}

/// 最頻値。同数の場合は順序の小さい方を選ぶため、入力順に依存しない。
fn dominant<T: Ord + Copy + Default>(values: impl Iterator<Item = T>) -> T {
    let mut counts: BTreeMap<T, usize> = BTreeMap::new();
    for value in values {
        *counts.entry(value).or_insert(0) += 1;
    }

    let mut best: Option<(T, usize)> = None;
    for (value, count) in counts {
        if best.is_none_or(|(_, best_count)| count > best_count) {
            best = Some((value, count));
        }
    }
    best.map(|(value, _)| value).unwrap_or_default()
}

impl WritingCharacteristics {
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn aggregate(exemplars: &[ExemplarCharacteristics]) -> Self {
        if exemplars.is_empty() {
            return Self::default();
        }

        let mut rates: Vec<f32> = exemplars.iter().map(|c| c.emoji_rate).collect();
        rates.sort_by(f32::total_cmp);
        let emoji_rate = rates.iter().sum::<f32>() / rates.len() as f32;

        Self {
            sentence_length: dominant(exemplars.iter().map(|c| c.sentence_length)),
            vocabulary: dominant(exemplars.iter().map(|c| c.vocabulary)),
            emoji_rate,
            tone: dominant(exemplars.iter().map(|c| c.tone)),
        }
    }
}

/// A retrieved exemplar as it is injected into prompts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StyleExample {
    pub exemplar_id: Uuid,
    pub text: String,
    pub score: f32,
}

/// 生成時に注入するスタイル情報。生成物と一緒にスナップショットとして保存される。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StylePatterns {
    pub examples: Vec<StyleExample>,
    pub characteristics: WritingCharacteristics,
}

pub struct StyleRetriever {
    search: Arc<dyn VectorSearch>,
    cache: StyleCache,
    metrics: Arc<Metrics>,
}

impl StyleRetriever {
    #[must_use]
    pub fn new(search: Arc<dyn VectorSearch>, cache: StyleCache, metrics: Arc<Metrics>) -> Self {
        Self {
            search,
            cache,
            metrics,
        }
    }

    /// ユーザーの近傍エグザンプラを取得し、文体特徴を集約する。
    ///
    /// # Errors
    /// ベクトル検索が失敗した場合。
    #[instrument(skip(self, embedding), fields(dimensions = embedding.len()))]
    pub async fn retrieve(
        &self,
        user_id: Uuid,
        embedding: &[f32],
    ) -> Result<StylePatterns, PipelineError> {
        if let Some(patterns) = self.cache.get(user_id, embedding).await {
            self.metrics.style_cache_hits.inc();
            debug!(%user_id, "style cache hit");
            return Ok(patterns);
        }
        self.metrics.style_cache_misses.inc();

        let mut matches = self.search.query(user_id, embedding, STYLE_TOP_K).await?;
        matches.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then(a.exemplar_id.cmp(&b.exemplar_id))
        });
        matches.truncate(STYLE_TOP_K);

        let characteristics = WritingCharacteristics::aggregate(
            &matches
                .iter()
                .map(|m| m.metadata.characteristics)
                .collect::<Vec<_>>(),
        );
        let patterns = StylePatterns {
            examples: matches
                .into_iter()
                .map(|m| StyleExample {
                    exemplar_id: m.exemplar_id,
                    text: m.metadata.text,
                    score: m.score,
                })
                .collect(),
            characteristics,
        };

        debug!(%user_id, examples = patterns.examples.len(), "style patterns retrieved");
        self.cache.insert(user_id, embedding, patterns.clone()).await;
        Ok(patterns)
    }

    pub async fn invalidate_user(&self, user_id: Uuid) {
        let dropped = self.cache.invalidate_user(user_id).await;
        debug!(%user_id, dropped, "style cache invalidated");
    }
}
