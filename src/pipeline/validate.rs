//! プラットフォーム制約の検証。
//!
//! 生成直後のチェックと、手動編集のレビューの両方で使う純粋関数群。
//! エラーは公開を止め、警告は止めない。

use std::ops::RangeInclusive;

use aho_corasick::{AhoCorasick, AhoCorasickBuilder, MatchKind};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use crate::store::models::Platform;
use crate::util::text::{count_chars, count_emoji, count_words, split_paragraphs};

pub const LINKEDIN_WORDS: RangeInclusive<usize> = 150..=250;
pub const LINKEDIN_HOOK_MAX_WORDS: usize = 40;
pub const TWEET_COUNT: RangeInclusive<usize> = 5..=7;
pub const TWEET_MAX_CHARS: usize = 280;
pub const TWEET_WARN_CHARS: usize = 270;
pub const INSTAGRAM_WORDS: RangeInclusive<usize> = 100..=150;
pub const INSTAGRAM_MIN_PARAGRAPHS: usize = 3;
pub const SHORTS_SECS: RangeInclusive<u32> = 30..=60;

const WORD_WARN_MARGIN: usize = 10;
const SECONDS_WARN_MARGIN: u32 = 3;

/// Phrases that count as a call to action in the closing tweet.
pub const CTA_PHRASES: &[&str] = &[
    "follow",
    "share",
    "retweet",
    "reply",
    "comment",
    "subscribe",
    "bookmark",
    "sign up",
    "join",
    "link",
    "read more",
    "check out",
    "let me know",
    "tell me",
];

static CTA_MATCHER: Lazy<AhoCorasick> = Lazy::new(|| {
    AhoCorasickBuilder::new()
        .match_kind(MatchKind::LeftmostLongest)
        .ascii_case_insensitive(true)
        .build(CTA_PHRASES)
        .expect("compile CTA patterns")
});

pub(crate) static TWEET_NUMBER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+)/").expect("compile tweet number pattern"));

static SEGMENT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\[(\d{1,2}):([0-5]\d)\s*-\s*(\d{1,2}):([0-5]\d)\]\s*(.*)$")
        .expect("compile segment pattern")
});

static VISUAL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\[VISUAL:\s*([^\]]*?)\s*\]\s*$").expect("compile visual cue pattern")
});

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationResult {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }
}

/// One post in a thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tweet {
    pub number: Option<usize>,
    pub text: String,
}

/// 空行区切りのスレッドを分解する。番号は `n/` 接頭辞から読む。
#[must_use]
pub fn parse_thread(content: &str) -> Vec<Tweet> {
    split_paragraphs(content)
        .into_iter()
        .map(|text| {
            let number = TWEET_NUMBER_RE
                .captures(&text)
                .and_then(|caps| caps.get(1))
                .and_then(|m| m.as_str().parse().ok());
            Tweet { number, text }
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptSegment {
    pub start_secs: u32,
    pub end_secs: u32,
    pub narration: String,
    pub visual_cue: Option<String>,
}

/// `[MM:SS-MM:SS] narration [VISUAL: cue]` 形式の台本を読む。
///
/// # Errors
/// 形式に合わない行があれば、その行番号を含むメッセージを返す。
pub fn parse_script(content: &str) -> Result<Vec<ScriptSegment>, String> {
    let mut segments = Vec::new();

    for (idx, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let caps = SEGMENT_RE
            .captures(line)
            .ok_or_else(|| format!("line {} is not a [MM:SS-MM:SS] segment", idx + 1))?;

        let field = |i: usize| -> u32 {
            caps.get(i)
                .and_then(|m| m.as_str().parse().ok())
                .unwrap_or_default()
        };
        let start_secs = field(1) * 60 + field(2);
        let end_secs = field(3) * 60 + field(4);
        let rest = caps.get(5).map_or("", |m| m.as_str());

        let (narration, visual_cue) = match VISUAL_RE.captures(rest) {
            Some(visual) => {
                let cue = visual.get(1).map_or("", |m| m.as_str()).trim().to_string();
                let narration_end = visual.get(0).map_or(rest.len(), |m| m.start());
                (
                    rest[..narration_end].trim().to_string(),
                    (!cue.is_empty()).then_some(cue),
                )
            }
            None => (rest.trim().to_string(), None),
        };

        segments.push(ScriptSegment {
            start_secs,
            end_secs,
            narration,
            visual_cue,
        });
    }

    Ok(segments)
}

fn check_word_range(
    result: &mut ValidationResult,
    words: usize,
    range: &RangeInclusive<usize>,
    label: &str,
) {
    if !range.contains(&words) {
        result.error(format!(
            "{label} has {words} words (expected {}-{})",
            range.start(),
            range.end()
        ));
    } else if words < range.start() + WORD_WARN_MARGIN || words + WORD_WARN_MARGIN > *range.end() {
        result.warn(format!(
            "{label} has {words} words, close to the {}-{} limit",
            range.start(),
            range.end()
        ));
    }
}

fn validate_linkedin(content: &str, result: &mut ValidationResult) {
    check_word_range(result, count_words(content), &LINKEDIN_WORDS, "post");

    let paragraphs = split_paragraphs(content);
    match paragraphs.first() {
        Some(hook) if count_words(hook) <= LINKEDIN_HOOK_MAX_WORDS => {}
        _ => result.error(format!(
            "missing hook: the first paragraph must be at most {LINKEDIN_HOOK_MAX_WORDS} words"
        )),
    }
    let has_prompt = paragraphs.len() >= 2 && paragraphs.last().is_some_and(|p| p.contains('?'));
    if !has_prompt {
        result.error("missing discussion prompt: the closing paragraph must ask a question");
    }
}

fn validate_twitter(content: &str, result: &mut ValidationResult) {
    let tweets = parse_thread(content);

    if !TWEET_COUNT.contains(&tweets.len()) {
        result.error(format!(
            "thread has {} tweets (expected {}-{})",
            tweets.len(),
            TWEET_COUNT.start(),
            TWEET_COUNT.end()
        ));
    }

    for (idx, tweet) in tweets.iter().enumerate() {
        let position = idx + 1;
        let chars = count_chars(&tweet.text);
        if chars > TWEET_MAX_CHARS {
            result.error(format!(
                "tweet {position} has {chars} characters (max {TWEET_MAX_CHARS})"
            ));
        } else if chars >= TWEET_WARN_CHARS {
            result.warn(format!("tweet {position} has {chars} characters"));
        }
        if tweet.number != Some(position) {
            result.error(format!("tweet {position} is not numbered {position}/"));
        }
    }

    if tweets.first().is_none_or(|first| first.number != Some(1)) {
        result.error("missing numbered hook: the thread must open with 1/");
    }
    if tweets
        .last()
        .is_none_or(|last| !CTA_MATCHER.is_match(&last.text))
    {
        result.error("missing call to action in the final tweet");
    }
}

fn validate_instagram(content: &str, result: &mut ValidationResult) {
    check_word_range(result, count_words(content), &INSTAGRAM_WORDS, "caption");

    if count_emoji(content) == 0 {
        result.error("caption must contain at least one emoji");
    }
    let paragraphs = split_paragraphs(content).len();
    if paragraphs < INSTAGRAM_MIN_PARAGRAPHS {
        result.error(format!(
            "missing story arc: {paragraphs} paragraphs (expected at least {INSTAGRAM_MIN_PARAGRAPHS})"
        ));
    }
}

fn validate_youtube_shorts(content: &str, result: &mut ValidationResult) {
    let segments = match parse_script(content) {
        Ok(segments) => segments,
        Err(message) => {
            result.error(message);
            return;
        }
    };
    let (Some(first), Some(last)) = (segments.first(), segments.last()) else {
        result.error("script has no segments");
        return;
    };

    for (idx, segment) in segments.iter().enumerate() {
        let position = idx + 1;
        if segment.end_secs <= segment.start_secs {
            result.error(format!("segment {position} ends before it starts"));
        }
        if segment.visual_cue.is_none() {
            result.error(format!("segment {position} has no visual cue"));
        }
        if segment.narration.is_empty() {
            result.error(format!("segment {position} has no narration"));
        }
        if idx > 0 && segments[idx - 1].end_secs != segment.start_secs {
            result.error(format!(
                "segment {position} does not start where segment {idx} ends"
            ));
        }
    }

    let total = last.end_secs.saturating_sub(first.start_secs);
    if !SHORTS_SECS.contains(&total) {
        result.error(format!(
            "script runs {total}s (expected {}-{}s)",
            SHORTS_SECS.start(),
            SHORTS_SECS.end()
        ));
    } else if total < SHORTS_SECS.start() + SECONDS_WARN_MARGIN
        || total + SECONDS_WARN_MARGIN > *SHORTS_SECS.end()
    {
        result.warn(format!("script runs {total}s, close to the duration limit"));
    }
}

/// Stateless platform constraint checks.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConstraintValidator;

impl ConstraintValidator {
    #[must_use]
    pub fn validate(platform: Platform, content: &str) -> ValidationResult {
        let mut result = ValidationResult::default();
        if content.trim().is_empty() {
            result.error("content is empty");
            return result;
        }

        match platform {
            Platform::LinkedIn => validate_linkedin(content, &mut result),
            Platform::Twitter => validate_twitter(content, &mut result),
            Platform::Instagram => validate_instagram(content, &mut result),
            Platform::YouTubeShorts => validate_youtube_shorts(content, &mut result),
        }
        result
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(Platform::LinkedIn, linkedin_post())]
    #[case(Platform::Twitter, twitter_thread())]
    #[case(Platform::Instagram, instagram_caption())]
    #[case(Platform::YouTubeShorts, youtube_script())]
    fn fixtures_pass_their_platform(#[case] platform: Platform, #[case] content: String) {
        let result = ConstraintValidator::validate(platform, &content);
        assert!(result.is_valid(), "{platform}: {:?}", result.errors);
    }

    #[test]
    fn linkedin_fixture_is_within_word_bounds() {
        let words = count_words(&linkedin_post());
        assert!(LINKEDIN_WORDS.contains(&words), "{words} words");
    }

    #[test]
    fn instagram_fixture_is_within_word_bounds() {
        let words = count_words(&instagram_caption());
        assert!(INSTAGRAM_WORDS.contains(&words), "{words} words");
    }

    #[test]
    fn empty_content_is_rejected() {
        let result = ConstraintValidator::validate(Platform::LinkedIn, "  \n ");
        assert_eq!(result.errors, vec!["content is empty".to_string()]);
    }

    #[test]
    fn linkedin_requires_discussion_prompt() {
        let post = linkedin_post().replace("today?", "today.");
        let result = ConstraintValidator::validate(Platform::LinkedIn, &post);
        assert!(result.errors.iter().any(|e| e.contains("discussion prompt")));
    }

    #[test]
    fn linkedin_short_post_is_rejected_not_padded() {
        let result =
            ConstraintValidator::validate(Platform::LinkedIn, "A hook.\n\nWhat do you think?");
        assert!(result.errors.iter().any(|e| e.contains("words (expected 150-250)")));
    }

    #[test]
    fn tweet_over_limit_is_an_error() {
        let long = format!("3/ {}", "a".repeat(290));
        let thread = twitter_thread().replace(
            "3/ Turn each moment into a single idea. One idea per post keeps things readable.",
            &long,
        );
        let result = ConstraintValidator::validate(Platform::Twitter, &thread);
        assert!(result.errors.iter().any(|e| e.starts_with("tweet 3 has")));
    }

    #[test]
    fn tweet_near_limit_is_a_warning() {
        let near = format!("3/ {}", "a".repeat(270));
        let thread = twitter_thread().replace(
            "3/ Turn each moment into a single idea. One idea per post keeps things readable.",
            &near,
        );
        let result = ConstraintValidator::validate(Platform::Twitter, &thread);
        assert!(result.is_valid(), "{:?}", result.errors);
        assert_eq!(result.warnings.len(), 1);
    }

    #[test]
    fn thread_needs_five_to_seven_tweets() {
        let short: String = parse_thread(&twitter_thread())
            .into_iter()
            .skip(2)
            .map(|t| t.text)
            .collect::<Vec<_>>()
            .join("\n\n");
        let result = ConstraintValidator::validate(Platform::Twitter, &short);
        assert!(result.errors.iter().any(|e| e.contains("4 tweets")));
        assert!(result.errors.iter().any(|e| e.contains("numbered hook")));
    }

    #[test]
    fn thread_needs_cta() {
        let thread = twitter_thread().replace(
            "6/ Follow for more workflows like this and share it with a creator friend.",
            "6/ That is the whole workflow.",
        );
        let result = ConstraintValidator::validate(Platform::Twitter, &thread);
        assert!(result.errors.iter().any(|e| e.contains("call to action")));
    }

    #[test]
    fn instagram_requires_emoji() {
        let caption = instagram_caption().replace("🎙️", "").replace('✨', "");
        let result = ConstraintValidator::validate(Platform::Instagram, &caption);
        assert!(result.errors.iter().any(|e| e.contains("emoji")));
    }

    #[test]
    fn script_segments_parse() {
        let segments = parse_script(&youtube_script()).unwrap();
        assert_eq!(segments.len(), 6);
        assert_eq!(segments[1].start_secs, 8);
        assert_eq!(
            segments[0].visual_cue.as_deref(),
            Some("creator scrolling a long timeline")
        );
        assert_eq!(segments[0].narration, "Your best ideas are buried in long videos.");
    }

    #[test]
    fn script_requires_visual_cue_per_segment() {
        let script = youtube_script().replace(" [VISUAL: calendar filling up]", "");
        let result = ConstraintValidator::validate(Platform::YouTubeShorts, &script);
        assert!(result.errors.iter().any(|e| e == "segment 5 has no visual cue"));
    }

    #[test]
    fn script_duration_bounds() {
        let too_short = "[00:00-00:10] Hi. [VISUAL: face]\n[00:10-00:20] Bye. [VISUAL: wave]";
        let result = ConstraintValidator::validate(Platform::YouTubeShorts, too_short);
        assert!(result.errors.iter().any(|e| e.contains("runs 20s")));

        let near_edge = "[00:00-00:20] Hi. [VISUAL: face]\n[00:20-00:58] Bye. [VISUAL: wave]";
        let result = ConstraintValidator::validate(Platform::YouTubeShorts, near_edge);
        assert!(result.is_valid());
        assert!(!result.warnings.is_empty());
    }

    #[test]
    fn script_segments_must_be_contiguous() {
        let gap = "[00:00-00:20] Hi. [VISUAL: face]\n[00:25-00:45] Bye. [VISUAL: wave]";
        let result = ConstraintValidator::validate(Platform::YouTubeShorts, gap);
        assert!(result.errors.iter().any(|e| e.contains("does not start where")));
    }

    #[test]
    fn malformed_script_line_is_reported() {
        let result = ConstraintValidator::validate(Platform::YouTubeShorts, "just narration");
        assert!(result.errors[0].contains("line 1"));
    }
}
