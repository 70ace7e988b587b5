//! テキスト処理ユーティリティ。
//!
//! 単語数・文分割・絵文字検出・モデル出力の整形を提供します。
use unicode_segmentation::UnicodeSegmentation;
use xxhash_rust::xxh3::xxh3_64;

/// テキストをXXH3でハッシュする。
#[must_use]
pub(crate) fn hash_text(text: &str) -> u64 {
    xxh3_64(text.as_bytes())
}

/// Unicode UAX#29の単語境界で数えた単語数。絵文字や記号は単語に含まれない。
#[must_use]
pub fn count_words(text: &str) -> usize {
    text.unicode_words().count()
}

/// 利用者が目にする「文字」の数（書記素クラスタ単位）。
#[must_use]
pub fn count_chars(text: &str) -> usize {
    text.graphemes(true).count()
}

/// テキストを文に分割する。
#[must_use]
pub(crate) fn split_sentences(text: &str) -> Vec<String> {
    text.unicode_sentences()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// 空行で区切られた段落に分割する。
#[must_use]
pub(crate) fn split_paragraphs(text: &str) -> Vec<String> {
    let mut paragraphs = Vec::new();
    let mut current: Vec<&str> = Vec::new();

    for line in text.lines() {
        if line.trim().is_empty() {
            if !current.is_empty() {
                paragraphs.push(current.join("\n"));
                current.clear();
            }
        } else {
            current.push(line.trim_end());
        }
    }
    if !current.is_empty() {
        paragraphs.push(current.join("\n"));
    }

    paragraphs
}

/// 絵文字と見なすコードポイント。
#[must_use]
pub(crate) fn is_emoji(c: char) -> bool {
    matches!(
        u32::from(c),
        0x1F300..=0x1F5FF
            | 0x1F600..=0x1F64F
            | 0x1F680..=0x1F6FF
            | 0x1F900..=0x1F9FF
            | 0x1FA70..=0x1FAFF
            | 0x2600..=0x26FF
            | 0x2700..=0x27BF
            | 0x1F1E6..=0x1F1FF
    )
}

#[must_use]
pub(crate) fn count_emoji(text: &str) -> usize {
    text.chars().filter(|c| is_emoji(*c)).count()
}

/// モデル出力を囲むMarkdownのコードフェンスを取り除く。
#[must_use]
pub(crate) fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = rest.split_once('\n').map_or("", |(_, body)| body);
    body.strip_suffix("```").unwrap_or(body).trim()
}

/// 最初の `{` から最後の `}` までを取り出す。モデルが前置きを付けた場合に備える。
#[must_use]
pub(crate) fn extract_json_object(raw: &str) -> Option<&str> {
    let stripped = strip_code_fences(raw);
    let start = stripped.find('{')?;
    let end = stripped.rfind('}')?;
    (start < end).then(|| &stripped[start..=end])
}

/// 文字数上限までで単語境界に揃えて切り詰める。
#[must_use]
pub(crate) fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    match cut.rfind(char::is_whitespace) {
        Some(idx) if idx > 0 => cut[..idx].trim_end().to_string(),
        _ => cut,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_words_ignores_emoji_and_punctuation() {
        assert_eq!(count_words("Hello, world! 🚀 It's 2024."), 4);
    }

    #[test]
    fn count_chars_counts_graphemes() {
        assert_eq!(count_chars("e\u{301}🚀"), 2);
    }

    #[test]
    fn split_paragraphs_on_blank_lines() {
        let text = "First line\nstill first\n\n\nSecond\n  \nThird";
        assert_eq!(
            split_paragraphs(text),
            vec!["First line\nstill first", "Second", "Third"]
        );
    }

    #[test]
    fn detects_emoji() {
        assert_eq!(count_emoji("Launch day 🚀✨ and coffee ☕"), 3);
        assert_eq!(count_emoji("plain text"), 0);
    }

    #[test]
    fn strips_code_fences() {
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("  plain  "), "plain");
    }

    #[test]
    fn extracts_json_object_after_preamble() {
        let raw = "Sure! Here you go:\n{\"topics\": [\"a\"]}\nThanks";
        assert_eq!(extract_json_object(raw), Some("{\"topics\": [\"a\"]}"));
        assert_eq!(extract_json_object("no json"), None);
    }

    #[test]
    fn truncate_chars_prefers_word_boundary() {
        assert_eq!(truncate_chars("alpha beta gamma", 12), "alpha beta");
        assert_eq!(truncate_chars("short", 12), "short");
    }

    #[test]
    fn hash_text_is_stable() {
        assert_eq!(hash_text("voice"), hash_text("voice"));
        assert_ne!(hash_text("voice"), hash_text("Voice"));
    }
}
