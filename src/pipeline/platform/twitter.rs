use crate::pipeline::validate::{TWEET_COUNT, TWEET_MAX_CHARS, TWEET_NUMBER_RE};
use crate::util::text::split_paragraphs;

pub(super) fn format_rules() -> String {
    format!(
        "- Write a thread of {min} to {max} tweets.\n\
         - Prefix every tweet with its number and a slash: 1/, 2/, 3/ and so on.\n\
         - Tweet 1/ is the hook; it must make the reader want the rest of the thread.\n\
         - Keep every tweet at or under {chars} characters, including the number.\n\
         - Separate tweets with a blank line.\n\
         - The last tweet is a call to action (follow, share, reply or bookmark).",
        min = TWEET_COUNT.start(),
        max = TWEET_COUNT.end(),
        chars = TWEET_MAX_CHARS,
    )
}

/// ツイートを空行区切りに揃える。
///
/// モデルが改行1つでツイートを並べた場合、`n/` で始まる行を新しいツイートの先頭とみなす。
pub(super) fn tidy(text: &str) -> String {
    let mut tweets: Vec<String> = Vec::new();

    for paragraph in split_paragraphs(text) {
        for line in paragraph.lines() {
            let line = line.trim();
            if tweets.is_empty() || TWEET_NUMBER_RE.is_match(line) {
                tweets.push(line.to_string());
            } else if let Some(current) = tweets.last_mut() {
                current.push('\n');
                current.push_str(line);
            }
        }
    }

    tweets.join("\n\n")
}
