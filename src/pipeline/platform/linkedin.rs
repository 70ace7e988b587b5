use crate::pipeline::validate::{LINKEDIN_HOOK_MAX_WORDS, LINKEDIN_WORDS};

pub(super) fn format_rules() -> String {
    format!(
        "- Write a single post of {min} to {max} words.\n\
         - Open with a hook paragraph of at most {hook} words that makes a reader stop scrolling.\n\
         - Separate paragraphs with a blank line; keep each paragraph to two or three sentences.\n\
         - End with a short paragraph that asks the reader a question to start a discussion.\n\
         - No hashtags and no links.",
        min = LINKEDIN_WORDS.start(),
        max = LINKEDIN_WORDS.end(),
        hook = LINKEDIN_HOOK_MAX_WORDS,
    )
}
