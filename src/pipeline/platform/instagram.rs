use crate::pipeline::validate::{INSTAGRAM_MIN_PARAGRAPHS, INSTAGRAM_WORDS};

/// 起承転結の流れを持つキャプション。絵文字は最低1つ。
pub(super) fn format_rules() -> String {
    format!(
        "- Write one caption of {min} to {max} words.\n\
         - Tell it as a short story in at least {paragraphs} paragraphs separated by blank lines: \
         the situation, the turning point, and what changed.\n\
         - Use at least one emoji where it fits the voice.\n\
         - Finish with an invitation to save, share or comment.\n\
         - Do not add hashtags; they are added separately.",
        min = INSTAGRAM_WORDS.start(),
        max = INSTAGRAM_WORDS.end(),
        paragraphs = INSTAGRAM_MIN_PARAGRAPHS,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rules_require_story_arc_and_emoji() {
        let rules = format_rules();
        assert!(rules.contains("100 to 150 words"));
        assert!(rules.contains("at least 3 paragraphs"));
        assert!(rules.contains("emoji"));
    }
}
