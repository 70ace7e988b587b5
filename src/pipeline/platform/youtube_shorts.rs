use crate::pipeline::validate::SHORTS_SECS;

pub(super) fn format_rules() -> String {
    format!(
        "- Write a vertical video script lasting {min} to {max} seconds in total.\n\
         - One segment per line, in the exact form: [MM:SS-MM:SS] narration [VISUAL: what is on screen]\n\
         - Start at 00:00; each segment starts where the previous one ended.\n\
         - Every segment needs both narration and a visual cue.\n\
         - The first segment is a hook; the last one tells viewers to follow or subscribe.",
        min = SHORTS_SECS.start(),
        max = SHORTS_SECS.end(),
    )
}

/// 空行とMarkdownの箇条書き記号を取り除き、1行1セグメントにする。
pub(super) fn tidy(text: &str) -> String {
    text.lines()
        .map(|line| line.trim().trim_start_matches(['-', '*']).trim_start())
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}
