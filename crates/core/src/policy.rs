//! Age, style, and safety policy tables embedded in the pipeline.
//!
//! The age table is a hard constraint on story output; the style tokens are
//! embedded in every image prompt so cover and pages render consistently;
//! the lexicon backs output moderation.

use crate::spec::{Style, TargetAge};

/// Per-page length rule for an age band.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgeRule {
    pub min_sentences: u32,
    pub max_sentences: u32,
    /// `None` means unbounded.
    pub max_words: Option<u32>,
}

pub fn age_rule(age: TargetAge) -> AgeRule {
    match age {
        TargetAge::Age3To5 => AgeRule {
            min_sentences: 1,
            max_sentences: 2,
            max_words: Some(25),
        },
        TargetAge::Age5To7 => AgeRule {
            min_sentences: 2,
            max_sentences: 3,
            max_words: Some(40),
        },
        TargetAge::Age7To9 => AgeRule {
            min_sentences: 2,
            max_sentences: 4,
            max_words: Some(60),
        },
        TargetAge::Adult => AgeRule {
            min_sentences: 3,
            max_sentences: 6,
            max_words: None,
        },
    }
}

/// Fixed style → prompt token mapping.
pub fn style_token(style: Style) -> &'static str {
    match style {
        Style::Watercolor => "soft watercolor painting, gentle brush strokes, pastel colors, warm light",
        Style::Cartoon => "vibrant cartoon, bold outlines, bright colors, playful",
        Style::ThreeD => "3D rendered, Pixar-like, cute proportions, soft lighting",
        Style::Pixel => "pixel art, 16-bit retro, limited palette",
        Style::OilPainting => "oil painting illustration, rich texture, warm tones",
        Style::Claymation => "claymation, stop-motion look, textured clay figures",
        Style::Realistic => "realistic storybook illustration, detailed, natural light",
    }
}

/// Tokens that must never appear in produced text.
pub const SAFETY_LEXICON: &[&str] = &[
    "죽이",
    "살인",
    "폭력",
    "피",
    "술",
    "담배",
    "마약",
    "성인",
    "섹스",
    "야한",
    "총",
    "칼로 찔",
    "kill",
    "murder",
    "blood",
    "sex",
    "drug",
    "alcohol",
    "violence",
    "weapon",
    "gun",
    "knife",
];

/// Always present in every negative prompt: no rendered text of any kind.
pub const NEGATIVE_PROMPT_BASE: &str = "text, letters, words, writing, caption, subtitle, title, watermark, logo, signature, label, number, alphabet";

/// Visual content forbidden in every generated image.
pub const BANNED_VISUAL_LEXICON: &str = "violence, weapon, gun, knife, blood, gore, scary, horror";

/// First banned lexicon token contained in `text`, if any.
pub fn find_banned(text: &str) -> Option<&'static str> {
    let lower = text.to_lowercase();
    SAFETY_LEXICON.iter().find(|t| lower.contains(&t.to_lowercase())).copied()
}

/// First caller-forbidden element contained in `text`, if any.
pub fn find_forbidden<'a>(text: &str, forbidden: &'a [String]) -> Option<&'a str> {
    let lower = text.to_lowercase();
    forbidden
        .iter()
        .find(|e| !e.is_empty() && lower.contains(&e.to_lowercase()))
        .map(|e| e.as_str())
}

/// Number of sentences in a page text.
///
/// Counts terminator runs (`.`, `!`, `?`, `…`) so "끝!!" is one sentence; a
/// trailing fragment without a terminator also counts.
pub fn sentence_count(text: &str) -> u32 {
    let mut count = 0u32;
    let mut in_terminator = false;
    let mut seen_content = false;
    for c in text.chars() {
        if matches!(c, '.' | '!' | '?' | '…') {
            if !in_terminator && seen_content {
                count += 1;
                seen_content = false;
            }
            in_terminator = true;
        } else {
            in_terminator = false;
            if !c.is_whitespace() {
                seen_content = true;
            }
        }
    }
    if seen_content {
        count += 1;
    }
    count
}

/// Whitespace-separated word count.
pub fn word_count(text: &str) -> u32 {
    text.split_whitespace().count() as u32
}

/// Check one page text against the age rule.
pub fn check_page_text(age: TargetAge, text: &str) -> Result<(), String> {
    let rule = age_rule(age);
    let sentences = sentence_count(text);
    if sentences < rule.min_sentences || sentences > rule.max_sentences {
        return Err(format!(
            "page has {sentences} sentences, expected {}..={} for age {}",
            rule.min_sentences,
            rule.max_sentences,
            age.as_str()
        ));
    }
    if let Some(max_words) = rule.max_words {
        let words = word_count(text);
        if words > max_words {
            return Err(format!(
                "page has {words} words, expected at most {max_words} for age {}",
                age.as_str()
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentence_counting_handles_terminator_runs() {
        assert_eq!(sentence_count("토끼는 달렸어요."), 1);
        assert_eq!(sentence_count("달려! 더 빨리!!"), 2);
        assert_eq!(sentence_count("하나. 둘. 셋"), 3);
        assert_eq!(sentence_count(""), 0);
    }

    #[test]
    fn age_3_5_allows_at_most_two_short_sentences() {
        assert!(check_page_text(TargetAge::Age3To5, "토끼가 뛰어요. 참 신나요.").is_ok());
        assert!(check_page_text(TargetAge::Age3To5, "하나. 둘. 셋.").is_err());

        let long = (0..26).map(|i| format!("단어{i}")).collect::<Vec<_>>().join(" ") + ".";
        assert!(check_page_text(TargetAge::Age3To5, &long).is_err());
    }

    #[test]
    fn adult_pages_are_unbounded_in_words() {
        let text = (0..200).map(|i| format!("word{i}")).collect::<Vec<_>>().join(" ");
        let text = format!("{text}. More prose here. And a third sentence.");
        assert!(check_page_text(TargetAge::Adult, &text).is_ok());
    }

    #[test]
    fn banned_lexicon_is_case_insensitive() {
        assert_eq!(find_banned("The KNIFE glinted"), Some("knife"));
        assert_eq!(find_banned("토끼가 풀을 먹어요"), None);
    }

    #[test]
    fn forbidden_elements_match_substrings() {
        let forbidden = vec!["ghost".to_string()];
        assert_eq!(find_forbidden("a scary Ghost appeared", &forbidden), Some("ghost"));
        assert_eq!(find_forbidden("a friendly rabbit", &forbidden), None);
    }

    #[test]
    fn every_style_has_a_token() {
        for style in [
            Style::Watercolor,
            Style::Cartoon,
            Style::ThreeD,
            Style::Pixel,
            Style::OilPainting,
            Style::Claymation,
            Style::Realistic,
        ] {
            assert!(!style_token(style).is_empty());
        }
    }
}
