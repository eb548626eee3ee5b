//! Prompt rendering for the LLM stages.
//!
//! Prompts carry their inputs as `key: value` lines so they stay greppable
//! in logs and reproducible from stored artifacts.

use storyforge_core::policy::style_token;
use storyforge_core::BookSpec;
use storyforge_story::{CharacterSheet, StoryDraft};

use storyforge_providers::LlmRequest;

fn spec_lines(spec: &BookSpec) -> String {
    let mut lines = vec![
        format!("topic: {}", spec.topic),
        format!("language: {:?}", spec.language).to_lowercase(),
        format!("target_age: {}", spec.target_age.as_str()),
        format!("style: {}", spec.style.as_str()),
        format!("page_count: {}", spec.page_count),
    ];
    if let Some(theme) = spec.theme {
        lines.push(format!("theme: {}", theme.as_str()));
    }
    if !spec.forbidden_elements.is_empty() {
        lines.push(format!(
            "forbidden_elements: {}",
            spec.forbidden_elements.join(", ")
        ));
    }
    lines.join("\n")
}

/// Stage C: title + N pages of age-appropriate prose.
pub fn story_request(spec: &BookSpec, character_briefs: &[String]) -> LlmRequest {
    let rule = storyforge_core::policy::age_rule(spec.target_age);
    let length_rule = match rule.max_words {
        Some(words) => format!(
            "{}-{} sentences and at most {words} words per page",
            rule.min_sentences, rule.max_sentences
        ),
        None => format!("{}-{} sentences per page", rule.min_sentences, rule.max_sentences),
    };

    let system = format!(
        "You are a children's story writer. Write a complete picture-book story as JSON \
         with fields: title, language, target_age, moral, characters \
         (id/name/role/brief), cover (cover_text/scene/mood/camera), pages \
         (page/text/scene/mood/camera/characters_present), continuity \
         (character_consistency_notes/style_notes_for_images). \
         Respect the length rule strictly: {length_rule}. \
         Page numbers run 1..page_count. Respond with JSON only."
    );

    let mut user = spec_lines(spec);
    if !character_briefs.is_empty() {
        user.push_str("\nexisting_characters:\n");
        for brief in character_briefs {
            user.push_str("- ");
            user.push_str(brief);
            user.push('\n');
        }
    }

    LlmRequest::new(system, user).with_temperature(0.8)
}

/// Stage D: the master character sheet.
pub fn character_sheet_request(spec: &BookSpec, draft: &StoryDraft) -> LlmRequest {
    let system = "You design a master character sheet for a picture book's main character. \
                  Respond with JSON only: name, master_description (a single vivid \
                  paragraph, 10-400 chars, usable verbatim inside image prompts), \
                  appearance (age_visual/face/hair/skin/body), clothing \
                  (top/bottom/shoes/accessories), personality_traits, visual_style_notes.";

    let mut user = spec_lines(spec);
    user.push_str(&format!("\ntitle: {}", draft.title));
    user.push_str(&format!(
        "\nconsistency_notes: {}",
        draft.continuity.character_consistency_notes
    ));
    for c in &draft.characters {
        user.push_str(&format!("\ncharacter: {} ({}): {}", c.name, c.id, c.brief));
    }

    LlmRequest::new(system, user).with_max_tokens(2000)
}

/// Stage E: cover + per-page image prompts.
pub fn image_prompts_request(
    spec: &BookSpec,
    draft: &StoryDraft,
    sheet: &CharacterSheet,
) -> LlmRequest {
    let system = "You are an image prompt engineer for children's picture books. \
                  Respond with JSON only: style, cover (page 0) and pages (1..page_count), \
                  each with page, positive_prompt, negative_prompt, seed, aspect_ratio. \
                  Embed the master_description verbatim in every positive prompt and \
                  never allow rendered text in the images.";

    let mut user = spec_lines(spec);
    user.push_str(&format!("\nstyle_token: {}", style_token(spec.style)));
    user.push_str(&format!("\nmaster_description: {}", sheet.master_description));
    user.push_str(&format!(
        "\nstyle_notes: {}",
        draft.continuity.style_notes_for_images
    ));
    user.push_str(&format!(
        "\ncover_scene: {} (mood: {}, camera: {})",
        draft.cover.scene, draft.cover.mood, draft.cover.camera
    ));
    for page in &draft.pages {
        user.push_str(&format!(
            "\npage {}: {} (mood: {}, camera: {})",
            page.page, page.scene, page.mood, page.camera
        ));
    }

    LlmRequest::new(system, user)
}

/// Stage G / page regeneration: rewrite one page under the age rule.
pub fn rewrite_request(
    spec: &BookSpec,
    draft: &StoryDraft,
    page_number: u32,
    feedback: &str,
) -> LlmRequest {
    let rule = storyforge_core::policy::age_rule(spec.target_age);
    let system = format!(
        "You rewrite one page of a children's story. Keep the scene, fix the issue in \
         the feedback, respect {}-{} sentences per page, and avoid all forbidden \
         content. Respond with JSON only: {{\"revised_text\": \"...\"}}.",
        rule.min_sentences, rule.max_sentences
    );

    let page = draft.page(page_number);
    let mut user = spec_lines(spec);
    user.push_str(&format!("\npage: {page_number}"));
    if let Some(page) = page {
        user.push_str(&format!("\noriginal_text: {}", page.text));
        user.push_str(&format!("\npage_scene: {}", page.scene));
    }
    user.push_str(&format!("\nbook_summary: {} - {}", draft.title, draft.moral));
    user.push_str(&format!("\nfeedback: {feedback}"));

    LlmRequest::new(system, user).with_max_tokens(1000)
}

/// Stage B input text: what the moderation port classifies.
pub fn moderation_input_text(spec: &BookSpec) -> String {
    let mut text = format!("topic: {}", spec.topic);
    if let Some(c) = &spec.character {
        text.push_str(&format!("\ncharacter: {}", c.name));
        if let Some(appearance) = &c.appearance {
            text.push_str(&format!(" ({appearance})"));
        }
    }
    if !spec.forbidden_elements.is_empty() {
        text.push_str(&format!(
            "\nforbidden_elements: {}",
            spec.forbidden_elements.join(", ")
        ));
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use storyforge_core::{Language, Style, TargetAge};

    fn spec() -> BookSpec {
        BookSpec {
            topic: "토끼의 모험".to_string(),
            language: Language::Ko,
            target_age: TargetAge::Age3To5,
            style: Style::Cartoon,
            page_count: 6,
            theme: None,
            character: None,
            character_id: None,
            character_ids: Vec::new(),
            forbidden_elements: vec!["ghost".to_string()],
        }
    }

    #[test]
    fn story_request_carries_the_shape_lines() {
        let request = story_request(&spec(), &[]);
        assert!(request.user_prompt.contains("page_count: 6"));
        assert!(request.user_prompt.contains("target_age: 3-5"));
        assert!(request.user_prompt.contains("forbidden_elements: ghost"));
        assert!(request.system_prompt.contains("1-2 sentences"));
        assert!(request.system_prompt.contains("at most 25 words"));
    }

    #[test]
    fn language_line_uses_wire_names() {
        let request = story_request(&spec(), &[]);
        assert!(request.user_prompt.contains("language: ko"));
    }
}
