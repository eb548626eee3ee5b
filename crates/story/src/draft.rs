//! The story draft produced by the story-generation stage.

use serde::{Deserialize, Serialize};

use storyforge_core::policy;
use storyforge_core::{DomainError, Language, TargetAge};

/// A character as cast in one story.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoryCharacter {
    pub id: String,
    pub name: String,
    pub role: CharacterRole,
    pub brief: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CharacterRole {
    Main,
    Support,
}

/// Cover scene description (drives the cover image prompt).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoryCover {
    pub cover_text: String,
    pub scene: String,
    pub mood: String,
    pub camera: String,
}

/// One page of prose plus the visual hints the prompt stage consumes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoryPage {
    /// 1-indexed page number.
    pub page: u32,
    pub text: String,
    pub scene: String,
    pub mood: String,
    pub camera: String,
    #[serde(default)]
    pub characters_present: Vec<String>,
}

/// Continuity notes carried from the draft into character and prompt stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoryContinuity {
    pub character_consistency_notes: String,
    pub style_notes_for_images: String,
}

/// A complete story draft: candidate title plus ordered pages.
///
/// One draft per job, immutable after write (page rewrites during output
/// moderation produce an updated copy, never an in-place edit of the stored
/// artifact).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoryDraft {
    pub title: String,
    pub language: Language,
    pub target_age: TargetAge,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub theme: Option<String>,
    pub moral: String,
    pub characters: Vec<StoryCharacter>,
    pub cover: StoryCover,
    pub pages: Vec<StoryPage>,
    pub continuity: StoryContinuity,
}

impl StoryDraft {
    /// Structural validation: title present, exactly `expected_pages` pages,
    /// unique 1..=N page numbers in order.
    pub fn validate(&self, expected_pages: u32) -> Result<(), DomainError> {
        if self.title.trim().is_empty() || self.title.chars().count() > 80 {
            return Err(DomainError::validation("title must be 1..=80 chars"));
        }
        if self.pages.len() as u32 != expected_pages {
            return Err(DomainError::validation(format!(
                "draft has {} pages, expected {expected_pages}",
                self.pages.len()
            )));
        }
        for (i, page) in self.pages.iter().enumerate() {
            let expected = i as u32 + 1;
            if page.page != expected {
                return Err(DomainError::validation(format!(
                    "page numbers must be 1..={expected_pages} in order, found {} at position {expected}",
                    page.page
                )));
            }
            if page.text.trim().is_empty() {
                return Err(DomainError::validation(format!("page {expected} text is empty")));
            }
        }
        if self.characters.is_empty() {
            return Err(DomainError::validation("draft must cast at least one character"));
        }
        Ok(())
    }

    /// Page numbers whose text violates the age-band length rules, with the
    /// rule that failed.
    pub fn age_rule_violations(&self) -> Vec<(u32, String)> {
        self.pages
            .iter()
            .filter_map(|p| {
                policy::check_page_text(self.target_age, &p.text)
                    .err()
                    .map(|e| (p.page, e))
            })
            .collect()
    }

    /// All prose in one string (title + pages), for safety scanning.
    pub fn all_text(&self) -> String {
        let mut out = self.title.clone();
        for page in &self.pages {
            out.push(' ');
            out.push_str(&page.text);
        }
        out
    }

    pub fn page(&self, page_number: u32) -> Option<&StoryPage> {
        self.pages.iter().find(|p| p.page == page_number)
    }

    pub fn page_mut(&mut self, page_number: u32) -> Option<&mut StoryPage> {
        self.pages.iter_mut().find(|p| p.page == page_number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn draft(pages: u32) -> StoryDraft {
        StoryDraft {
            title: "용감한 토끼의 숲속 모험".to_string(),
            language: Language::Ko,
            target_age: TargetAge::Age5To7,
            theme: None,
            moral: "용기를 내면 무엇이든 할 수 있어요.".to_string(),
            characters: vec![StoryCharacter {
                id: "rabbit_hero".to_string(),
                name: "토끼".to_string(),
                role: CharacterRole::Main,
                brief: "숲속에 사는 용감한 하얀 토끼".to_string(),
            }],
            cover: StoryCover {
                cover_text: "용감한 토끼의 숲속 모험".to_string(),
                scene: "숲속 입구에 선 토끼".to_string(),
                mood: "희망찬".to_string(),
                camera: "wide shot".to_string(),
            },
            pages: (1..=pages)
                .map(|i| StoryPage {
                    page: i,
                    text: format!("토끼는 숲속을 걸었어요. 장면 {i}의 이야기예요."),
                    scene: format!("숲속 장면 {i}"),
                    mood: "평화로운".to_string(),
                    camera: "medium shot".to_string(),
                    characters_present: vec!["rabbit_hero".to_string()],
                })
                .collect(),
            continuity: StoryContinuity {
                character_consistency_notes: "토끼는 항상 파란 조끼를 입습니다.".to_string(),
                style_notes_for_images: "수채화, 파스텔 톤".to_string(),
            },
        }
    }

    #[test]
    fn valid_draft_passes() {
        assert!(draft(8).validate(8).is_ok());
    }

    #[test]
    fn wrong_page_count_is_rejected() {
        assert!(draft(7).validate(8).is_err());
    }

    #[test]
    fn out_of_order_pages_are_rejected() {
        let mut d = draft(8);
        d.pages.swap(0, 1);
        assert!(d.validate(8).is_err());
    }

    #[test]
    fn age_violations_name_the_offending_pages() {
        let mut d = draft(8);
        d.pages[3].text = "하나. 둘. 셋. 넷. 다섯.".to_string();
        let violations = d.age_rule_violations();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].0, 4);
    }
}
