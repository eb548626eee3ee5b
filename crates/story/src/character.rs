//! Character sheets: the stable visual identity carried across books.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use storyforge_core::{CharacterId, DomainError, UserKey};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacterAppearance {
    pub age_visual: String,
    pub face: String,
    pub hair: String,
    pub skin: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacterClothing {
    pub top: String,
    pub bottom: String,
    pub shoes: String,
    pub accessories: String,
}

/// The master character sheet.
///
/// `master_description` is the canonical visual anchor: it is embedded
/// verbatim in every image prompt so the character looks the same on the
/// cover and on every page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacterSheet {
    pub name: String,
    pub master_description: String,
    pub appearance: CharacterAppearance,
    pub clothing: CharacterClothing,
    pub personality_traits: Vec<String>,
    pub visual_style_notes: String,
}

impl CharacterSheet {
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.name.trim().is_empty() || self.name.chars().count() > 40 {
            return Err(DomainError::validation("character name must be 1..=40 chars"));
        }
        let desc_len = self.master_description.chars().count();
        if !(10..=400).contains(&desc_len) {
            return Err(DomainError::validation(
                "master_description must be 10..=400 chars",
            ));
        }
        if self.personality_traits.is_empty() {
            return Err(DomainError::validation(
                "character needs at least one personality trait",
            ));
        }
        Ok(())
    }
}

/// A persisted character. Characters outlive jobs and may be referenced by
/// many books.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Character {
    pub id: CharacterId,
    pub user_key: UserKey,
    pub sheet: CharacterSheet,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn sheet() -> CharacterSheet {
        CharacterSheet {
            name: "토끼".to_string(),
            master_description:
                "파란 조끼를 입은 귀여운 하얀 토끼로, 분홍색 코와 긴 하얀 귀가 특징입니다."
                    .to_string(),
            appearance: CharacterAppearance {
                age_visual: "어린 토끼".to_string(),
                face: "동그란 얼굴, 분홍 코".to_string(),
                hair: "하얀 털".to_string(),
                skin: "분홍빛".to_string(),
                body: "작고 통통한 체형".to_string(),
            },
            clothing: CharacterClothing {
                top: "파란 조끼".to_string(),
                bottom: "없음".to_string(),
                shoes: "없음".to_string(),
                accessories: "없음".to_string(),
            },
            personality_traits: vec!["용감함".to_string(), "호기심".to_string()],
            visual_style_notes: "수채화 스타일, 따뜻한 파스텔 톤".to_string(),
        }
    }

    #[test]
    fn valid_sheet_passes() {
        assert!(sheet().validate().is_ok());
    }

    #[test]
    fn short_master_description_is_rejected() {
        let mut s = sheet();
        s.master_description = "짧다".to_string();
        assert!(s.validate().is_err());
    }
}
