//! The book specification: the frozen input of a generation job.

use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::id::CharacterId;

pub const MIN_PAGE_COUNT: u32 = 6;
pub const MAX_PAGE_COUNT: u32 = 12;
pub const DEFAULT_PAGE_COUNT: u32 = 8;
pub const MAX_TOPIC_LEN: usize = 200;
pub const MAX_FORBIDDEN_ELEMENTS: usize = 20;

/// Output language of the story text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Ko,
    En,
    Ja,
}

impl Default for Language {
    fn default() -> Self {
        Self::Ko
    }
}

/// Target age band; drives the per-page length rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TargetAge {
    #[serde(rename = "3-5")]
    Age3To5,
    #[serde(rename = "5-7")]
    Age5To7,
    #[serde(rename = "7-9")]
    Age7To9,
    #[serde(rename = "adult")]
    Adult,
}

impl TargetAge {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetAge::Age3To5 => "3-5",
            TargetAge::Age5To7 => "5-7",
            TargetAge::Age7To9 => "7-9",
            TargetAge::Adult => "adult",
        }
    }
}

/// Visual style; every style maps to a fixed prompt token (see `policy`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Style {
    Watercolor,
    Cartoon,
    #[serde(rename = "3d")]
    ThreeD,
    Pixel,
    OilPainting,
    Claymation,
    Realistic,
}

impl Style {
    pub fn as_str(&self) -> &'static str {
        match self {
            Style::Watercolor => "watercolor",
            Style::Cartoon => "cartoon",
            Style::ThreeD => "3d",
            Style::Pixel => "pixel",
            Style::OilPainting => "oil_painting",
            Style::Claymation => "claymation",
            Style::Realistic => "realistic",
        }
    }
}

/// Optional story theme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Theme {
    Lifestyle,
    Emotion,
    Social,
}

impl Theme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Theme::Lifestyle => "lifestyle",
            Theme::Emotion => "emotion",
            Theme::Social => "social",
        }
    }
}

/// Inline character description supplied with the request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacterSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub appearance: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub personality: Vec<String>,
}

/// The high-level request for one illustrated book.
///
/// Immutable once the job is queued; `validate` is the admission-time gate
/// and `normalized` produces the canonical form stages consume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookSpec {
    pub topic: String,
    #[serde(default)]
    pub language: Language,
    pub target_age: TargetAge,
    pub style: Style,
    #[serde(default = "default_page_count")]
    pub page_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub theme: Option<Theme>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub character: Option<CharacterSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub character_id: Option<CharacterId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub character_ids: Vec<CharacterId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub forbidden_elements: Vec<String>,
}

fn default_page_count() -> u32 {
    DEFAULT_PAGE_COUNT
}

impl BookSpec {
    pub fn validate(&self) -> Result<(), DomainError> {
        let topic = self.topic.trim();
        if topic.is_empty() || topic.chars().count() > MAX_TOPIC_LEN {
            return Err(DomainError::validation(format!(
                "topic must be 1..={MAX_TOPIC_LEN} chars"
            )));
        }
        if !(MIN_PAGE_COUNT..=MAX_PAGE_COUNT).contains(&self.page_count) {
            return Err(DomainError::validation(format!(
                "page_count must be {MIN_PAGE_COUNT}..={MAX_PAGE_COUNT}"
            )));
        }
        if self.forbidden_elements.len() > MAX_FORBIDDEN_ELEMENTS {
            return Err(DomainError::validation(format!(
                "forbidden_elements must have at most {MAX_FORBIDDEN_ELEMENTS} entries"
            )));
        }
        if let Some(c) = &self.character {
            if c.name.trim().is_empty() || c.name.chars().count() > 40 {
                return Err(DomainError::validation("character.name must be 1..=40 chars"));
            }
        }
        Ok(())
    }

    /// Canonical form consumed by the pipeline: trimmed topic, deduplicated
    /// lowercase forbidden elements.
    pub fn normalized(&self) -> Self {
        let mut spec = self.clone();
        spec.topic = spec.topic.trim().to_string();
        let mut seen = Vec::new();
        for e in &self.forbidden_elements {
            let e = e.trim().to_lowercase();
            if !e.is_empty() && !seen.contains(&e) {
                seen.push(e);
            }
        }
        spec.forbidden_elements = seen;
        spec
    }

    /// The character references to load, with the list winning over the
    /// singular id when both are present.
    pub fn character_refs(&self) -> Vec<CharacterId> {
        if !self.character_ids.is_empty() {
            return self.character_ids.clone();
        }
        self.character_id.clone().into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> BookSpec {
        BookSpec {
            topic: "토끼가 하늘을 나는 이야기".to_string(),
            language: Language::Ko,
            target_age: TargetAge::Age5To7,
            style: Style::Watercolor,
            page_count: 8,
            theme: None,
            character: None,
            character_id: None,
            character_ids: Vec::new(),
            forbidden_elements: Vec::new(),
        }
    }

    #[test]
    fn valid_spec_passes() {
        assert!(spec().validate().is_ok());
    }

    #[test]
    fn page_count_boundaries() {
        let mut s = spec();
        s.page_count = 6;
        assert!(s.validate().is_ok());
        s.page_count = 12;
        assert!(s.validate().is_ok());
        s.page_count = 5;
        assert!(s.validate().is_err());
        s.page_count = 13;
        assert!(s.validate().is_err());
    }

    #[test]
    fn empty_topic_is_rejected() {
        let mut s = spec();
        s.topic = "   ".to_string();
        assert!(s.validate().is_err());
    }

    #[test]
    fn normalization_dedupes_forbidden_elements() {
        let mut s = spec();
        s.forbidden_elements = vec![
            "Ghost".to_string(),
            "ghost".to_string(),
            " monster ".to_string(),
        ];
        let n = s.normalized();
        assert_eq!(n.forbidden_elements, vec!["ghost", "monster"]);
    }

    #[test]
    fn character_list_wins_over_singular() {
        let mut s = spec();
        let a = CharacterId::new();
        let b = CharacterId::new();
        s.character_id = Some(a);
        s.character_ids = vec![b.clone()];
        assert_eq!(s.character_refs(), vec![b]);
    }

    #[test]
    fn enums_use_wire_names() {
        assert_eq!(
            serde_json::to_string(&TargetAge::Age3To5).unwrap(),
            "\"3-5\""
        );
        assert_eq!(serde_json::to_string(&Style::ThreeD).unwrap(), "\"3d\"");
        assert_eq!(
            serde_json::to_string(&Style::OilPainting).unwrap(),
            "\"oil_painting\""
        );
    }
}
