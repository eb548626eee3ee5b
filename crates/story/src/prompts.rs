//! Image prompts: one per page plus the cover, all anchored to the
//! character's master description.

use serde::{Deserialize, Serialize};

use storyforge_core::policy::{style_token, BANNED_VISUAL_LEXICON, NEGATIVE_PROMPT_BASE};
use storyforge_core::{DomainError, Style};

/// Page index of the cover prompt.
pub const COVER_PAGE: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AspectRatio {
    #[serde(rename = "1:1")]
    Square,
    #[serde(rename = "3:4")]
    Portrait,
    #[serde(rename = "4:3")]
    Landscape,
    #[serde(rename = "9:16")]
    Tall,
}

impl Default for AspectRatio {
    fn default() -> Self {
        Self::Portrait
    }
}

impl AspectRatio {
    /// Pixel dimensions used by image adapters.
    pub fn dimensions(&self) -> (u32, u32) {
        match self {
            AspectRatio::Square => (1024, 1024),
            AspectRatio::Portrait => (768, 1024),
            AspectRatio::Landscape => (1024, 768),
            AspectRatio::Tall => (576, 1024),
        }
    }
}

/// One image prompt (page 0 = cover).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImagePrompt {
    pub page: u32,
    pub positive_prompt: String,
    pub negative_prompt: String,
    pub seed: u32,
    #[serde(default)]
    pub aspect_ratio: AspectRatio,
}

/// The prompt set for one book: cover plus one prompt per page, 1-indexed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImagePrompts {
    pub style: Style,
    pub cover: ImagePrompt,
    pub pages: Vec<ImagePrompt>,
}

impl ImagePrompts {
    /// Structural validation: cover is page 0, pages are 1..=N in order.
    pub fn validate(&self, expected_pages: u32) -> Result<(), DomainError> {
        if self.cover.page != COVER_PAGE {
            return Err(DomainError::validation("cover prompt must be page 0"));
        }
        if self.pages.len() as u32 != expected_pages {
            return Err(DomainError::validation(format!(
                "prompt set has {} page prompts, expected {expected_pages}",
                self.pages.len()
            )));
        }
        for (i, p) in self.pages.iter().enumerate() {
            let expected = i as u32 + 1;
            if p.page != expected {
                return Err(DomainError::validation(format!(
                    "page prompts must be 1..={expected_pages} in order, found {} at position {expected}",
                    p.page
                )));
            }
        }
        Ok(())
    }

    /// Enforce the prompt contract on every prompt: the master description
    /// and style token are embedded in the positive prompt, the no-text
    /// clause and banned visual lexicon in the negative prompt. Model output
    /// that already satisfies a clause is left untouched.
    pub fn enforce(&mut self, master_description: &str) {
        let token = style_token(self.style);
        for prompt in std::iter::once(&mut self.cover).chain(self.pages.iter_mut()) {
            if !prompt.positive_prompt.contains(master_description) {
                prompt.positive_prompt =
                    format!("{master_description}, {}", prompt.positive_prompt);
            }
            if !prompt.positive_prompt.contains(token) {
                prompt.positive_prompt = format!("{}, {token}", prompt.positive_prompt);
            }
            for clause in [NEGATIVE_PROMPT_BASE, BANNED_VISUAL_LEXICON] {
                if !prompt.negative_prompt.contains(clause) {
                    if prompt.negative_prompt.is_empty() {
                        prompt.negative_prompt = clause.to_string();
                    } else {
                        prompt.negative_prompt =
                            format!("{}, {clause}", prompt.negative_prompt);
                    }
                }
            }
        }
    }

    /// True when every prompt embeds the master description verbatim.
    pub fn embeds_master_description(&self, master_description: &str) -> bool {
        std::iter::once(&self.cover)
            .chain(self.pages.iter())
            .all(|p| p.positive_prompt.contains(master_description))
    }

    pub fn page(&self, page_number: u32) -> Option<&ImagePrompt> {
        if page_number == COVER_PAGE {
            return Some(&self.cover);
        }
        self.pages.iter().find(|p| p.page == page_number)
    }

    /// Total images to generate (cover + pages).
    pub fn total_images(&self) -> u32 {
        self.pages.len() as u32 + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prompt(page: u32) -> ImagePrompt {
        ImagePrompt {
            page,
            positive_prompt: format!("scene {page}, rabbit in a forest"),
            negative_prompt: String::new(),
            seed: 42 + page,
            aspect_ratio: AspectRatio::Portrait,
        }
    }

    fn prompts(pages: u32) -> ImagePrompts {
        ImagePrompts {
            style: Style::Watercolor,
            cover: prompt(0),
            pages: (1..=pages).map(prompt).collect(),
        }
    }

    #[test]
    fn valid_prompt_set_passes() {
        assert!(prompts(8).validate(8).is_ok());
    }

    #[test]
    fn cover_must_be_page_zero() {
        let mut p = prompts(8);
        p.cover.page = 1;
        assert!(p.validate(8).is_err());
    }

    #[test]
    fn enforce_embeds_master_description_in_every_prompt() {
        let master = "a white rabbit in a blue vest with a pink nose";
        let mut p = prompts(8);
        assert!(!p.embeds_master_description(master));

        p.enforce(master);
        assert!(p.embeds_master_description(master));
        for prompt in std::iter::once(&p.cover).chain(p.pages.iter()) {
            assert!(prompt.positive_prompt.contains(style_token(Style::Watercolor)));
            assert!(prompt.negative_prompt.contains("watermark"));
            assert!(prompt.negative_prompt.contains("signature"));
            assert!(prompt.negative_prompt.contains(BANNED_VISUAL_LEXICON));
        }
    }

    #[test]
    fn enforce_is_idempotent() {
        let master = "a white rabbit in a blue vest";
        let mut p = prompts(4);
        p.enforce(master);
        let once = p.clone();
        p.enforce(master);
        assert_eq!(p, once);
    }
}
