//! The terminal artifact: a packaged book with its pages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use storyforge_core::{BookId, CharacterId, JobId, Language, Style, TargetAge, UserKey};

/// One published page. `(book_id, page_number)` is unique; pages are
/// 1-indexed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub page_number: u32,
    pub text: String,
    pub image_url: String,
    pub image_prompt: String,
}

/// A finished book. Created exactly once, at packaging.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Book {
    pub id: BookId,
    pub job_id: JobId,
    pub title: String,
    pub language: Language,
    pub target_age: TargetAge,
    pub style: Style,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub theme: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub character_id: Option<CharacterId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub character_ids: Vec<CharacterId>,
    pub cover_image_url: String,
    pub pages: Vec<Page>,
    pub user_key: UserKey,
    pub created_at: DateTime<Utc>,
}

impl Book {
    /// Object-storage key for the cover image.
    pub fn cover_key(book_id: &BookId, ext: &str) -> String {
        format!("books/{book_id}/cover.{ext}")
    }

    /// Object-storage key for a page image.
    pub fn page_key(book_id: &BookId, page_number: u32, ext: &str) -> String {
        format!("books/{book_id}/pages/{page_number}.{ext}")
    }
}

/// Listing row for a user's library.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookSummary {
    pub book_id: BookId,
    pub title: String,
    pub cover_image_url: String,
    pub target_age: TargetAge,
    pub style: Style,
    pub created_at: DateTime<Utc>,
}

impl From<&Book> for BookSummary {
    fn from(book: &Book) -> Self {
        Self {
            book_id: book.id.clone(),
            title: book.title.clone(),
            cover_image_url: book.cover_image_url.clone(),
            target_age: book.target_age,
            style: book.style,
            created_at: book.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn storage_keys_follow_the_layout() {
        let id = BookId::from_str("book_abc123").unwrap();
        assert_eq!(Book::cover_key(&id, "png"), "books/book_abc123/cover.png");
        assert_eq!(Book::page_key(&id, 3, "png"), "books/book_abc123/pages/3.png");
    }
}
