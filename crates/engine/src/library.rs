//! Book persistence: the terminal artifact and the user's library view.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use storyforge_core::{BookId, JobId, UserKey};
use storyforge_story::{Book, BookSummary};

#[derive(Debug, Clone, thiserror::Error)]
pub enum BookStoreError {
    #[error("book not found: {0}")]
    NotFound(BookId),
    #[error("page not found: {0}")]
    PageNotFound(u32),
    #[error("a book already exists for job {0}")]
    DuplicateJob(JobId),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Books with their pages. `insert` writes the book row and all page rows
/// atomically; a job gets at most one book.
#[async_trait]
pub trait BookStore: Send + Sync {
    async fn insert(&self, book: Book) -> Result<(), BookStoreError>;

    async fn get(&self, id: &BookId) -> Result<Option<Book>, BookStoreError>;

    async fn get_by_job(&self, job_id: &JobId) -> Result<Option<Book>, BookStoreError>;

    async fn list_for_user(&self, user_key: &UserKey)
        -> Result<Vec<BookSummary>, BookStoreError>;

    /// Replace a page's text and/or image URL (page regeneration).
    async fn update_page(
        &self,
        book_id: &BookId,
        page_number: u32,
        text: Option<String>,
        image_url: Option<String>,
    ) -> Result<(), BookStoreError>;
}

#[derive(Debug, Default)]
pub struct InMemoryBookStore {
    books: RwLock<HashMap<BookId, Book>>,
}

impl InMemoryBookStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BookStore for InMemoryBookStore {
    async fn insert(&self, book: Book) -> Result<(), BookStoreError> {
        let mut books = self.books.write().unwrap();
        if books.values().any(|b| b.job_id == book.job_id) {
            return Err(BookStoreError::DuplicateJob(book.job_id.clone()));
        }
        books.insert(book.id.clone(), book);
        Ok(())
    }

    async fn get(&self, id: &BookId) -> Result<Option<Book>, BookStoreError> {
        Ok(self.books.read().unwrap().get(id).cloned())
    }

    async fn get_by_job(&self, job_id: &JobId) -> Result<Option<Book>, BookStoreError> {
        Ok(self
            .books
            .read()
            .unwrap()
            .values()
            .find(|b| &b.job_id == job_id)
            .cloned())
    }

    async fn list_for_user(
        &self,
        user_key: &UserKey,
    ) -> Result<Vec<BookSummary>, BookStoreError> {
        let mut rows: Vec<BookSummary> = self
            .books
            .read()
            .unwrap()
            .values()
            .filter(|b| &b.user_key == user_key)
            .map(BookSummary::from)
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows)
    }

    async fn update_page(
        &self,
        book_id: &BookId,
        page_number: u32,
        text: Option<String>,
        image_url: Option<String>,
    ) -> Result<(), BookStoreError> {
        let mut books = self.books.write().unwrap();
        let book = books
            .get_mut(book_id)
            .ok_or_else(|| BookStoreError::NotFound(book_id.clone()))?;
        let page = book
            .pages
            .iter_mut()
            .find(|p| p.page_number == page_number)
            .ok_or(BookStoreError::PageNotFound(page_number))?;
        if let Some(text) = text {
            page.text = text;
        }
        if let Some(url) = image_url {
            page.image_url = url;
        }
        Ok(())
    }
}
