//! Character persistence. Characters outlive jobs and may be referenced by
//! many books.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use storyforge_core::{CharacterId, UserKey};
use storyforge_story::Character;

#[derive(Debug, Clone, thiserror::Error)]
pub enum CharacterStoreError {
    #[error("character not found: {0}")]
    NotFound(CharacterId),
    #[error("storage error: {0}")]
    Storage(String),
}

#[async_trait]
pub trait CharacterStore: Send + Sync {
    async fn insert(&self, character: Character) -> Result<(), CharacterStoreError>;

    async fn get(&self, id: &CharacterId) -> Result<Option<Character>, CharacterStoreError>;

    async fn list_for_user(&self, user_key: &UserKey)
        -> Result<Vec<Character>, CharacterStoreError>;
}

#[derive(Debug, Default)]
pub struct InMemoryCharacterStore {
    characters: RwLock<HashMap<CharacterId, Character>>,
}

impl InMemoryCharacterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CharacterStore for InMemoryCharacterStore {
    async fn insert(&self, character: Character) -> Result<(), CharacterStoreError> {
        self.characters
            .write()
            .unwrap()
            .insert(character.id.clone(), character);
        Ok(())
    }

    async fn get(&self, id: &CharacterId) -> Result<Option<Character>, CharacterStoreError> {
        Ok(self.characters.read().unwrap().get(id).cloned())
    }

    async fn list_for_user(
        &self,
        user_key: &UserKey,
    ) -> Result<Vec<Character>, CharacterStoreError> {
        let mut rows: Vec<_> = self
            .characters
            .read()
            .unwrap()
            .values()
            .filter(|c| &c.user_key == user_key)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(rows)
    }
}
