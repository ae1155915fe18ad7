//! An in-memory [`KeyValueStore`] with Redis list semantics, used by the
//! test suites in place of a live server.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{KeyValueStore, StoreError};

#[derive(Default)]
pub struct MemoryStore {
    strings: Mutex<HashMap<String, String>>,
    lists: Mutex<HashMap<String, Vec<String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: &str, value: &str) {
        self.strings
            .lock()
            .expect("memory store lock")
            .insert(key.to_string(), value.to_string());
    }

    pub fn set_list(&self, key: &str, values: Vec<String>) {
        self.lists
            .lock()
            .expect("memory store lock")
            .insert(key.to_string(), values);
    }

    pub fn list(&self, key: &str) -> Vec<String> {
        self.lists
            .lock()
            .expect("memory store lock")
            .get(key)
            .cloned()
            .unwrap_or_default()
    }
}

fn resolve_index(index: i64, len: usize) -> i64 {
    if index < 0 {
        index + len as i64
    } else {
        index
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .strings
            .lock()
            .expect("memory store lock")
            .get(key)
            .cloned())
    }

    async fn list_len(&self, key: &str) -> Result<i64, StoreError> {
        Ok(self
            .lists
            .lock()
            .expect("memory store lock")
            .get(key)
            .map(|l| l.len() as i64)
            .unwrap_or(0))
    }

    async fn list_range(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<Vec<String>, StoreError> {
        let lists = self.lists.lock().expect("memory store lock");
        let Some(list) = lists.get(key) else {
            return Ok(Vec::new());
        };

        let start = resolve_index(start, list.len()).max(0);
        let stop = resolve_index(stop, list.len()).min(list.len() as i64 - 1);
        if start > stop {
            return Ok(Vec::new());
        }

        Ok(list[start as usize..=stop as usize].to_vec())
    }

    async fn replace_list(&self, key: &str, values: Vec<String>) -> Result<(), StoreError> {
        let mut lists = self.lists.lock().expect("memory store lock");
        if values.is_empty() {
            lists.remove(key);
        } else {
            lists.insert(key.to_string(), values);
        }
        Ok(())
    }
}
