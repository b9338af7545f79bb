use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use crate::base_classes::types::normalize_symbol;

/// Latest value per symbol for one low-frequency data class (funding, open
/// interest, order book, 24h ticker). Writers replace the whole value.
#[derive(Debug)]
pub struct SnapshotStore<T> {
    entries: RwLock<HashMap<String, T>>,
}

impl<T> Default for SnapshotStore<T> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl<T: Clone> SnapshotStore<T> {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn update(&self, symbol: &str, value: T) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(normalize_symbol(symbol), value);
    }

    #[inline]
    pub fn get(&self, symbol: &str) -> Option<T> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&normalize_symbol(symbol))
            .cloned()
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&normalize_symbol(symbol))
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
