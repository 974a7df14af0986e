//! Interaction data as seen by the sampler.
//!
//! Loading datasets from disk is left to the caller; the sampler only needs
//! the user/item counts and the raw id columns.

use std::collections::HashMap;

use crate::{ItemId, UserId};

/// Read-only view of an interaction table.
pub trait Dataset {
    fn user_num(&self) -> usize;
    fn item_num(&self) -> usize;
    /// Column of ids for `field`, one entry per interaction.
    fn column(&self, field: &str) -> Option<&[usize]>;
}

/// In-memory interaction table with named id columns.
#[derive(Debug, Clone, Default)]
pub struct InteractionTable {
    user_num: usize,
    item_num: usize,
    columns: HashMap<String, Vec<usize>>,
}

impl InteractionTable {
    pub fn new(user_num: usize, item_num: usize) -> Self {
        Self {
            user_num,
            item_num,
            columns: HashMap::new(),
        }
    }

    pub fn with_column(mut self, field: &str, values: Vec<usize>) -> Self {
        self.columns.insert(field.to_string(), values);
        self
    }

    /// Build a table from `(user, item)` pairs under the default
    /// `user_id` / `item_id` field names.
    pub fn from_pairs(user_num: usize, item_num: usize, pairs: &[(UserId, ItemId)]) -> Self {
        let (users, items): (Vec<_>, Vec<_>) = pairs.iter().copied().unzip();
        Self::new(user_num, item_num)
            .with_column("user_id", users)
            .with_column("item_id", items)
    }

    pub fn len(&self) -> usize {
        self.columns.values().map(Vec::len).max().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Dataset for InteractionTable {
    fn user_num(&self) -> usize {
        self.user_num
    }

    fn item_num(&self) -> usize {
        self.item_num
    }

    fn column(&self, field: &str) -> Option<&[usize]> {
        self.columns.get(field).map(Vec::as_slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_pairs_columns() {
        let table = InteractionTable::from_pairs(2, 5, &[(0, 1), (0, 2), (1, 4)]);
        assert_eq!(table.user_num(), 2);
        assert_eq!(table.item_num(), 5);
        assert_eq!(table.len(), 3);
        assert_eq!(table.column("user_id"), Some(&[0, 0, 1][..]));
        assert_eq!(table.column("item_id"), Some(&[1, 2, 4][..]));
        assert!(table.column("rating").is_none());
    }

    #[test]
    fn test_custom_field_names() {
        let table = InteractionTable::new(3, 10)
            .with_column("uid", vec![2])
            .with_column("iid", vec![9]);
        assert_eq!(table.column("iid"), Some(&[9][..]));
        assert!(!table.is_empty());
        assert!(InteractionTable::new(1, 1).is_empty());
    }
}
