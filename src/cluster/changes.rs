//! cluster/changes — адресаты репликации и diff двух отсортированных списков.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ReplicationKind {
    Internal,
    Watcher,
}

/// Адресат репликации. Порядок: node_tag, затем url, database, kind.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReplicationNode {
    pub node_tag: String,
    pub url: String,
    pub database: String,
    pub kind: ReplicationKind,
}

impl ReplicationNode {
    pub fn new(
        node_tag: impl Into<String>,
        url: impl Into<String>,
        database: impl Into<String>,
        kind: ReplicationKind,
    ) -> Self {
        Self {
            node_tag: node_tag.into(),
            url: url.into(),
            database: database.into(),
            kind,
        }
    }
}

impl fmt::Display for ReplicationNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{} ({})", self.database, self.node_tag, self.url)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionChanges<T> {
    pub to_add: Vec<T>,
    pub to_remove: Vec<T>,
}

impl<T> ConnectionChanges<T> {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }
}

/// Слияние двух отсортированных списков: только в `old` — удалить, только в `new` — добавить.
/// Несортированный вход — ошибка вызывающего, здесь не проверяется.
pub fn find_connection_changes<T: Ord + Clone>(old: &[T], new: &[T]) -> ConnectionChanges<T> {
    let mut to_add = Vec::new();
    let mut to_remove = Vec::new();
    let (mut i, mut j) = (0, 0);

    while i < old.len() && j < new.len() {
        match old[i].cmp(&new[j]) {
            Ordering::Equal => {
                i += 1;
                j += 1;
            }
            Ordering::Less => {
                to_remove.push(old[i].clone());
                i += 1;
            }
            Ordering::Greater => {
                to_add.push(new[j].clone());
                j += 1;
            }
        }
    }
    to_remove.extend_from_slice(&old[i..]);
    to_add.extend_from_slice(&new[j..]);

    ConnectionChanges { to_add, to_remove }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_diff() {
        let old = [1, 3, 5, 7];
        let new = [2, 3, 7, 8, 9];
        let c = find_connection_changes(&old, &new);
        assert_eq!(c.to_remove, vec![1, 5]);
        assert_eq!(c.to_add, vec![2, 8, 9]);
        assert!(find_connection_changes(&new, &new).is_empty());
    }
}
