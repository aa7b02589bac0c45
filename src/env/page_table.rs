//! env/page_table — зафиксированные, но ещё не сброшенные в data file версии страниц.
//!
//! page -> [(tx_id, run)] по возрастанию tx_id. Читатель со снапшотом S видит
//! новейшую версию с tx_id <= S; если её нет — страницу из data file.
//! Checkpoint до `upto` пишет новейшую версию <= upto и убирает все версии <= upto.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct PageTable {
    versions: HashMap<u64, Vec<(u64, Arc<Vec<u8>>)>>,
    // tx_id -> next_page_number после этой транзакции
    commits: BTreeMap<u64, u64>,
}

/// Что сбросить на checkpoint.
#[derive(Debug, Default)]
pub struct Flushable {
    pub runs: Vec<(u64, Arc<Vec<u8>>)>,
    pub next_page_number: Option<u64>,
}

impl PageTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_committed(&mut self, tx_id: u64, next_page_number: u64, runs: Vec<(u64, Vec<u8>)>) {
        for (page, data) in runs {
            self.versions
                .entry(page)
                .or_default()
                .push((tx_id, Arc::new(data)));
        }
        self.commits.insert(tx_id, next_page_number);
    }

    pub fn lookup(&self, page: u64, snapshot: u64) -> Option<Arc<Vec<u8>>> {
        self.versions.get(&page).and_then(|vs| {
            vs.iter()
                .rev()
                .find(|(tx, _)| *tx <= snapshot)
                .map(|(_, d)| Arc::clone(d))
        })
    }

    pub fn collect_flushable(&self, upto: u64) -> Flushable {
        let mut runs: Vec<(u64, Arc<Vec<u8>>)> = self
            .versions
            .iter()
            .filter_map(|(&page, vs)| {
                vs.iter()
                    .rev()
                    .find(|(tx, _)| *tx <= upto)
                    .map(|(_, d)| (page, Arc::clone(d)))
            })
            .collect();
        runs.sort_unstable_by_key(|(p, _)| *p);
        Flushable {
            runs,
            next_page_number: self.commits.range(..=upto).next_back().map(|(_, &n)| n),
        }
    }

    pub fn remove_flushed(&mut self, upto: u64) {
        self.versions.retain(|_, vs| {
            vs.retain(|(tx, _)| *tx > upto);
            !vs.is_empty()
        });
        self.commits.retain(|&tx, _| tx > upto);
    }

    /// Страниц (прогонов) с несброшенными версиями.
    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    pub fn version_count(&self) -> usize {
        self.versions.values().map(Vec::len).sum()
    }
}
