//! pager/state — страницы, загруженные в рамках одной транзакции.
//!
//! Ключ — номер первой страницы прогона. Образы всегда plain (расшифрованные).
//! Dirty-прогоны забираются при commit (take_dirty) в порядке номеров.

use anyhow::{anyhow, Result};
use std::collections::hash_map::Entry;
use std::collections::HashMap;

#[derive(Debug)]
struct TxPage {
    data: Vec<u8>,
    dirty: bool,
}

#[derive(Debug)]
pub struct PagerTxState {
    page_size: usize,
    pages: HashMap<u64, TxPage>,
}

impl PagerTxState {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size,
            pages: HashMap::new(),
        }
    }

    #[inline]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    #[inline]
    pub fn contains(&self, page_number: u64) -> bool {
        self.pages.contains_key(&page_number)
    }

    pub fn get(&self, page_number: u64) -> Option<&[u8]> {
        self.pages.get(&page_number).map(|p| p.data.as_slice())
    }

    /// Положить загруженный (не изменённый) образ. Уже загруженный не заменяется.
    pub fn insert_clean(&mut self, page_number: u64, data: Vec<u8>) -> &[u8] {
        &self
            .pages
            .entry(page_number)
            .or_insert(TxPage { data, dirty: false })
            .data
    }

    /// Новый прогон (аллокация): сразу dirty, заменяет всё, что было.
    pub fn insert_new(&mut self, page_number: u64, data: Vec<u8>) -> &mut [u8] {
        let page = TxPage { data, dirty: true };
        match self.pages.entry(page_number) {
            Entry::Occupied(mut e) => {
                e.insert(page);
                e.into_mut().data.as_mut_slice()
            }
            Entry::Vacant(e) => e.insert(page).data.as_mut_slice(),
        }
    }

    /// Пометить загруженный прогон изменённым и отдать его на запись.
    pub fn mark_dirty(&mut self, page_number: u64) -> Result<&mut [u8]> {
        let p = self
            .pages
            .get_mut(&page_number)
            .ok_or_else(|| anyhow!("page {} is not loaded in this transaction", page_number))?;
        p.dirty = true;
        Ok(p.data.as_mut_slice())
    }

    pub fn is_dirty(&self, page_number: u64) -> bool {
        self.pages.get(&page_number).map_or(false, |p| p.dirty)
    }

    pub fn dirty_count(&self) -> usize {
        self.pages.values().filter(|p| p.dirty).count()
    }

    pub fn loaded_count(&self) -> usize {
        self.pages.len()
    }

    /// Забрать все dirty-прогоны по возрастанию номера.
    pub fn take_dirty(&mut self) -> Vec<(u64, Vec<u8>)> {
        let mut dirty: Vec<u64> = self
            .pages
            .iter()
            .filter(|(_, p)| p.dirty)
            .map(|(&n, _)| n)
            .collect();
        dirty.sort_unstable();
        dirty
            .into_iter()
            .filter_map(|n| self.pages.remove(&n).map(|p| (n, p.data)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_is_not_replaced_and_dirty_is_sorted() {
        let mut st = PagerTxState::new(4096);
        st.insert_clean(7, vec![1u8; 4096]);
        st.insert_clean(7, vec![2u8; 4096]);
        assert_eq!(st.get(7).unwrap()[0], 1);
        assert!(!st.is_dirty(7));

        st.insert_new(3, vec![0u8; 4096]);
        st.mark_dirty(7).unwrap()[0] = 9;
        assert!(st.mark_dirty(100).is_err());

        let taken = st.take_dirty();
        assert_eq!(taken.iter().map(|(n, _)| *n).collect::<Vec<_>>(), vec![3, 7]);
        assert_eq!(taken[1].1[0], 9);
        assert_eq!(st.loaded_count(), 0);
    }
}
