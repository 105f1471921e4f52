use std::cmp::Ordering;

use crate::dataset::DatasetRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortKey {
    pub column: usize,
    pub ascending: bool,
}

/// Multi-column ordering, most recently toggled column first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SortSpec {
    keys: Vec<SortKey>,
}

impl SortSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> &[SortKey] {
        &self.keys
    }

    pub fn primary(&self) -> Option<SortKey> {
        self.keys.first().copied()
    }

    pub fn direction(&self, column: usize) -> Option<bool> {
        self.keys
            .iter()
            .find(|key| key.column == column)
            .map(|key| key.ascending)
    }

    /// Re-toggling the primary column flips its direction. Any other column
    /// moves to the front ascending; the remaining keys keep their order.
    pub fn toggle(&self, column: usize) -> SortSpec {
        let mut keys = self.keys.clone();
        match keys.first_mut() {
            Some(front) if front.column == column => front.ascending = !front.ascending,
            _ => {
                keys.retain(|key| key.column != column);
                keys.insert(
                    0,
                    SortKey {
                        column,
                        ascending: true,
                    },
                );
            }
        }
        SortSpec { keys }
    }

    pub fn compare(&self, a: &DatasetRow, b: &DatasetRow) -> Ordering {
        for key in &self.keys {
            let ordering = a.cell(key.column).compare(b.cell(key.column));
            let ordering = if key.ascending {
                ordering
            } else {
                ordering.reverse()
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }

    /// Orders `indices` into `rows` in place. The sort is stable, so rows tied
    /// on every key keep the order in which `indices` listed them.
    pub fn sort_indices(&self, rows: &[DatasetRow], indices: &mut [usize]) {
        if self.keys.is_empty() {
            return;
        }
        indices.sort_by(|&a, &b| self.compare(&rows[a], &rows[b]));
    }
}
