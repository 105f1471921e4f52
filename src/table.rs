use std::collections::VecDeque;

use tracing::trace;

use crate::dataset::DatasetRow;
use crate::sort::SortSpec;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub label: String,
    /// Relative width; the host divides the available space by these weights.
    pub width: u16,
    pub sortable: bool,
}

impl Column {
    pub fn new(label: impl Into<String>, width: u16, sortable: bool) -> Self {
        Self {
            label: label.into(),
            width: width.max(1),
            sortable,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FocusDirection {
    Up,
    Down,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableEvent {
    /// Position (in the filtered, sorted sequence) of the selected row.
    SelectionChanged(Option<usize>),
    RowActivated { position: usize, source: usize },
}

/// Case-insensitive substring match on one column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnFilter {
    pub column: usize,
    needle: String,
}

impl ColumnFilter {
    pub fn new(column: usize, needle: &str) -> Self {
        Self {
            column,
            needle: needle.to_lowercase(),
        }
    }

    pub fn matches(&self, row: &DatasetRow) -> bool {
        row.cell(self.column)
            .as_text()
            .to_lowercase()
            .contains(&self.needle)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct VisibleRow<'a> {
    pub position: usize,
    pub source: usize,
    pub row: &'a DatasetRow,
    pub selected: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenderStats {
    /// Window rebuilt from scratch.
    pub full: u64,
    /// Window slid by one row.
    pub incremental: u64,
}

/// Sortable, filterable table that materializes only `capacity` rows.
///
/// `window` mirrors what a host widget would hold: the source indices of
/// `order[start..start + capacity]`. Scrolling edits it one row at a time;
/// only data, viewport, sort and filter changes rebuild it.
#[derive(Debug)]
pub struct WindowedTable {
    columns: Vec<Column>,
    rows: Vec<DatasetRow>,
    order: Vec<usize>,
    sort: SortSpec,
    filter: Option<ColumnFilter>,
    capacity: usize,
    start: usize,
    window: VecDeque<usize>,
    cursor: Option<usize>,
    has_focus: bool,
    pointer_pressed: bool,
    events: Vec<TableEvent>,
    stats: RenderStats,
}

impl WindowedTable {
    pub fn new(columns: Vec<Column>, capacity: usize) -> Self {
        Self {
            columns,
            rows: Vec::new(),
            order: Vec::new(),
            sort: SortSpec::new(),
            filter: None,
            capacity: capacity.max(1),
            start: 0,
            window: VecDeque::new(),
            cursor: None,
            has_focus: false,
            pointer_pressed: false,
            events: Vec::new(),
            stats: RenderStats::default(),
        }
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn set_rows(&mut self, rows: Vec<DatasetRow>) {
        self.rows = rows;
        self.rebuild_order();
        self.reset_view();
    }

    pub fn set_viewport(&mut self, capacity: usize) {
        let capacity = capacity.max(1);
        if capacity == self.capacity {
            return;
        }
        self.capacity = capacity;
        self.start = self.start.min(self.max_start());
        self.render_full();
    }

    pub fn set_filter(&mut self, filter: Option<ColumnFilter>) {
        self.filter = filter;
        self.rebuild_order();
        self.reset_view();
    }

    /// Toggles `column` in the sort spec and re-sorts everything, returning to
    /// the top. Unsortable or unknown columns are ignored. A sort set before
    /// any rows arrive applies to the rows given later.
    pub fn sort_by_column(&mut self, column: usize) -> bool {
        let sortable = self
            .columns
            .get(column)
            .map(|column| column.sortable)
            .unwrap_or(false);
        if !sortable {
            return false;
        }
        self.sort = self.sort.toggle(column);
        self.rebuild_order();
        self.reset_view();
        true
    }

    /// Mouse-wheel movement: slides the window `delta` rows, clamped.
    pub fn scroll(&mut self, delta: isize) {
        for _ in 0..delta.unsigned_abs() {
            let moved = if delta > 0 {
                self.slide_down()
            } else {
                self.slide_up()
            };
            if !moved {
                break;
            }
        }
    }

    /// Keyboard movement: moves the selection inside the window and slides
    /// the window only when the selection sits on its edge.
    pub fn move_focus(&mut self, direction: FocusDirection) {
        if self.window.is_empty() {
            return;
        }
        let first = self.start;
        let last = self.start + self.window.len() - 1;
        let current = match self.cursor {
            Some(position) if (first..=last).contains(&position) => position,
            _ => {
                self.select(Some(first));
                return;
            }
        };
        match direction {
            FocusDirection::Down => {
                if current < last || self.slide_down() {
                    self.select(Some(current + 1));
                }
            }
            FocusDirection::Up => {
                if current > first || self.slide_up() {
                    self.select(Some(current - 1));
                }
            }
        }
    }

    /// Records a pointer press on a visible slot. A press that lands while
    /// the table is unfocused marks the upcoming focus-in as pointer driven.
    pub fn pointer_press(&mut self, slot: usize) {
        if !self.has_focus {
            self.pointer_pressed = true;
        }
        if slot < self.window.len() {
            self.select(Some(self.start + slot));
        }
    }

    pub fn focus_in(&mut self) {
        self.has_focus = true;
        if std::mem::take(&mut self.pointer_pressed) {
            return;
        }
        if !self.window.is_empty() {
            self.select(Some(self.start));
        }
    }

    pub fn focus_out(&mut self) {
        self.has_focus = false;
        self.pointer_pressed = false;
        self.select(None);
    }

    /// Enter, Space or double click on the selected row.
    pub fn activate(&mut self) {
        if let Some(position) = self.cursor {
            self.events.push(TableEvent::RowActivated {
                position,
                source: self.order[position],
            });
        }
    }

    pub fn render(&self) -> Vec<VisibleRow<'_>> {
        self.window
            .iter()
            .enumerate()
            .map(|(slot, &source)| {
                let position = self.start + slot;
                VisibleRow {
                    position,
                    source,
                    row: &self.rows[source],
                    selected: self.cursor == Some(position),
                }
            })
            .collect()
    }

    pub fn take_events(&mut self) -> Vec<TableEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Rows passing the filter.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn total_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn has_focus(&self) -> bool {
        self.has_focus
    }

    pub fn selected_position(&self) -> Option<usize> {
        self.cursor
    }

    pub fn selected_row(&self) -> Option<&DatasetRow> {
        self.cursor.map(|position| &self.rows[self.order[position]])
    }

    pub fn sort_spec(&self) -> &SortSpec {
        &self.sort
    }

    pub fn filter(&self) -> Option<&ColumnFilter> {
        self.filter.as_ref()
    }

    pub fn stats(&self) -> RenderStats {
        self.stats
    }

    /// Filtered rows in display order.
    pub fn ordered_rows(&self) -> impl Iterator<Item = &DatasetRow> {
        self.order.iter().map(|&source| &self.rows[source])
    }

    fn max_start(&self) -> usize {
        self.order.len().saturating_sub(self.capacity)
    }

    fn rebuild_order(&mut self) {
        let rows = &self.rows;
        let mut order: Vec<usize> = match &self.filter {
            Some(filter) => (0..rows.len())
                .filter(|&index| filter.matches(&rows[index]))
                .collect(),
            None => (0..rows.len()).collect(),
        };
        self.sort.sort_indices(rows, &mut order);
        self.order = order;
    }

    fn reset_view(&mut self) {
        self.start = 0;
        self.select(None);
        self.render_full();
    }

    fn render_full(&mut self) {
        let end = (self.start + self.capacity).min(self.order.len());
        self.window = self.order[self.start..end].iter().copied().collect();
        self.stats.full += 1;
        trace!(start = self.start, rows = self.window.len(), "table window rebuilt");
    }

    fn slide_down(&mut self) -> bool {
        if self.start >= self.max_start() {
            return false;
        }
        self.start += 1;
        self.window.pop_front();
        self.window
            .push_back(self.order[self.start + self.capacity - 1]);
        self.stats.incremental += 1;
        true
    }

    fn slide_up(&mut self) -> bool {
        if self.start == 0 {
            return false;
        }
        self.start -= 1;
        self.window.pop_back();
        self.window.push_front(self.order[self.start]);
        self.stats.incremental += 1;
        true
    }

    fn select(&mut self, position: Option<usize>) {
        if self.cursor != position {
            self.cursor = position;
            self.events.push(TableEvent::SelectionChanged(position));
        }
    }
}
