use std::cmp::Ordering;
use std::fmt;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;

use tracing::debug;

use crate::domain::{BatchItem, GenomeId};
use crate::error::FetchError;

/// One table value. Numbers compare numerically, text lexically, and empty
/// cells sort before everything else.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Empty,
    Number { value: f64, raw: String },
    Text(String),
}

impl Cell {
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        let unquoted = trimmed
            .strip_prefix('"')
            .and_then(|rest| rest.strip_suffix('"'))
            .unwrap_or(trimmed);
        if unquoted.is_empty() {
            return Cell::Empty;
        }
        match unquoted.parse::<f64>() {
            Ok(value) if value.is_finite() => Cell::Number {
                value,
                raw: unquoted.to_string(),
            },
            _ => Cell::Text(unquoted.to_string()),
        }
    }

    pub fn compare(&self, other: &Cell) -> Ordering {
        match (self, other) {
            (Cell::Empty, Cell::Empty) => Ordering::Equal,
            (Cell::Empty, _) => Ordering::Less,
            (_, Cell::Empty) => Ordering::Greater,
            (Cell::Number { value: a, .. }, Cell::Number { value: b, .. }) => a.total_cmp(b),
            (Cell::Number { .. }, Cell::Text(_)) => Ordering::Less,
            (Cell::Text(_), Cell::Number { .. }) => Ordering::Greater,
            (Cell::Text(a), Cell::Text(b)) => a.cmp(b),
        }
    }

    pub fn as_text(&self) -> &str {
        match self {
            Cell::Empty => "",
            Cell::Number { raw, .. } => raw,
            Cell::Text(text) => text,
        }
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_text())
    }
}

static EMPTY: Cell = Cell::Empty;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DatasetRow(Vec<Cell>);

impl DatasetRow {
    pub fn new(cells: Vec<Cell>) -> Self {
        Self(cells)
    }

    pub fn from_texts<S: AsRef<str>>(values: &[S]) -> Self {
        Self(values.iter().map(|value| Cell::parse(value.as_ref())).collect())
    }

    /// Missing trailing cells read as [`Cell::Empty`].
    pub fn cell(&self, column: usize) -> &Cell {
        self.0.get(column).unwrap_or(&EMPTY)
    }

    pub fn cells(&self) -> &[Cell] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Dataset {
    pub columns: Vec<String>,
    pub rows: Vec<DatasetRow>,
}

impl Dataset {
    pub fn parse_tsv(text: &str) -> Result<Self, String> {
        let mut lines = text.lines().filter(|line| !line.trim().is_empty());
        let header = lines.next().ok_or_else(|| "table has no header row".to_string())?;
        let columns: Vec<String> = header
            .split('\t')
            .map(|label| Cell::parse(label).as_text().to_string())
            .collect();
        let rows = lines
            .map(|line| DatasetRow::new(line.split('\t').map(Cell::parse).collect()))
            .collect();
        Ok(Self { columns, rows })
    }

    pub fn load_tsv(path: &Path) -> Result<Self, FetchError> {
        let text = fs::read_to_string(path).map_err(|err| FetchError::TableParse {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
        let dataset = Self::parse_tsv(&text).map_err(|message| FetchError::TableParse {
            path: path.to_path_buf(),
            message,
        })?;
        debug!(
            path = %path.display(),
            columns = dataset.columns.len(),
            rows = dataset.rows.len(),
            "table loaded"
        );
        Ok(dataset)
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column == name)
    }

    /// Reads `genome_id`/`genome_name` pairs, skipping rows whose id is not a
    /// valid genome id.
    pub fn batch_items(&self) -> Result<Vec<BatchItem>, FetchError> {
        let id_column = self
            .column_index("genome_id")
            .ok_or_else(|| FetchError::MissingColumn("genome_id".to_string()))?;
        let name_column = self
            .column_index("genome_name")
            .ok_or_else(|| FetchError::MissingColumn("genome_name".to_string()))?;
        Ok(self
            .rows
            .iter()
            .filter_map(|row| {
                let id = row.cell(id_column).as_text().parse::<GenomeId>().ok()?;
                let name = row.cell(name_column).as_text();
                Some(if name.is_empty() {
                    BatchItem::from_id(id)
                } else {
                    BatchItem::new(id, name)
                })
            })
            .collect())
    }
}

pub fn write_tsv<'a>(
    path: &Path,
    columns: &[String],
    rows: impl IntoIterator<Item = &'a DatasetRow>,
) -> Result<usize, FetchError> {
    let file = fs::File::create(path).map_err(|err| FetchError::io(path, err))?;
    let mut writer = BufWriter::new(file);
    let mut count = 0usize;
    writeln!(writer, "{}", columns.join("\t")).map_err(|err| FetchError::io(path, err))?;
    for row in rows {
        let line = row
            .cells()
            .iter()
            .map(Cell::as_text)
            .collect::<Vec<_>>()
            .join("\t");
        writeln!(writer, "{line}").map_err(|err| FetchError::io(path, err))?;
        count += 1;
    }
    writer.flush().map_err(|err| FetchError::io(path, err))?;
    Ok(count)
}
