pub mod builder;

use std::collections::BTreeMap;
use std::fmt::Write as _;

use indexmap::IndexSet;
use serde::Serialize;

pub use self::builder::TableBuilder;

/// Name of the time column every table starts with.
pub const TIME_COLUMN: &str = "Time";

/// Marker written into dimension columns whose value collapsed several
/// non-unique source values during a cube merge.
pub const AMBIGUOUS: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Time,
    Dimension,
    Metric,
}

impl ColumnKind {
    /// Store type for a column of this kind. Metrics are nullable so a
    /// missing sample never reads back as zero.
    pub fn storage_type(&self) -> &'static str {
        match self {
            ColumnKind::Time => "DateTime",
            ColumnKind::Dimension => "String",
            ColumnKind::Metric => "Nullable(Float64)",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnKind::Time => "Time",
            ColumnKind::Dimension => "Dimension",
            ColumnKind::Metric => "Metric",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub kind: ColumnKind,
}

impl Column {
    pub fn new(name: impl Into<String>, kind: ColumnKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }

    pub fn storage_type(&self) -> &'static str {
        self.kind.storage_type()
    }
}

/// One serialized cell, tagged by the kind of column it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CellValue {
    Time(i64),
    Text(String),
    Float(Option<f64>),
}

impl std::fmt::Display for CellValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CellValue::Time(t) => write!(f, "{t}"),
            CellValue::Text(s) => write!(f, "{s}"),
            CellValue::Float(Some(v)) => write!(f, "{v}"),
            CellValue::Float(None) => write!(f, "NULL"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row {
    /// Unix seconds.
    pub time: i64,
    pub dimensions: BTreeMap<String, String>,
    pub metrics: BTreeMap<String, f64>,
}

impl Row {
    pub fn new(time: i64) -> Self {
        Self {
            time,
            dimensions: BTreeMap::new(),
            metrics: BTreeMap::new(),
        }
    }

    /// Values of this row laid out in `columns` order. A missing dimension is
    /// an empty string, a missing metric is null.
    pub fn ordered_values(&self, columns: &[Column]) -> Vec<CellValue> {
        columns
            .iter()
            .map(|col| match col.kind {
                ColumnKind::Time => CellValue::Time(self.time),
                ColumnKind::Dimension => CellValue::Text(
                    self.dimensions.get(&col.name).cloned().unwrap_or_default(),
                ),
                ColumnKind::Metric => CellValue::Float(self.metrics.get(&col.name).copied()),
            })
            .collect()
    }

    pub fn is_ambiguous(&self) -> bool {
        self.dimensions.values().any(|v| v == AMBIGUOUS)
    }
}

/// In-memory relational buffer for one query result or one cube.
///
/// Dimension and metric names keep their discovery order and only ever grow.
#[derive(Debug, Clone, Default)]
pub struct Table {
    pub name: String,
    dimensions: IndexSet<String>,
    metrics: IndexSet<String>,
    pub rows: Vec<Row>,
}

impl Table {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dimensions: IndexSet::new(),
            metrics: IndexSet::new(),
            rows: Vec::new(),
        }
    }

    pub fn dimensions(&self) -> impl Iterator<Item = &str> {
        self.dimensions.iter().map(String::as_str)
    }

    pub fn metrics(&self) -> impl Iterator<Item = &str> {
        self.metrics.iter().map(String::as_str)
    }

    pub fn dimension_count(&self) -> usize {
        self.dimensions.len()
    }

    pub fn metric_count(&self) -> usize {
        self.metrics.len()
    }

    pub fn has_dimension(&self, name: &str) -> bool {
        self.dimensions.contains(name)
    }

    pub fn has_metric(&self, name: &str) -> bool {
        self.metrics.contains(name)
    }

    /// Registers a dimension column if unseen and returns its name.
    pub fn register_dimension(&mut self, name: &str) -> &str {
        let (idx, _) = self.dimensions.insert_full(name.to_string());
        &self.dimensions[idx]
    }

    /// Registers a metric column if unseen and returns its name.
    pub fn register_metric(&mut self, name: &str) -> &str {
        let (idx, _) = self.metrics.insert_full(name.to_string());
        &self.metrics[idx]
    }

    pub fn push_row(&mut self, row: Row) {
        self.rows.push(row);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Time, then dimensions, then metrics.
    pub fn columns(&self) -> Vec<Column> {
        let mut cols = Vec::with_capacity(1 + self.dimensions.len() + self.metrics.len());
        cols.push(Column::new(TIME_COLUMN, ColumnKind::Time));
        cols.extend(
            self.dimensions
                .iter()
                .map(|d| Column::new(d.clone(), ColumnKind::Dimension)),
        );
        cols.extend(
            self.metrics
                .iter()
                .map(|m| Column::new(m.clone(), ColumnKind::Metric)),
        );
        cols
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns().into_iter().map(|c| c.name).collect()
    }

    pub fn ambiguous_rows(&self) -> usize {
        self.rows.iter().filter(|r| r.is_ambiguous()).count()
    }

    /// Renders up to `limit` rows as an aligned text table with kind, name
    /// and store type header lines.
    pub fn preview(&self, limit: usize) -> String {
        let columns = self.columns();
        let mut lines: Vec<Vec<String>> = vec![
            columns.iter().map(|c| c.kind.as_str().to_string()).collect(),
            columns.iter().map(|c| c.name.clone()).collect(),
            columns.iter().map(|c| c.storage_type().to_string()).collect(),
        ];
        for row in self.rows.iter().take(limit) {
            lines.push(
                row.ordered_values(&columns)
                    .iter()
                    .map(ToString::to_string)
                    .collect(),
            );
        }

        let widths: Vec<usize> = (0..columns.len())
            .map(|i| lines.iter().map(|l| l[i].chars().count()).max().unwrap_or(0))
            .collect();

        let mut out = String::new();
        for (n, line) in lines.iter().enumerate() {
            for (i, cell) in line.iter().enumerate() {
                let _ = write!(out, "| {:<width$} ", cell, width = widths[i]);
            }
            out.push_str("|\n");
            if n == 2 {
                for w in &widths {
                    let _ = write!(out, "+{}", "-".repeat(w + 2));
                }
                out.push_str("+\n");
            }
        }
        let _ = writeln!(out, "{} of {} rows", self.rows.len().min(limit), self.rows.len());
        out
    }

    /// Writes all rows as CSV with a header line of column names.
    pub fn write_csv<W: std::io::Write>(&self, writer: W) -> Result<(), csv::Error> {
        let columns = self.columns();
        let mut wtr = csv::Writer::from_writer(writer);
        wtr.write_record(columns.iter().map(|c| c.name.as_str()))?;
        for row in &self.rows {
            let record: Vec<String> = row
                .ordered_values(&columns)
                .into_iter()
                .map(|v| match v {
                    CellValue::Float(None) => String::new(),
                    other => other.to_string(),
                })
                .collect();
            wtr.write_record(&record)?;
        }
        wtr.flush()?;
        Ok(())
    }
}
