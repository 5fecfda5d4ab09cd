use std::collections::{BTreeMap, HashMap};

use crate::cube::Query;
use crate::source::{SeriesMatrix, METRIC_NAME_LABEL};

use super::{Row, Table};

/// A row and a sample's labels describe the same entity when they agree on
/// every key both carry and one key set contains the other.
fn same_entity(row: &BTreeMap<String, String>, labels: &BTreeMap<String, String>) -> bool {
    let (small, large) = if row.len() <= labels.len() {
        (row, labels)
    } else {
        (labels, row)
    };
    small
        .iter()
        .all(|(key, value)| large.get(key) == Some(value))
}

/// Turns range query results into a [`Table`].
///
/// A sample lands on an existing row of the same second when that row's
/// dimensions agree with the sample's labels (see [`same_entity`]); the row
/// then gains any labels it lacked. Later samples overwrite earlier metric
/// values on the same row.
pub struct TableBuilder {
    table: Table,
    /// Row indices per unix second, in insertion order.
    by_time: HashMap<i64, Vec<usize>>,
}

impl TableBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            table: Table::new(name),
            by_time: HashMap::new(),
        }
    }

    /// One-shot conversion of a single query result.
    pub fn build(query: &Query, matrix: &SeriesMatrix) -> Table {
        let mut builder = Self::new(query.name.clone());
        builder.add_query_result(query, matrix);
        builder.finish()
    }

    fn find_row(&self, time: i64, labels: &BTreeMap<String, String>) -> Option<usize> {
        self.by_time.get(&time).and_then(|candidates| {
            candidates
                .iter()
                .copied()
                .find(|&idx| same_entity(&self.table.rows[idx].dimensions, labels))
        })
    }

    /// Folds every sample of `matrix` into the table and returns how many
    /// samples were consumed.
    pub fn add_query_result(&mut self, query: &Query, matrix: &SeriesMatrix) -> usize {
        let value_field = query.value_field();
        let mut consumed = 0;

        for series in matrix {
            if series.samples.is_empty() {
                continue;
            }

            let dimensions: BTreeMap<String, String> = series
                .labels
                .iter()
                .filter(|(label, _)| label.as_str() != METRIC_NAME_LABEL)
                .map(|(label, value)| (label.clone(), value.clone()))
                .collect();
            for label in dimensions.keys() {
                self.table.register_dimension(label);
            }
            self.table.register_metric(value_field);

            for sample in &series.samples {
                let time = sample.unix_seconds();
                match self.find_row(time, &dimensions) {
                    Some(idx) => {
                        let row = &mut self.table.rows[idx];
                        row.metrics.insert(value_field.to_string(), sample.value);
                        for (label, value) in &dimensions {
                            row.dimensions.insert(label.clone(), value.clone());
                        }
                    }
                    None => {
                        let mut row = Row::new(time);
                        row.metrics.insert(value_field.to_string(), sample.value);
                        row.dimensions = dimensions.clone();
                        self.by_time
                            .entry(time)
                            .or_default()
                            .push(self.table.rows.len());
                        self.table.push_row(row);
                    }
                }
                consumed += 1;
            }
        }

        consumed
    }

    pub fn table(&self) -> &Table {
        &self.table
    }

    pub fn finish(self) -> Table {
        self.table
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::Series;

    fn query(name: &str) -> Query {
        Query::new(name, name)
    }

    #[test]
    fn drops_metric_name_label_and_truncates_time() {
        let matrix = vec![Series::new([("__name__", "up"), ("job", "api")])
            .with_sample(1_700_000_000_750, 1.0)];
        let table = TableBuilder::build(&query("up"), &matrix);

        assert_eq!(table.name, "up");
        assert_eq!(table.dimensions().collect::<Vec<_>>(), vec!["job"]);
        assert_eq!(table.metrics().collect::<Vec<_>>(), vec!["up"]);
        assert_eq!(table.rows.len(), 1);
        assert_eq!(table.rows[0].time, 1_700_000_000);
        assert!(!table.rows[0].dimensions.contains_key("__name__"));
    }

    #[test]
    fn distinct_label_sets_make_distinct_rows() {
        let matrix = vec![
            Series::new([("job", "api"), ("instance", "a")]).with_sample(60_000, 1.0),
            Series::new([("job", "api"), ("instance", "b")]).with_sample(60_000, 0.0),
        ];
        let table = TableBuilder::build(&query("up"), &matrix);
        assert_eq!(table.rows.len(), 2);
        assert_eq!(
            table.dimensions().collect::<Vec<_>>(),
            vec!["instance", "job"]
        );
    }

    #[test]
    fn same_second_samples_merge_last_write_wins() {
        let matrix = vec![Series::new([("job", "api")])
            .with_sample(60_100, 1.0)
            .with_sample(60_900, 5.0)];
        let table = TableBuilder::build(&query("up"), &matrix);
        assert_eq!(table.rows.len(), 1);
        assert_eq!(table.rows[0].metrics.get("up"), Some(&5.0));
    }

    #[test]
    fn refeeding_same_matrix_keeps_row_count() {
        let matrix = vec![
            Series::new([("job", "api")]).with_sample(0, 1.0).with_sample(60_000, 2.0),
            Series::new([("job", "db")]).with_sample(0, 3.0),
        ];
        let mut builder = TableBuilder::new("up");
        assert_eq!(builder.add_query_result(&query("up"), &matrix), 3);
        let first = builder.table().rows.len();
        builder.add_query_result(&query("up"), &matrix);
        assert_eq!(builder.table().rows.len(), first);
    }

    #[test]
    fn custom_value_field_names_the_metric_column() {
        let mut q = query("requests");
        q.value = Some("rps".to_string());
        let matrix = vec![Series::new([("job", "api")]).with_sample(0, 12.5)];
        let table = TableBuilder::build(&q, &matrix);
        assert_eq!(table.metrics().collect::<Vec<_>>(), vec!["rps"]);
        assert_eq!(table.rows[0].metrics.get("rps"), Some(&12.5));
    }

    #[test]
    fn empty_series_register_nothing() {
        let matrix = vec![Series::new([("job", "api")])];
        let table = TableBuilder::build(&query("up"), &matrix);
        assert!(table.is_empty());
        assert_eq!(table.dimension_count(), 0);
        assert_eq!(table.metric_count(), 0);
    }

    #[test]
    fn sample_with_extra_labels_joins_existing_row() {
        let matrix = vec![
            Series::new([("job", "a")]).with_sample(60_000, 1.0),
            Series::new([("job", "a"), ("instance", "x")]).with_sample(60_000, 2.0),
        ];
        let table = TableBuilder::build(&query("up"), &matrix);
        assert_eq!(table.rows.len(), 1);
        let row = &table.rows[0];
        assert_eq!(row.dimensions.get("instance").map(String::as_str), Some("x"));
        assert_eq!(row.metrics.get("up"), Some(&2.0));
    }

    #[test]
    fn extended_rows_still_absorb_refed_samples() {
        let matrix = vec![
            Series::new([("job", "a")]).with_sample(60_000, 1.0),
            Series::new([("job", "a"), ("instance", "x")]).with_sample(60_000, 2.0),
            Series::new([("job", "a"), ("mode", "user")]).with_sample(60_000, 3.0),
        ];
        let mut builder = TableBuilder::new("up");
        builder.add_query_result(&query("up"), &matrix);
        assert_eq!(builder.table().rows.len(), 2);
        builder.add_query_result(&query("up"), &matrix);
        assert_eq!(builder.table().rows.len(), 2);
    }

    #[test]
    fn conflicting_values_never_share_a_row() {
        let matrix = vec![
            Series::new([("job", "a"), ("instance", "x")]).with_sample(0, 1.0),
            Series::new([("job", "a"), ("instance", "y")]).with_sample(0, 2.0),
            Series::new([("job", "b")]).with_sample(0, 3.0),
        ];
        let table = TableBuilder::build(&query("up"), &matrix);
        assert_eq!(table.rows.len(), 3);
    }
}
