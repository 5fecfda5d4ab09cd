//! Folds the per-query tables of a cube into one wide table.
//!
//! Rows are joined on time plus the cube's joined labels. When the join is
//! not 1:1 the affected dimension columns are set to [`AMBIGUOUS`] and the
//! right-hand row is kept as its own row, so no sample value is dropped.

use crate::table::{Row, Table, AMBIGUOUS, TIME_COLUMN};

use super::Cube;

/// Merges `tables` left to right. The result is named after the cube.
pub fn merge(cube: &Cube, tables: &[Table]) -> Table {
    let mut iter = tables.iter();
    let mut result = match iter.next() {
        Some(first) => first.clone(),
        None => return Table::new(cube.name.clone()),
    };
    result.name = cube.name.clone();

    for right in iter {
        result = asymmetric_join(cube, &result, right);
        result.name = cube.name.clone();
    }

    log::debug!(
        "Merged {} tables into cube '{}': {} rows, {} ambiguous",
        tables.len(),
        cube.name,
        result.len(),
        result.ambiguous_rows()
    );
    result
}

/// Name a right-hand dimension gets in the joined table.
pub fn joined_dimension_name(cube: &Cube, table_name: &str, dimension: &str) -> String {
    if dimension == TIME_COLUMN || cube.is_joined_label(dimension) {
        dimension.to_string()
    } else {
        format!("{table_name}.{dimension}")
    }
}

fn agrees_on_labels(cube: &Cube, a: &Row, b: &Row) -> bool {
    cube.joined_labels
        .iter()
        .all(|label| a.dimensions.get(label) == b.dimensions.get(label))
}

fn agrees_on_join_key(cube: &Cube, a: &Row, b: &Row) -> bool {
    a.time == b.time && agrees_on_labels(cube, a, b)
}

fn renamed_row(cube: &Cube, table_name: &str, row: &Row) -> Row {
    Row {
        time: row.time,
        dimensions: row
            .dimensions
            .iter()
            .map(|(dim, value)| (joined_dimension_name(cube, table_name, dim), value.clone()))
            .collect(),
        metrics: row.metrics.clone(),
    }
}

/// Sets every dimension `right` would have written on row `idx` to
/// [`AMBIGUOUS`], joined labels included. A right row without dimensions
/// marks every dimension of the shared row instead.
fn mark_shared_row(joined: &mut Table, idx: usize, right: &Row) {
    let columns: Vec<String> = if right.dimensions.is_empty() {
        joined.dimensions().map(str::to_string).collect()
    } else {
        right.dimensions.keys().cloned().collect()
    };
    let m = &mut joined.rows[idx];
    for dim in columns {
        m.dimensions.insert(dim, AMBIGUOUS.to_string());
    }
}

fn fill_ambiguous(joined: &Table, row: &mut Row) {
    for dim in joined.dimensions() {
        if !row.dimensions.contains_key(dim) {
            row.dimensions.insert(dim.to_string(), AMBIGUOUS.to_string());
        }
    }
}

/// Joins `right` onto `left`, keeping every left row and every right sample.
pub fn asymmetric_join(cube: &Cube, left: &Table, right: &Table) -> Table {
    let mut joined = Table::new(left.name.clone());
    for dim in left.dimensions() {
        joined.register_dimension(dim);
    }
    for dim in right.dimensions() {
        let name = joined_dimension_name(cube, &right.name, dim);
        joined.register_dimension(&name);
    }
    for metric in left.metrics().chain(right.metrics()) {
        joined.register_metric(metric);
    }

    joined.rows = left.rows.clone();

    for r in &right.rows {
        let mut renamed = renamed_row(cube, &right.name, r);
        let left_matches = left
            .rows
            .iter()
            .filter(|l| agrees_on_join_key(cube, l, r))
            .count();

        match left_matches {
            0 => joined.push_row(renamed),
            1 => {
                let right_matches = right
                    .rows
                    .iter()
                    .filter(|other| agrees_on_labels(cube, other, r))
                    .count();
                // Join-key columns of baseline rows are never rewritten, so the
                // left index addresses the same row in `joined`.
                let Some(idx) = left.rows.iter().position(|l| agrees_on_join_key(cube, l, r))
                else {
                    joined.push_row(renamed);
                    continue;
                };

                if right_matches == 1 {
                    let m = &mut joined.rows[idx];
                    m.dimensions.extend(renamed.dimensions);
                    m.metrics.extend(renamed.metrics);
                } else {
                    log::debug!(
                        "Ambiguous 1:{} join of '{}' onto '{}' at {}",
                        right_matches,
                        right.name,
                        left.name,
                        r.time
                    );
                    mark_shared_row(&mut joined, idx, &renamed);
                    fill_ambiguous(&joined, &mut renamed);
                    joined.push_row(renamed);
                }
            }
            n => {
                log::debug!(
                    "Ambiguous {}:1 join of '{}' onto '{}' at {}",
                    n,
                    right.name,
                    left.name,
                    r.time
                );
                fill_ambiguous(&joined, &mut renamed);
                joined.push_row(renamed);
            }
        }
    }

    joined
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cube::Query;
    use crate::source::Series;
    use crate::table::TableBuilder;

    const T: i64 = 1_700_000_000;

    fn cube(labels: &[&str]) -> Cube {
        let mut cube = Cube::new("cube");
        cube.joined_labels = labels.iter().map(|l| l.to_string()).collect();
        cube
    }

    fn table(name: &str, series: Vec<Series>) -> Table {
        TableBuilder::build(&Query::new(name, name), &series)
    }

    #[test]
    fn one_to_one_join_fills_single_row() {
        let cube = cube(&["job"]);
        let up = table("up", vec![Series::new([("job", "a")]).with_sample(T * 1000, 1.0)]);
        let cpu = table("cpu", vec![Series::new([("job", "a")]).with_sample(T * 1000, 0.5)]);

        let merged = merge(&cube, &[up, cpu]);
        assert_eq!(merged.name, "cube");
        assert_eq!(merged.rows.len(), 1);
        let row = &merged.rows[0];
        assert_eq!(row.metrics.get("up"), Some(&1.0));
        assert_eq!(row.metrics.get("cpu"), Some(&0.5));
        assert!(!row.is_ambiguous());
        assert_eq!(merged.dimensions().collect::<Vec<_>>(), vec!["job"]);
    }

    #[test]
    fn unjoined_right_dimensions_are_namespaced() {
        let cube = cube(&["job"]);
        let up = table("up", vec![Series::new([("job", "a")]).with_sample(0, 1.0)]);
        let cpu = table(
            "cpu",
            vec![Series::new([("job", "a"), ("mode", "user")]).with_sample(0, 0.5)],
        );

        let merged = merge(&cube, &[up, cpu]);
        assert_eq!(
            merged.dimensions().collect::<Vec<_>>(),
            vec!["job", "cpu.mode"]
        );
        assert_eq!(
            merged.rows[0].dimensions.get("cpu.mode").map(String::as_str),
            Some("user")
        );
    }

    #[test]
    fn unmatched_right_rows_are_appended() {
        let cube = cube(&["job"]);
        let up = table("up", vec![Series::new([("job", "a")]).with_sample(0, 1.0)]);
        let cpu = table("cpu", vec![Series::new([("job", "b")]).with_sample(0, 0.5)]);

        let merged = merge(&cube, &[up, cpu]);
        assert_eq!(merged.rows.len(), 2);
        assert_eq!(merged.rows[1].metrics.get("cpu"), Some(&0.5));
        assert!(merged.rows[1].metrics.get("up").is_none());
        assert_eq!(merged.ambiguous_rows(), 0);
    }

    #[test]
    fn one_to_many_marks_shared_row_and_keeps_right_rows() {
        let cube = cube(&["job"]);
        let cpu = table("cpu", vec![Series::new([("job", "a")]).with_sample(T * 1000, 0.5)]);
        let up = table(
            "up",
            vec![
                Series::new([("job", "a"), ("instance", "i1")]).with_sample(T * 1000, 1.0),
                Series::new([("job", "a"), ("instance", "i2")]).with_sample(T * 1000, 0.0),
            ],
        );

        let merged = merge(&cube, &[cpu, up]);
        assert_eq!(merged.rows.len(), 3);

        let shared = &merged.rows[0];
        assert_eq!(shared.metrics.get("cpu"), Some(&0.5));
        assert_eq!(
            shared.dimensions.get("up.instance").map(String::as_str),
            Some(AMBIGUOUS)
        );
        assert_eq!(shared.dimensions.get("job").map(String::as_str), Some(AMBIGUOUS));

        let mut up_values: Vec<f64> = merged.rows[1..]
            .iter()
            .filter_map(|r| r.metrics.get("up").copied())
            .collect();
        up_values.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(up_values, vec![0.0, 1.0]);
        for row in &merged.rows[1..] {
            assert_eq!(row.dimensions.len(), merged.dimension_count());
        }
    }

    #[test]
    fn many_to_one_appends_ambiguous_row() {
        let cube = cube(&["job"]);
        let up = table(
            "up",
            vec![
                Series::new([("job", "a"), ("instance", "i1")]).with_sample(0, 1.0),
                Series::new([("job", "a"), ("instance", "i2")]).with_sample(0, 1.0),
            ],
        );
        let cpu = table("cpu", vec![Series::new([("job", "a")]).with_sample(0, 0.5)]);

        let merged = merge(&cube, &[up, cpu]);
        assert_eq!(merged.rows.len(), 3);
        let extra = &merged.rows[2];
        assert_eq!(extra.metrics.get("cpu"), Some(&0.5));
        assert_eq!(extra.dimensions.get("instance").map(String::as_str), Some(AMBIGUOUS));
        assert_eq!(extra.dimensions.get("job").map(String::as_str), Some("a"));
        assert!(merged.rows[..2].iter().all(|r| r.metrics.get("cpu").is_none()));
    }

    #[test]
    fn repeated_steps_on_joined_labels_only_are_marked() {
        let cube = cube(&["job"]);
        let up = table(
            "up",
            vec![Series::new([("job", "a")])
                .with_sample(T * 1000, 1.0)
                .with_sample((T + 60) * 1000, 1.0)],
        );
        let cpu = table(
            "cpu",
            vec![Series::new([("job", "a")])
                .with_sample(T * 1000, 0.5)
                .with_sample((T + 60) * 1000, 0.7)],
        );

        let merged = merge(&cube, &[up, cpu]);
        assert_eq!(merged.rows.len(), 4);
        assert_eq!(merged.ambiguous_rows(), 2);
        for shared in &merged.rows[..2] {
            assert_eq!(shared.dimensions.get("job").map(String::as_str), Some(AMBIGUOUS));
            assert!(shared.metrics.get("cpu").is_none());
        }
        let mut cpu_values: Vec<f64> = merged
            .rows
            .iter()
            .filter_map(|r| r.metrics.get("cpu").copied())
            .collect();
        cpu_values.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(cpu_values, vec![0.5, 0.7]);
    }

    #[test]
    fn different_times_do_not_join() {
        let cube = cube(&["job"]);
        let up = table("up", vec![Series::new([("job", "a")]).with_sample(0, 1.0)]);
        let cpu = table("cpu", vec![Series::new([("job", "a")]).with_sample(60_000, 0.5)]);

        let merged = merge(&cube, &[up, cpu]);
        assert_eq!(merged.rows.len(), 2);
        assert_eq!(merged.ambiguous_rows(), 0);
    }

    #[test]
    fn three_way_fold_accumulates_metrics() {
        let cube = cube(&["job"]);
        let a = table("a", vec![Series::new([("job", "x")]).with_sample(0, 1.0)]);
        let b = table("b", vec![Series::new([("job", "x")]).with_sample(0, 2.0)]);
        let c = table("c", vec![Series::new([("job", "x")]).with_sample(0, 3.0)]);

        let merged = merge(&cube, &[a, b, c]);
        assert_eq!(merged.rows.len(), 1);
        assert_eq!(merged.metrics().collect::<Vec<_>>(), vec!["a", "b", "c"]);
        assert_eq!(merged.rows[0].metrics.len(), 3);
    }

    #[test]
    fn merging_nothing_yields_empty_cube_table() {
        let merged = merge(&cube(&["job"]), &[]);
        assert_eq!(merged.name, "cube");
        assert!(merged.is_empty());
    }

    #[test]
    fn single_table_is_renamed() {
        let up = table("up", vec![Series::new([("job", "a")]).with_sample(0, 1.0)]);
        let merged = merge(&cube(&["job"]), &[up]);
        assert_eq!(merged.name, "cube");
        assert_eq!(merged.rows.len(), 1);
    }
}
