use crate::store::quote_ident;
use crate::table::TIME_COLUMN;

use super::Cube;

/// Select aggregating the cube table by time and joined labels, one aggregate
/// column per query.
pub fn view_select(cube: &Cube) -> String {
    let mut group_by = vec![quote_ident(TIME_COLUMN)];
    group_by.extend(cube.joined_labels.iter().map(|l| quote_ident(l)));

    let mut select = group_by.clone();
    select.extend(cube.queries.iter().map(|q| {
        format!(
            "{}({}) AS {}",
            q.aggregation.sql_function(),
            quote_ident(q.value_field()),
            quote_ident(q.value_field())
        )
    }));

    format!(
        "SELECT {} FROM {} GROUP BY {}",
        select.join(", "),
        quote_ident(&cube.name),
        group_by.join(", ")
    )
}
