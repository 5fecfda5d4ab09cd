//! Makes the store's tables match the in-memory tables before a write.
//!
//! Migration is purely additive: missing columns are added, existing ones are
//! never dropped, renamed or retyped.

mod error;

use std::sync::Arc;
use std::time::Duration;

use crate::cube::{view::view_select, Cube};
use crate::store::{with_deadline, ColumnInfo, CubeStore, DdlOp, ObjectKind};
use crate::table::{Column, Table};

pub use self::error::SchemaError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnsureOutcome {
    Created { columns: Vec<String> },
    Migrated { added: Vec<String> },
    Unchanged,
}

/// Objects owned by `cube`, view first so nothing depends on a dropped table.
pub fn cube_objects(cube: &Cube) -> Vec<(String, ObjectKind)> {
    let mut objects = vec![
        (cube.view_name(), ObjectKind::View),
        (cube.name.clone(), ObjectKind::Table),
    ];
    objects.extend(
        cube.queries
            .iter()
            .map(|q| (q.name.clone(), ObjectKind::Table)),
    );
    objects
}

fn column_info(column: &Column) -> ColumnInfo {
    ColumnInfo::new(column.name.as_str(), column.storage_type())
}

pub struct SchemaReconciler {
    store: Arc<dyn CubeStore>,
    call_timeout: Duration,
}

impl SchemaReconciler {
    pub fn new(store: Arc<dyn CubeStore>, call_timeout: Duration) -> Self {
        Self {
            store,
            call_timeout,
        }
    }

    pub async fn ensure_table(&self, table: &Table) -> Result<EnsureOutcome, SchemaError> {
        let name = table.name.as_str();
        let inspect_failed = |source| SchemaError::InspectFailed {
            table: name.to_string(),
            source,
        };

        let exists = with_deadline(self.call_timeout, self.store.table_exists(name))
            .await
            .map_err(inspect_failed)?;
        let columns = table.columns();

        if !exists {
            let op = DdlOp::CreateTable {
                table: name.to_string(),
                columns: columns.iter().map(column_info).collect(),
            };
            with_deadline(self.call_timeout, self.store.apply(&op))
                .await
                .map_err(|source| SchemaError::CreateFailed {
                    table: name.to_string(),
                    source,
                })?;
            log::info!("Created table '{}' with {} columns", name, columns.len());
            return Ok(EnsureOutcome::Created {
                columns: columns.into_iter().map(|c| c.name).collect(),
            });
        }

        let persisted = with_deadline(self.call_timeout, self.store.describe_columns(name))
            .await
            .map_err(inspect_failed)?;

        let mut added = Vec::new();
        for column in &columns {
            match persisted.iter().find(|p| p.name == column.name) {
                Some(existing) if existing.data_type != column.storage_type() => {
                    log::warn!(
                        "Column '{}' of table '{}' has type {}, expected {}; leaving it as is",
                        column.name,
                        name,
                        existing.data_type,
                        column.storage_type()
                    );
                }
                Some(_) => {}
                None => {
                    let op = DdlOp::AddColumn {
                        table: name.to_string(),
                        column: column_info(column),
                    };
                    with_deadline(self.call_timeout, self.store.apply(&op))
                        .await
                        .map_err(|source| SchemaError::MigrateFailed {
                            table: name.to_string(),
                            source,
                        })?;
                    added.push(column.name.clone());
                }
            }
        }

        if added.is_empty() {
            Ok(EnsureOutcome::Unchanged)
        } else {
            log::info!("Added columns {:?} to table '{}'", added, name);
            Ok(EnsureOutcome::Migrated { added })
        }
    }

    /// Creates or replaces the cube's aggregate view.
    pub async fn ensure_view(&self, cube: &Cube) -> Result<(), SchemaError> {
        let op = DdlOp::CreateView {
            view: cube.view_name(),
            select: view_select(cube),
        };
        with_deadline(self.call_timeout, self.store.apply(&op))
            .await
            .map_err(|source| SchemaError::ViewFailed {
                view: cube.view_name(),
                source,
            })
    }
}

impl SchemaReconciler {
    /// Drops the cube's view, its table and its query tables if present.
    pub async fn drop_cube(&self, cube: &Cube) -> Result<(), SchemaError> {
        for (name, kind) in cube_objects(cube) {
            let op = DdlOp::Drop {
                name: name.clone(),
                kind,
            };
            with_deadline(self.call_timeout, self.store.apply(&op))
                .await
                .map_err(|source| SchemaError::DropFailed { name, source })?;
        }
        log::info!("Dropped cube '{}'", cube.name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cube::Query;
    use crate::store::MemoryStore;

    fn up_table() -> Table {
        let mut table = Table::new("up");
        table.register_dimension("job");
        table.register_metric("up");
        table
    }

    fn reconciler(store: &MemoryStore) -> SchemaReconciler {
        SchemaReconciler::new(Arc::new(store.clone()), Duration::from_secs(1))
    }

    #[tokio::test]
    async fn absent_table_is_created_with_all_columns() {
        let store = MemoryStore::new();
        let outcome = reconciler(&store).ensure_table(&up_table()).await.unwrap();
        assert_eq!(
            outcome,
            EnsureOutcome::Created {
                columns: vec!["Time".into(), "job".into(), "up".into()]
            }
        );
        let cols = store.describe_columns("up").await.unwrap();
        assert_eq!(cols[0], ColumnInfo::new("Time", "DateTime"));
        assert_eq!(cols[1], ColumnInfo::new("job", "String"));
        assert_eq!(cols[2], ColumnInfo::new("up", "Nullable(Float64)"));
        assert_eq!(cols.len(), 3);
    }

    #[tokio::test]
    async fn second_ensure_is_a_no_op() {
        let store = MemoryStore::new();
        let r = reconciler(&store);
        r.ensure_table(&up_table()).await.unwrap();
        assert_eq!(r.ensure_table(&up_table()).await.unwrap(), EnsureOutcome::Unchanged);
        assert_eq!(store.applied().len(), 1);
    }

    #[tokio::test]
    async fn new_columns_are_added_and_old_ones_kept() {
        let store = MemoryStore::new();
        store.seed_table(
            "up",
            vec![
                ColumnInfo::new("Time", "DateTime"),
                ColumnInfo::new("legacy", "UInt8"),
                ColumnInfo::new("up", "Float64"),
            ],
        );
        let mut table = up_table();
        table.register_dimension("instance");

        let outcome = reconciler(&store).ensure_table(&table).await.unwrap();
        assert_eq!(
            outcome,
            EnsureOutcome::Migrated {
                added: vec!["job".into(), "instance".into()]
            }
        );
        assert_eq!(
            store.applied()[0],
            DdlOp::AddColumn {
                table: "up".to_string(),
                column: ColumnInfo::new("job", "String"),
            }
        );
        let cols = store.describe_columns("up").await.unwrap();
        assert!(cols.contains(&ColumnInfo::new("legacy", "UInt8")));
        assert!(cols.contains(&ColumnInfo::new("up", "Float64")));
        assert!(cols.contains(&ColumnInfo::new("instance", "String")));
    }

    #[tokio::test]
    async fn failing_ddl_surfaces_as_create_error() {
        let store = MemoryStore::new();
        store.fail_ddl(true);
        let err = reconciler(&store).ensure_table(&up_table()).await.unwrap_err();
        assert!(matches!(err, SchemaError::CreateFailed { ref table, .. } if table == "up"));
    }

    #[tokio::test]
    async fn view_is_named_after_the_cube() {
        let store = MemoryStore::new();
        let mut cube = Cube::new("api");
        cube.queries.push(Query::new("up", "up"));
        reconciler(&store).ensure_view(&cube).await.unwrap();
        assert!(store.table("api_view").unwrap().is_view);
        assert!(matches!(
            &store.applied()[0],
            DdlOp::CreateView { view, select } if view == "api_view" && select.contains("FROM `api`")
        ));
    }

    #[tokio::test]
    async fn dropping_a_cube_removes_its_objects_only() {
        let store = MemoryStore::new();
        let mut cube = Cube::new("api");
        cube.queries.push(Query::new("up", "up"));
        let r = reconciler(&store);
        r.ensure_table(&up_table()).await.unwrap();
        r.ensure_view(&cube).await.unwrap();
        store.seed_table("other", vec![ColumnInfo::new("Time", "DateTime")]);

        r.drop_cube(&cube).await.unwrap();
        assert_eq!(store.table_names(), vec!["other".to_string()]);
        // Absent objects are skipped.
        r.drop_cube(&cube).await.unwrap();
    }
}
