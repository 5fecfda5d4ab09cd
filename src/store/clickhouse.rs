use async_trait::async_trait;

use super::{
    quote_ident, ColumnInfo, CubeStore, DdlOp, InsertBatch, ObjectKind, StoreError, StoreRow,
};
use crate::table::{CellValue, TIME_COLUMN};

#[derive(Clone)]
struct Endpoint {
    client: reqwest::Client,
    url: String,
    database: String,
    user: Option<String>,
    password: Option<String>,
}

impl Endpoint {
    fn request(&self, query: Option<&str>) -> reqwest::RequestBuilder {
        let mut params = vec![("database", self.database.as_str())];
        if let Some(q) = query {
            params.push(("query", q));
        }
        let mut req = self.client.post(&self.url).query(&params);
        if let Some(user) = &self.user {
            req = req.header("X-ClickHouse-User", user);
        }
        if let Some(password) = &self.password {
            req = req.header("X-ClickHouse-Key", password);
        }
        req
    }

    async fn execute(&self, query: Option<&str>, body: String) -> Result<String, StoreError> {
        let resp = self.request(query).body(body).send().await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(StoreError::ServerError(format!(
                "{}: {}",
                status,
                text.trim()
            )));
        }
        Ok(text)
    }
}

/// ClickHouse over its HTTP interface.
pub struct ClickHouseStore {
    endpoint: Endpoint,
}

impl ClickHouseStore {
    pub fn new(
        url: impl Into<String>,
        database: impl Into<String>,
        user: Option<String>,
        password: Option<String>,
    ) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self {
            endpoint: Endpoint {
                client,
                url: url.into(),
                database: database.into(),
                user,
                password,
            },
        })
    }

    /// Round-trips `SELECT 1` to verify connectivity and credentials.
    pub async fn ping(&self) -> Result<(), StoreError> {
        let out = self.endpoint.execute(None, "SELECT 1".to_string()).await?;
        if out.trim() != "1" {
            return Err(StoreError::DecodeError(format!(
                "unexpected ping response: {}",
                out.trim()
            )));
        }
        Ok(())
    }

    pub async fn exec_ddl(&self, sql: &str) -> Result<(), StoreError> {
        log::info!("Executing SQL: {sql}");
        self.endpoint.execute(None, sql.to_string()).await?;
        Ok(())
    }

    pub async fn query_rows(&self, sql: &str) -> Result<Vec<StoreRow>, StoreError> {
        log::debug!("Querying: {sql}");
        let text = self
            .endpoint
            .execute(None, format!("{sql} FORMAT JSONEachRow"))
            .await?;
        parse_json_rows(&text)
    }
}

/// ClickHouse statement for a schema change.
pub fn ddl_sql(op: &DdlOp) -> String {
    match op {
        DdlOp::CreateTable { table, columns } => {
            let defs: Vec<String> = columns
                .iter()
                .map(|c| format!("{} {}", quote_ident(&c.name), c.data_type))
                .collect();
            let time = quote_ident(TIME_COLUMN);
            format!(
                "CREATE TABLE {} ({}) ENGINE = MergeTree ORDER BY ({time}) PRIMARY KEY ({time})",
                quote_ident(table),
                defs.join(", ")
            )
        }
        DdlOp::AddColumn { table, column } => format!(
            "ALTER TABLE {} ADD COLUMN {} {}",
            quote_ident(table),
            quote_ident(&column.name),
            column.data_type
        ),
        DdlOp::CreateView { view, select } => {
            format!("CREATE OR REPLACE VIEW {} AS {}", quote_ident(view), select)
        }
        DdlOp::Drop { name, kind } => {
            let kind = match kind {
                ObjectKind::Table => "TABLE",
                ObjectKind::View => "VIEW",
            };
            format!("DROP {kind} IF EXISTS {}", quote_ident(name))
        }
    }
}

fn parse_json_rows(text: &str) -> Result<Vec<StoreRow>, StoreError> {
    text.lines()
        .filter(|l| !l.trim().is_empty())
        .map(|line| {
            serde_json::from_str::<StoreRow>(line)
                .map_err(|e| StoreError::DecodeError(format!("{e}: {line}")))
        })
        .collect()
}

#[async_trait]
impl CubeStore for ClickHouseStore {
    async fn table_exists(&self, table: &str) -> Result<bool, StoreError> {
        let rows = self
            .query_rows(&format!("EXISTS TABLE {}", quote_ident(table)))
            .await?;
        let flag = rows
            .first()
            .and_then(|r| r.get("result"))
            .and_then(|v| v.as_u64())
            .ok_or_else(|| StoreError::DecodeError(format!("EXISTS TABLE {table}: no result")))?;
        Ok(flag == 1)
    }

    async fn describe_columns(&self, table: &str) -> Result<Vec<ColumnInfo>, StoreError> {
        let rows = self
            .query_rows(&format!("DESCRIBE TABLE {}", quote_ident(table)))
            .await?;
        rows.iter()
            .map(|r| {
                let name = r.get("name").and_then(|v| v.as_str());
                let data_type = r.get("type").and_then(|v| v.as_str());
                match (name, data_type) {
                    (Some(n), Some(t)) => Ok(ColumnInfo::new(n, t)),
                    _ => Err(StoreError::DecodeError(format!(
                        "DESCRIBE TABLE {table}: malformed row"
                    ))),
                }
            })
            .collect()
    }

    async fn apply(&self, op: &DdlOp) -> Result<(), StoreError> {
        self.exec_ddl(&ddl_sql(op)).await
    }

    async fn prepare_batch(
        &self,
        table: &str,
        columns: &[String],
    ) -> Result<Box<dyn InsertBatch>, StoreError> {
        let quoted: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
        Ok(Box::new(ClickHouseBatch {
            endpoint: self.endpoint.clone(),
            insert: format!(
                "INSERT INTO {} ({}) FORMAT JSONEachRow",
                quote_ident(table),
                quoted.join(", ")
            ),
            columns: columns.to_vec(),
            body: String::new(),
            rows: 0,
        }))
    }
}

struct ClickHouseBatch {
    endpoint: Endpoint,
    insert: String,
    columns: Vec<String>,
    body: String,
    rows: usize,
}

#[async_trait]
impl InsertBatch for ClickHouseBatch {
    fn append(&mut self, values: Vec<CellValue>) -> Result<(), StoreError> {
        if values.len() != self.columns.len() {
            return Err(StoreError::ValueError(format!(
                "value count ({}) does not match column count ({})",
                values.len(),
                self.columns.len()
            )));
        }
        let mut obj = StoreRow::new();
        for (col, value) in self.columns.iter().zip(values) {
            let json = serde_json::to_value(&value)
                .map_err(|e| StoreError::ValueError(e.to_string()))?;
            obj.insert(col.clone(), json);
        }
        let line = serde_json::to_string(&obj).map_err(|e| StoreError::ValueError(e.to_string()))?;
        self.body.push_str(&line);
        self.body.push('\n');
        self.rows += 1;
        Ok(())
    }

    fn len(&self) -> usize {
        self.rows
    }

    async fn send(self: Box<Self>) -> Result<(), StoreError> {
        let this = *self;
        this.endpoint.execute(Some(&this.insert), this.body).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_json_each_row_output() {
        let text = "{\"name\":\"Time\",\"type\":\"DateTime\"}\n\n{\"name\":\"job\",\"type\":\"String\"}\n";
        let rows = parse_json_rows(text).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].get("name").and_then(|v| v.as_str()), Some("job"));
    }

    #[test]
    fn create_statement_quotes_every_identifier() {
        let sql = ddl_sql(&DdlOp::CreateTable {
            table: "cube".to_string(),
            columns: vec![
                ColumnInfo::new("Time", "DateTime"),
                ColumnInfo::new("up.instance", "String"),
                ColumnInfo::new("up", "Nullable(Float64)"),
            ],
        });
        assert_eq!(
            sql,
            "CREATE TABLE `cube` (`Time` DateTime, `up.instance` String, `up` Nullable(Float64)) \
             ENGINE = MergeTree ORDER BY (`Time`) PRIMARY KEY (`Time`)"
        );
    }

    #[test]
    fn alter_view_and_drop_statements() {
        let add = DdlOp::AddColumn {
            table: "api".to_string(),
            column: ColumnInfo::new("cpu.mode", "String"),
        };
        assert_eq!(ddl_sql(&add), "ALTER TABLE `api` ADD COLUMN `cpu.mode` String");

        let view = DdlOp::CreateView {
            view: "api_view".to_string(),
            select: "SELECT `Time` FROM `api`".to_string(),
        };
        assert_eq!(
            ddl_sql(&view),
            "CREATE OR REPLACE VIEW `api_view` AS SELECT `Time` FROM `api`"
        );

        let drop_view = DdlOp::Drop {
            name: "api_view".to_string(),
            kind: ObjectKind::View,
        };
        assert_eq!(ddl_sql(&drop_view), "DROP VIEW IF EXISTS `api_view`");
    }

    #[tokio::test]
    async fn batch_serializes_rows_as_json_lines() {
        let store = ClickHouseStore::new("http://localhost:8123", "default", None, None).unwrap();
        let columns = vec!["Time".to_string(), "job".to_string(), "up".to_string()];
        let mut batch = store.prepare_batch("up", &columns).await.unwrap();
        batch
            .append(vec![
                CellValue::Time(60),
                CellValue::Text("api".to_string()),
                CellValue::Float(None),
            ])
            .unwrap();
        assert_eq!(batch.len(), 1);
        assert!(batch
            .append(vec![CellValue::Time(60)])
            .is_err());
    }
}
