pub mod duration;
pub mod merge;
pub mod view;

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::table::TIME_COLUMN;

pub use self::merge::{asymmetric_join, merge};

/// Aggregation applied to a query's metric column in the cube view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregation {
    #[default]
    Sum,
    Avg,
    Min,
    Max,
    Count,
}

impl Aggregation {
    pub fn sql_function(&self) -> &'static str {
        match self {
            Aggregation::Sum => "sum",
            Aggregation::Avg => "avg",
            Aggregation::Min => "min",
            Aggregation::Max => "max",
            Aggregation::Count => "count",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub name: String,
    #[serde(rename = "promql")]
    pub expression: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default)]
    pub aggregation: Aggregation,
}

impl Query {
    pub fn new(name: impl Into<String>, expression: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            expression: expression.into(),
            value: None,
            aggregation: Aggregation::default(),
        }
    }

    /// Metric column the query's samples are written to.
    pub fn value_field(&self) -> &str {
        self.value.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cube {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(with = "duration", default = "default_ttl")]
    pub ttl: Duration,
    #[serde(rename = "scrape-interval", with = "duration", default = "default_scrape_interval")]
    pub scrape_interval: Duration,
    pub queries: Vec<Query>,
    #[serde(rename = "joined-labels", default)]
    pub joined_labels: Vec<String>,
    /// Unix seconds of the last successful sync; owned by the scheduler.
    #[serde(skip)]
    pub last_update: Option<i64>,
}

fn default_ttl() -> Duration {
    Duration::from_secs(60 * 60)
}

fn default_scrape_interval() -> Duration {
    Duration::from_secs(60)
}

impl Cube {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            ttl: default_ttl(),
            scrape_interval: default_scrape_interval(),
            queries: Vec::new(),
            joined_labels: Vec::new(),
            last_update: None,
        }
    }

    pub fn is_joined_label(&self, label: &str) -> bool {
        self.joined_labels.iter().any(|l| l == label)
    }

    /// A cube that never synced is always due.
    pub fn is_due(&self, now: i64) -> bool {
        match self.last_update {
            None => true,
            Some(last) => last.saturating_add(self.scrape_interval.as_secs() as i64) <= now,
        }
    }

    pub fn view_name(&self) -> String {
        format!("{}_view", self.name)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !is_identifier(&self.name) {
            return Err(ConfigError::InvalidCube(format!(
                "cube name '{}' is not a valid identifier",
                self.name
            )));
        }
        if self.queries.is_empty() {
            return Err(ConfigError::InvalidCube(format!(
                "cube '{}' has no queries",
                self.name
            )));
        }
        if self.scrape_interval.is_zero() {
            return Err(ConfigError::InvalidCube(format!(
                "cube '{}' has a zero scrape interval",
                self.name
            )));
        }

        for label in &self.joined_labels {
            if !is_identifier(label) || label == TIME_COLUMN {
                return Err(ConfigError::InvalidCube(format!(
                    "joined label '{}' in cube '{}' is not a valid label name",
                    label, self.name
                )));
            }
        }

        let view = self.view_name();
        let mut names = HashSet::new();
        let mut values = HashSet::new();
        for query in &self.queries {
            if !is_identifier(&query.name) {
                return Err(ConfigError::InvalidCube(format!(
                    "query name '{}' in cube '{}' is not a valid identifier",
                    query.name, self.name
                )));
            }
            if query.name == self.name || query.name == view {
                return Err(ConfigError::InvalidCube(format!(
                    "query '{}' shares its table name with cube '{}'",
                    query.name, self.name
                )));
            }
            let field = query.value_field();
            if !is_identifier(field) || field == TIME_COLUMN || field == view {
                return Err(ConfigError::InvalidCube(format!(
                    "value field '{}' of query '{}' in cube '{}' is not a valid column name",
                    field, query.name, self.name
                )));
            }
            if self.is_joined_label(field) {
                return Err(ConfigError::InvalidCube(format!(
                    "value field '{}' of query '{}' collides with a joined label of cube '{}'",
                    field, query.name, self.name
                )));
            }
            if !names.insert(query.name.as_str()) {
                return Err(ConfigError::InvalidCube(format!(
                    "duplicate query name '{}' in cube '{}'",
                    query.name, self.name
                )));
            }
            if !values.insert(query.value_field()) {
                return Err(ConfigError::InvalidCube(format!(
                    "duplicate value field '{}' in cube '{}'",
                    query.value_field(),
                    self.name
                )));
            }
        }
        Ok(())
    }
}

/// Top-level document of a cubes YAML file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CubeSet {
    pub cubes: Vec<Cube>,
}

impl CubeSet {
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        let set: CubeSet = serde_yaml::from_str(text)?;
        set.validate()?;
        Ok(set)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::from_yaml(&text)
    }

    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut names = HashSet::new();
        for cube in &self.cubes {
            cube.validate()?;
            if !names.insert(cube.name.as_str()) {
                return Err(ConfigError::InvalidCube(format!(
                    "duplicate cube name '{}'",
                    cube.name
                )));
            }
        }
        Ok(())
    }
}

/// `[A-Za-z_][A-Za-z0-9_]*`
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
