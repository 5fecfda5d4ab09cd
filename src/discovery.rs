//! Operator tooling for exploring the metrics backend and drafting cubes.

use std::collections::BTreeSet;

use anyhow::{Context, Result};

use crate::cube::{is_identifier, Cube, Query};
use crate::source::{MetricsSource, METRIC_NAME_LABEL};

/// How far back label names are sampled.
pub const DISCOVERY_WINDOW_SECS: i64 = 60 * 60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricInfo {
    pub name: String,
    /// Label names seen on the metric, sorted.
    pub dimensions: Vec<String>,
}

impl MetricInfo {
    pub fn has_dimensions(&self, wanted: &[String]) -> bool {
        wanted.iter().all(|w| self.dimensions.contains(w))
    }
}

/// Lists metrics with the label names they carried during the last hour.
/// A non-empty `names` restricts sampling to those metrics. With a non-empty
/// `filter`, only metrics carrying every listed label are returned.
pub async fn discover_metrics(
    source: &dyn MetricsSource,
    names: &[String],
    filter: &[String],
    now: i64,
) -> Result<Vec<MetricInfo>> {
    let selected = |name: &str| names.is_empty() || names.iter().any(|n| n == name);
    let available = source
        .list_metric_names()
        .await
        .context("listing metric names")?;

    let mut out = Vec::new();
    for name in available.into_iter().filter(|n| selected(n.as_str())) {
        let matrix = source
            .query_samples(&name, now - DISCOVERY_WINDOW_SECS, now)
            .await
            .with_context(|| format!("sampling labels of {name}"))?;
        let dimensions: BTreeSet<String> = matrix
            .iter()
            .flat_map(|s| s.labels.keys())
            .filter(|l| l.as_str() != METRIC_NAME_LABEL)
            .cloned()
            .collect();
        let info = MetricInfo {
            name,
            dimensions: dimensions.into_iter().collect(),
        };
        if info.has_dimensions(filter) {
            out.push(info);
        }
    }
    log::debug!("Discovered {} metrics", out.len());
    Ok(out)
}

/// Every distinct label name across `metrics`.
pub fn all_dimensions(metrics: &[MetricInfo]) -> BTreeSet<String> {
    metrics
        .iter()
        .flat_map(|m| m.dimensions.iter().cloned())
        .collect()
}

pub async fn value_help(
    source: &dyn MetricsSource,
    metric: &str,
    dimension: &str,
) -> Result<Vec<String>> {
    let mut values = source
        .list_label_values(metric, dimension)
        .await
        .with_context(|| format!("listing values of {dimension} on {metric}"))?;
    values.sort();
    values.dedup();
    Ok(values)
}

/// Metric names may contain `:`, which is not allowed in query names.
fn query_name(metric: &str) -> String {
    metric.replace(':', "_")
}

/// Drafts a cube selecting each metric, joined on the labels all of them share.
pub fn generate_cube(name: &str, metrics: &[MetricInfo]) -> Result<Cube> {
    if !is_identifier(name) {
        anyhow::bail!("cube name '{name}' is not a valid identifier");
    }
    if metrics.is_empty() {
        anyhow::bail!("no metrics selected for cube '{name}'");
    }

    let mut cube = Cube::new(name);
    cube.description = format!("Generated from {} metrics", metrics.len());
    for metric in metrics {
        cube.queries.push(Query::new(query_name(&metric.name), metric.name.clone()));
    }

    cube.joined_labels = metrics[0]
        .dimensions
        .iter()
        .filter(|d| metrics[1..].iter().all(|m| m.dimensions.contains(d)))
        .cloned()
        .collect();
    Ok(cube)
}
