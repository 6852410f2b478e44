//! Optional performance baselining around a migration.
//!
//! A representative query workload is timed before the migration and again
//! on the migrated schema (inside the still-open transaction); a median
//! degradation beyond the configured ratio raises a warning, or aborts when
//! so configured.

use crate::Result;
use dataflow_sql::connector::Queryable;
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct BaselineConfig {
    /// The representative read workload, run as-is.
    pub queries: Vec<String>,
    pub iterations: u32,
    /// Rows per table copied into the staging tables.
    pub sample_rows: u64,
    /// Post/pre median ratio above which a query counts as degraded.
    pub degradation_threshold: f64,
    pub abort_on_degradation: bool,
}

impl Default for BaselineConfig {
    fn default() -> Self {
        Self {
            queries: Vec::new(),
            iterations: 5,
            sample_rows: 1000,
            degradation_threshold: 2.0,
            abort_on_degradation: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueryTiming {
    pub query: String,
    pub median_micros: u128,
}

#[derive(Debug, Clone, Default)]
pub struct BaselineComparison {
    pub before: Vec<QueryTiming>,
    pub after: Vec<QueryTiming>,
    pub worst_ratio: f64,
    /// Queries whose ratio crossed the threshold.
    pub degraded: Vec<String>,
}

/// Copies a sampled subset of each table into `dataflow_staging_*` tables.
/// Table names are inlined after identifier validation upstream; samples
/// are bounded by `sample_rows`.
pub async fn build_staging_copy(
    conn: &dyn Queryable,
    tables: &[String],
    sample_rows: u64,
) -> Result<Vec<String>> {
    let mut created = Vec::new();

    for table in tables {
        dataflow_sql::validate::check_identifier(table)?;
        let staging = format!("dataflow_staging_{table}");
        conn.raw_cmd(&format!(
            "CREATE TABLE {staging} AS SELECT * FROM {table} LIMIT {sample_rows}"
        ))
        .await?;
        created.push(staging);
    }

    Ok(created)
}

pub async fn drop_staging_copy(conn: &dyn Queryable, staging_tables: &[String]) -> Result<()> {
    for table in staging_tables {
        conn.raw_cmd(&format!("DROP TABLE IF EXISTS {table}")).await?;
    }
    Ok(())
}

/// Times every configured query, returning the per-query median.
pub async fn capture(conn: &dyn Queryable, config: &BaselineConfig) -> Result<Vec<QueryTiming>> {
    let mut timings = Vec::with_capacity(config.queries.len());

    for query in &config.queries {
        let mut samples = Vec::with_capacity(config.iterations as usize);

        for _ in 0..config.iterations.max(1) {
            let started = Instant::now();
            conn.query_raw(query, &[]).await?;
            samples.push(started.elapsed().as_micros());
        }

        samples.sort_unstable();
        timings.push(QueryTiming {
            query: query.clone(),
            median_micros: samples[samples.len() / 2],
        });
    }

    Ok(timings)
}

pub fn compare(before: Vec<QueryTiming>, after: Vec<QueryTiming>, threshold: f64) -> BaselineComparison {
    let mut worst_ratio: f64 = 0.0;
    let mut degraded = Vec::new();

    for (pre, post) in before.iter().zip(&after) {
        // Sub-microsecond medians are noise, not signal.
        let pre_micros = pre.median_micros.max(1) as f64;
        let ratio = post.median_micros as f64 / pre_micros;

        if ratio > worst_ratio {
            worst_ratio = ratio;
        }
        if ratio > threshold {
            degraded.push(pre.query.clone());
        }
    }

    BaselineComparison {
        before,
        after,
        worst_ratio,
        degraded,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dataflow_sql::connector::Sqlite;

    #[tokio::test]
    async fn staging_copy_samples_rows() {
        let conn = Sqlite::new_in_memory().unwrap();
        conn.raw_cmd("CREATE TABLE items (id INTEGER PRIMARY KEY, n INTEGER)")
            .await
            .unwrap();
        for i in 0..20 {
            conn.execute_raw(
                "INSERT INTO items (n) VALUES (?)",
                &[dataflow_sql::Value::int64(i)],
            )
            .await
            .unwrap();
        }

        let staging = build_staging_copy(&conn, &["items".to_owned()], 5).await.unwrap();
        assert_eq!(staging, vec!["dataflow_staging_items".to_owned()]);

        let rows = conn
            .query_raw("SELECT COUNT(*) AS c FROM dataflow_staging_items", &[])
            .await
            .unwrap();
        assert_eq!(rows.first().unwrap()["c"].as_i64(), Some(5));

        drop_staging_copy(&conn, &staging).await.unwrap();
        assert!(conn.query_raw("SELECT * FROM dataflow_staging_items", &[]).await.is_err());
    }

    #[tokio::test]
    async fn capture_and_compare_flag_degradations() {
        let conn = Sqlite::new_in_memory().unwrap();
        conn.raw_cmd("CREATE TABLE t (id INTEGER)").await.unwrap();

        let config = BaselineConfig {
            queries: vec!["SELECT COUNT(*) FROM t".to_owned()],
            iterations: 3,
            ..Default::default()
        };

        let before = capture(&conn, &config).await.unwrap();
        assert_eq!(before.len(), 1);

        // A synthetic 10x slowdown crosses the 2x default threshold.
        let after = vec![QueryTiming {
            query: before[0].query.clone(),
            median_micros: before[0].median_micros.max(1) * 10,
        }];

        let comparison = compare(before, after, 2.0);
        assert_eq!(comparison.degraded.len(), 1);
        assert!(comparison.worst_ratio >= 10.0);
    }
}
