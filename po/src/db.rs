use anyhow::{Context, Result};
use deadpool_postgres::Pool;
use tokio_postgres::Row;

use crate::models::{Analysis, UpdateGeneration};

const GENERATION_COLUMNS: &str = "deployment_name, analysis_id, project_id, registry_url, \
     image_url, registry_user, registry_password, kong_token, namespace, pod_ids, status, log, \
     restart_counter, progress, time_created, time_updated";

/// Initialize the database schema, creating tables if they don't exist.
pub async fn init_schema(pool: &Pool) -> Result<()> {
    let client = pool.get().await.context("failed to get db connection")?;

    for table in ["analysis", "archive"] {
        client
            .execute(
                &format!(
                    r#"
                    CREATE TABLE IF NOT EXISTS {table} (
                        id BIGSERIAL PRIMARY KEY,
                        deployment_name TEXT NOT NULL UNIQUE,
                        analysis_id TEXT NOT NULL,
                        project_id TEXT NOT NULL,
                        registry_url TEXT NOT NULL,
                        image_url TEXT NOT NULL,
                        registry_user TEXT NOT NULL,
                        registry_password TEXT NOT NULL,
                        kong_token TEXT NOT NULL,
                        namespace TEXT NOT NULL,
                        pod_ids JSONB NOT NULL DEFAULT '[]',
                        status TEXT NOT NULL,
                        log JSONB,
                        restart_counter INT NOT NULL DEFAULT 0,
                        progress INT NOT NULL DEFAULT 0,
                        time_created TIMESTAMPTZ NOT NULL DEFAULT now(),
                        time_updated TIMESTAMPTZ NOT NULL DEFAULT now()
                    )
                    "#
                ),
                &[],
            )
            .await
            .with_context(|| format!("failed to create {table} table"))?;

        client
            .execute(
                &format!(
                    "CREATE INDEX IF NOT EXISTS idx_{table}_analysis_id ON {table} (analysis_id)"
                ),
                &[],
            )
            .await
            .with_context(|| format!("failed to create {table} analysis_id index"))?;
    }

    Ok(())
}

fn row_to_generation(row: &Row) -> Result<Analysis> {
    let status: String = row.get("status");
    let pod_ids: serde_json::Value = row.get("pod_ids");
    Ok(Analysis {
        deployment_name: row.get("deployment_name"),
        analysis_id: row.get("analysis_id"),
        project_id: row.get("project_id"),
        registry_url: row.get("registry_url"),
        image_url: row.get("image_url"),
        registry_user: row.get("registry_user"),
        registry_password: row.get("registry_password"),
        kong_token: row.get("kong_token"),
        namespace: row.get("namespace"),
        pod_ids: serde_json::from_value(pod_ids).context("failed to decode pod_ids")?,
        status: status.parse()?,
        log: row.get("log"),
        restart_counter: row.get("restart_counter"),
        progress: row.get("progress"),
        time_created: row.get("time_created"),
        time_updated: row.get("time_updated"),
    })
}

/// Insert a new generation row and return it as stored.
pub async fn create_generation(pool: &Pool, generation: &Analysis) -> Result<Analysis> {
    let client = pool.get().await.context("failed to get db connection")?;

    let pod_ids = serde_json::to_value(&generation.pod_ids)?;
    let row = client
        .query_one(
            &format!(
                r#"
                INSERT INTO analysis (deployment_name, analysis_id, project_id, registry_url,
                    image_url, registry_user, registry_password, kong_token, namespace, pod_ids,
                    status, log, restart_counter, progress)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
                RETURNING {GENERATION_COLUMNS}
                "#
            ),
            &[
                &generation.deployment_name,
                &generation.analysis_id,
                &generation.project_id,
                &generation.registry_url,
                &generation.image_url,
                &generation.registry_user,
                &generation.registry_password,
                &generation.kong_token,
                &generation.namespace,
                &pod_ids,
                &generation.status.as_str(),
                &generation.log,
                &generation.restart_counter,
                &generation.progress,
            ],
        )
        .await
        .context("failed to insert generation")?;

    row_to_generation(&row)
}

/// Get a generation by its deployment name.
pub async fn get_generation(pool: &Pool, deployment_name: &str) -> Result<Option<Analysis>> {
    let client = pool.get().await.context("failed to get db connection")?;

    let row = client
        .query_opt(
            &format!("SELECT {GENERATION_COLUMNS} FROM analysis WHERE deployment_name = $1"),
            &[&deployment_name],
        )
        .await
        .context("failed to query generation")?;

    row.as_ref().map(row_to_generation).transpose()
}

/// All generations of an analysis, oldest first.
pub async fn get_generations(pool: &Pool, analysis_id: &str) -> Result<Vec<Analysis>> {
    let client = pool.get().await.context("failed to get db connection")?;

    let rows = client
        .query(
            &format!(
                "SELECT {GENERATION_COLUMNS} FROM analysis WHERE analysis_id = $1 \
                 ORDER BY time_created ASC, id ASC"
            ),
            &[&analysis_id],
        )
        .await
        .context("failed to query generations")?;

    rows.iter().map(row_to_generation).collect()
}

/// The most recently created generation of an analysis.
pub async fn get_latest_generation(pool: &Pool, analysis_id: &str) -> Result<Option<Analysis>> {
    let client = pool.get().await.context("failed to get db connection")?;

    let row = client
        .query_opt(
            &format!(
                "SELECT {GENERATION_COLUMNS} FROM analysis WHERE analysis_id = $1 \
                 ORDER BY time_created DESC, id DESC LIMIT 1"
            ),
            &[&analysis_id],
        )
        .await
        .context("failed to query latest generation")?;

    row.as_ref().map(row_to_generation).transpose()
}

/// Number of generations ever stored for an analysis; the next ordinal
/// is this count plus one.
pub async fn count_generations(pool: &Pool, analysis_id: &str) -> Result<i64> {
    let client = pool.get().await.context("failed to get db connection")?;

    let row = client
        .query_one(
            "SELECT COUNT(*) AS n FROM analysis WHERE analysis_id = $1",
            &[&analysis_id],
        )
        .await
        .context("failed to count generations")?;

    Ok(row.get("n"))
}

/// Distinct analysis ids with at least one live-table row.
pub async fn list_analysis_ids(pool: &Pool) -> Result<Vec<String>> {
    let client = pool.get().await.context("failed to get db connection")?;

    let rows = client
        .query(
            "SELECT DISTINCT analysis_id FROM analysis ORDER BY analysis_id",
            &[],
        )
        .await
        .context("failed to list analysis ids")?;

    Ok(rows.iter().map(|r| r.get("analysis_id")).collect())
}

/// Partial update of a single generation. Only provided fields change;
/// `time_updated` always advances.
pub async fn update_generation(
    pool: &Pool,
    deployment_name: &str,
    fields: &UpdateGeneration,
) -> Result<Option<Analysis>> {
    let client = pool.get().await.context("failed to get db connection")?;

    let status = fields.status.map(|s| s.as_str());
    let pod_ids = fields
        .pod_ids
        .as_ref()
        .map(serde_json::to_value)
        .transpose()?;

    let mut set_clauses = vec!["time_updated = now()".to_string()];
    let mut params: Vec<&(dyn tokio_postgres::types::ToSql + Sync)> = Vec::new();
    let mut param_idx = 1;

    if let Some(ref s) = status {
        set_clauses.push(format!("status = ${}", param_idx));
        params.push(s);
        param_idx += 1;
    }
    if let Some(ref l) = fields.log {
        set_clauses.push(format!("log = ${}", param_idx));
        params.push(l);
        param_idx += 1;
    }
    if let Some(ref p) = pod_ids {
        set_clauses.push(format!("pod_ids = ${}", param_idx));
        params.push(p);
        param_idx += 1;
    }
    if let Some(ref r) = fields.restart_counter {
        set_clauses.push(format!("restart_counter = ${}", param_idx));
        params.push(r);
        param_idx += 1;
    }
    if let Some(ref p) = fields.progress {
        set_clauses.push(format!("progress = ${}", param_idx));
        params.push(p);
        param_idx += 1;
    }

    let query = format!(
        "UPDATE analysis SET {} WHERE deployment_name = ${} RETURNING {}",
        set_clauses.join(", "),
        param_idx,
        GENERATION_COLUMNS,
    );
    params.push(&deployment_name);

    let row = client
        .query_opt(&query, &params)
        .await
        .context("failed to update generation")?;

    row.as_ref().map(row_to_generation).transpose()
}

/// Apply a partial update to every generation of an analysis (bulk
/// stop/delete paths).
pub async fn update_generation_by_analysis(
    pool: &Pool,
    analysis_id: &str,
    fields: &UpdateGeneration,
) -> Result<()> {
    let names: Vec<String> = get_generations(pool, analysis_id)
        .await?
        .into_iter()
        .map(|g| g.deployment_name)
        .collect();
    for name in names {
        update_generation(pool, &name, fields).await?;
    }
    Ok(())
}

/// Delete a generation row outright.
pub async fn delete_generation(pool: &Pool, deployment_name: &str) -> Result<bool> {
    let client = pool.get().await.context("failed to get db connection")?;

    let rows_affected = client
        .execute(
            "DELETE FROM analysis WHERE deployment_name = $1",
            &[&deployment_name],
        )
        .await
        .context("failed to delete generation")?;

    Ok(rows_affected > 0)
}

/// Copy every generation of an analysis into the archive table and
/// remove it from the live table.
pub async fn archive_analysis(pool: &Pool, analysis_id: &str) -> Result<u64> {
    let client = pool.get().await.context("failed to get db connection")?;

    client
        .execute(
            &format!(
                r#"
                INSERT INTO archive ({GENERATION_COLUMNS})
                SELECT {GENERATION_COLUMNS} FROM analysis WHERE analysis_id = $1
                ON CONFLICT (deployment_name) DO NOTHING
                "#
            ),
            &[&analysis_id],
        )
        .await
        .context("failed to archive generations")?;

    client
        .execute("DELETE FROM analysis WHERE analysis_id = $1", &[&analysis_id])
        .await
        .context("failed to delete archived generations")
}

/// True iff the latest generation is still live (starting, started,
/// running, or stuck).
pub async fn analysis_is_live(pool: &Pool, analysis_id: &str) -> Result<bool> {
    Ok(get_latest_generation(pool, analysis_id)
        .await?
        .is_some_and(|g| g.status.is_live()))
}

/// Retain only the most recent generation of an analysis.
pub async fn prune_older_generations(pool: &Pool, analysis_id: &str) -> Result<u64> {
    let mut generations = get_generations(pool, analysis_id).await?;
    generations.pop();

    let mut pruned = 0;
    for generation in generations {
        if delete_generation(pool, &generation.deployment_name).await? {
            pruned += 1;
        }
    }
    Ok(pruned)
}

/// Drop every live row. Used by the `analyzes` cleanup.
pub async fn reset(pool: &Pool) -> Result<u64> {
    let client = pool.get().await.context("failed to get db connection")?;

    client
        .execute("DELETE FROM analysis", &[])
        .await
        .context("failed to reset analysis table")
}
