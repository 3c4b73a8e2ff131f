use async_trait::async_trait;
use sqlx::{Postgres, QueryBuilder};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
    application::repos::{LedgerRepo, NewJobRecord, RepoError, TransitionJobParams},
    domain::{entities::JobRecord, fingerprint::Fingerprint, types::JobStatus},
};

use super::{
    PostgresRepositories, map_sqlx_error,
    util::{RequestColumns, parse_fingerprint, parse_status, to_i32},
};

pub(super) const JOB_COLUMNS: &str = "id, fingerprint, width, height, max_iterations, power, \
    c_real, c_imag, scale, offset_x, offset_y, colour_scheme, status, retry_count, created_at, \
    last_updated, artifact_key";

#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    fingerprint: String,
    #[sqlx(flatten)]
    request: RequestColumns,
    status: String,
    retry_count: i32,
    created_at: OffsetDateTime,
    last_updated: OffsetDateTime,
    artifact_key: Option<String>,
}

impl TryFrom<JobRow> for JobRecord {
    type Error = RepoError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            fingerprint: parse_fingerprint(&row.fingerprint)?,
            request: row.request.try_into()?,
            status: parse_status(&row.status)?,
            retry_count: row.retry_count,
            created_at: row.created_at,
            last_updated: row.last_updated,
            artifact_key: row.artifact_key,
        })
    }
}

fn status_names(statuses: &[JobStatus]) -> Vec<String> {
    statuses.iter().map(|status| status.as_str().to_string()).collect()
}

#[async_trait]
impl LedgerRepo for PostgresRepositories {
    async fn insert_job(&self, job: NewJobRecord) -> Result<JobRecord, RepoError> {
        let request = job.request;
        let sql = format!(
            "INSERT INTO render_jobs (id, fingerprint, width, height, max_iterations, power, \
                 c_real, c_imag, scale, offset_x, offset_y, colour_scheme, status, retry_count, \
                 created_at, last_updated, artifact_key) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, 0, $14, $14, NULL) \
             RETURNING {JOB_COLUMNS}"
        );

        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(job.id)
            .bind(job.fingerprint.as_str())
            .bind(to_i32("width", request.width)?)
            .bind(to_i32("height", request.height)?)
            .bind(to_i32("max_iterations", request.max_iterations)?)
            .bind(request.power)
            .bind(request.c.real)
            .bind(request.c.imag)
            .bind(request.scale)
            .bind(request.offset_x)
            .bind(request.offset_y)
            .bind(request.colour_scheme.as_str())
            .bind(JobStatus::Pending.as_str())
            .bind(job.created_at)
            .fetch_one(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        JobRecord::try_from(row)
    }

    async fn find_job(&self, fingerprint: &Fingerprint) -> Result<Option<JobRecord>, RepoError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM render_jobs WHERE fingerprint = $1");
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(fingerprint.as_str())
            .fetch_optional(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        row.map(JobRecord::try_from).transpose()
    }

    async fn transition_job(
        &self,
        params: TransitionJobParams,
    ) -> Result<Option<JobRecord>, RepoError> {
        let TransitionJobParams {
            fingerprint,
            from,
            to,
            expected_updated_at,
            increment_retry,
            artifact_key,
            at,
        } = params;

        let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new("UPDATE render_jobs SET status = ");
        qb.push_bind(to.as_str());
        if increment_retry {
            qb.push(", retry_count = retry_count + 1");
        }
        qb.push(", artifact_key = ");
        qb.push_bind(artifact_key);
        qb.push(", last_updated = ");
        qb.push_bind(at);
        qb.push(" WHERE fingerprint = ");
        qb.push_bind(fingerprint.as_str());
        qb.push(" AND status = ANY(");
        qb.push_bind(status_names(&from));
        qb.push(")");
        if let Some(expected) = expected_updated_at {
            qb.push(" AND last_updated = ");
            qb.push_bind(expected);
        }
        qb.push(" RETURNING ");
        qb.push(JOB_COLUMNS);

        let row = qb
            .build_query_as::<JobRow>()
            .fetch_optional(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        row.map(JobRecord::try_from).transpose()
    }

    async fn delete_job(&self, fingerprint: &Fingerprint) -> Result<bool, RepoError> {
        let result = sqlx::query("DELETE FROM render_jobs WHERE fingerprint = $1")
            .bind(fingerprint.as_str())
            .execute(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_jobs_in(
        &self,
        statuses: &[JobStatus],
        limit: u32,
    ) -> Result<Vec<JobRecord>, RepoError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM render_jobs \
             WHERE status = ANY($1) ORDER BY last_updated ASC LIMIT $2"
        );
        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .bind(status_names(statuses))
            .bind(i64::from(limit))
            .fetch_all(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        rows.into_iter().map(JobRecord::try_from).collect()
    }
}
