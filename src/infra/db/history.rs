use async_trait::async_trait;
use sqlx::{Postgres, QueryBuilder};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
    application::repos::{HistoryRepo, ListPage, ListScope, RepoError},
    domain::{
        entities::{HistoryEntryRecord, Requester},
        fingerprint::Fingerprint,
        types::{JobStatus, Role},
    },
};

use super::{
    PostgresRepositories, map_sqlx_error,
    util::{RequestColumns, parse_fingerprint, parse_status},
};

#[derive(sqlx::FromRow)]
struct RequesterRow {
    requester_id: String,
    requester_name: String,
    requester_role: String,
}

impl TryFrom<RequesterRow> for Requester {
    type Error = RepoError;

    fn try_from(row: RequesterRow) -> Result<Self, Self::Error> {
        let role = row
            .requester_role
            .parse::<Role>()
            .map_err(|_| RepoError::Integrity {
                message: format!("unknown requester role `{}`", row.requester_role),
            })?;
        Ok(Requester::new(row.requester_id, row.requester_name, role))
    }
}

/// History joined against a job that may already have been reclaimed.
#[derive(sqlx::FromRow)]
struct HistoryRow {
    id: Uuid,
    #[sqlx(flatten)]
    requester: RequesterRow,
    fingerprint: String,
    status: String,
    generated_at: OffsetDateTime,
    width: Option<i32>,
    height: Option<i32>,
    max_iterations: Option<i32>,
    power: Option<f64>,
    c_real: Option<f64>,
    c_imag: Option<f64>,
    scale: Option<f64>,
    offset_x: Option<f64>,
    offset_y: Option<f64>,
    colour_scheme: Option<String>,
}

impl HistoryRow {
    fn request_columns(&mut self) -> Option<RequestColumns> {
        Some(RequestColumns {
            width: self.width?,
            height: self.height?,
            max_iterations: self.max_iterations?,
            power: self.power?,
            c_real: self.c_real?,
            c_imag: self.c_imag?,
            scale: self.scale?,
            offset_x: self.offset_x?,
            offset_y: self.offset_y?,
            colour_scheme: self.colour_scheme.take()?,
        })
    }
}

impl TryFrom<HistoryRow> for HistoryEntryRecord {
    type Error = RepoError;

    fn try_from(mut row: HistoryRow) -> Result<Self, Self::Error> {
        let request = row.request_columns().map(TryInto::try_into).transpose()?;
        Ok(Self {
            id: row.id,
            requester: row.requester.try_into()?,
            fingerprint: parse_fingerprint(&row.fingerprint)?,
            status: parse_status(&row.status)?,
            generated_at: row.generated_at,
            request,
        })
    }
}

const HISTORY_SELECT: &str = "SELECT h.id, h.requester_id, h.requester_name, h.requester_role, \
        h.fingerprint, h.status, h.generated_at, \
        j.width, j.height, j.max_iterations, j.power, j.c_real, j.c_imag, \
        j.scale, j.offset_x, j.offset_y, j.colour_scheme \
   FROM history_entries h \
   LEFT JOIN render_jobs j ON j.fingerprint = h.fingerprint";

fn push_scope(qb: &mut QueryBuilder<'_, Postgres>, scope: &ListScope) {
    if let ListScope::Requester(id) = scope {
        qb.push(" WHERE h.requester_id = ");
        qb.push_bind(id.clone());
    }
}

#[async_trait]
impl HistoryRepo for PostgresRepositories {
    async fn record_history(
        &self,
        requester: &Requester,
        fingerprint: &Fingerprint,
        status: JobStatus,
        at: OffsetDateTime,
    ) -> Result<HistoryEntryRecord, RepoError> {
        let id: Uuid = sqlx::query_scalar(
            "INSERT INTO history_entries \
                 (id, requester_id, requester_name, requester_role, fingerprint, status, generated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (requester_id, fingerprint) \
             DO UPDATE SET status = EXCLUDED.status, requester_name = EXCLUDED.requester_name \
             RETURNING id",
        )
        .bind(Uuid::new_v4())
        .bind(&requester.id)
        .bind(&requester.display_name)
        .bind(requester.role.as_str())
        .bind(fingerprint.as_str())
        .bind(status.as_str())
        .bind(at)
        .fetch_one(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        let sql = format!("{HISTORY_SELECT} WHERE h.id = $1");
        let row = sqlx::query_as::<_, HistoryRow>(&sql)
            .bind(id)
            .fetch_one(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        row.try_into()
    }

    async fn update_history_status(
        &self,
        fingerprint: &Fingerprint,
        status: JobStatus,
    ) -> Result<u64, RepoError> {
        let result = sqlx::query("UPDATE history_entries SET status = $2 WHERE fingerprint = $1")
            .bind(fingerprint.as_str())
            .bind(status.as_str())
            .execute(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        Ok(result.rows_affected())
    }

    async fn requesters_for(&self, fingerprint: &Fingerprint) -> Result<Vec<Requester>, RepoError> {
        let rows = sqlx::query_as::<_, RequesterRow>(
            "SELECT requester_id, requester_name, requester_role FROM history_entries \
             WHERE fingerprint = $1 ORDER BY generated_at ASC, id ASC",
        )
        .bind(fingerprint.as_str())
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        rows.into_iter().map(Requester::try_from).collect()
    }

    async fn list_history(
        &self,
        scope: &ListScope,
        limit: u32,
        offset: u32,
    ) -> Result<ListPage<HistoryEntryRecord>, RepoError> {
        let mut count_qb: QueryBuilder<'_, Postgres> =
            QueryBuilder::new("SELECT COUNT(*) FROM history_entries h");
        push_scope(&mut count_qb, scope);
        let total: i64 = count_qb
            .build_query_scalar()
            .fetch_one(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(HISTORY_SELECT);
        push_scope(&mut qb, scope);
        qb.push(" ORDER BY h.generated_at DESC, h.id ASC LIMIT ");
        qb.push_bind(i64::from(limit));
        qb.push(" OFFSET ");
        qb.push_bind(i64::from(offset));

        let rows = qb
            .build_query_as::<HistoryRow>()
            .fetch_all(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        Ok(ListPage {
            items: rows
                .into_iter()
                .map(HistoryEntryRecord::try_from)
                .collect::<Result<_, _>>()?,
            total_count: Self::convert_count(total)?,
            limit,
            offset,
        })
    }
}
