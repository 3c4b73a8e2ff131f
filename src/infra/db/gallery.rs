use async_trait::async_trait;
use sqlx::{Postgres, QueryBuilder};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
    application::repos::{
        GalleryFilter, GalleryQuery, GalleryRepo, GallerySortKey, ListPage, ListScope, RepoError,
    },
    domain::{
        entities::{GalleryEntryRecord, GalleryItem},
        fingerprint::Fingerprint,
    },
};

use super::{
    PostgresRepositories, map_sqlx_error,
    util::{RequestColumns, parse_fingerprint, to_i32},
};

const ENTRY_COLUMNS: &str = "id, requester_id, fingerprint, added_at";

#[derive(sqlx::FromRow)]
struct EntryRow {
    id: Uuid,
    requester_id: String,
    fingerprint: String,
    added_at: OffsetDateTime,
}

impl TryFrom<EntryRow> for GalleryEntryRecord {
    type Error = RepoError;

    fn try_from(row: EntryRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            requester_id: row.requester_id,
            fingerprint: parse_fingerprint(&row.fingerprint)?,
            added_at: row.added_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ItemRow {
    #[sqlx(flatten)]
    entry: EntryRow,
    #[sqlx(flatten)]
    request: RequestColumns,
    artifact_key: Option<String>,
}

impl TryFrom<ItemRow> for GalleryItem {
    type Error = RepoError;

    fn try_from(row: ItemRow) -> Result<Self, Self::Error> {
        Ok(Self {
            entry: row.entry.try_into()?,
            request: row.request.try_into()?,
            artifact_key: row.artifact_key,
            url: None,
        })
    }
}

fn sort_column(key: GallerySortKey) -> &'static str {
    match key {
        GallerySortKey::AddedAt => "g.added_at",
        GallerySortKey::Width => "j.width",
        GallerySortKey::Height => "j.height",
        GallerySortKey::Iterations => "j.max_iterations",
        GallerySortKey::Power => "j.power",
        GallerySortKey::Scale => "j.scale",
        GallerySortKey::ColourScheme => "j.colour_scheme",
    }
}

fn push_conditions(
    qb: &mut QueryBuilder<'_, Postgres>,
    scope: &ListScope,
    filter: &GalleryFilter,
) -> Result<(), RepoError> {
    qb.push(" WHERE 1=1");
    if let ListScope::Requester(id) = scope {
        qb.push(" AND g.requester_id = ");
        qb.push_bind(id.clone());
    }
    if let Some(scheme) = filter.colour_scheme {
        qb.push(" AND j.colour_scheme = ");
        qb.push_bind(scheme.as_str());
    }
    if let Some(power) = filter.power {
        qb.push(" AND j.power = ");
        qb.push_bind(power);
    }
    if let Some(iterations) = filter.iterations {
        qb.push(" AND j.max_iterations = ");
        qb.push_bind(to_i32("iterations", iterations)?);
    }
    if let Some(width) = filter.width {
        qb.push(" AND j.width = ");
        qb.push_bind(to_i32("width", width)?);
    }
    if let Some(height) = filter.height {
        qb.push(" AND j.height = ");
        qb.push_bind(to_i32("height", height)?);
    }
    Ok(())
}

#[async_trait]
impl GalleryRepo for PostgresRepositories {
    async fn add_to_gallery(
        &self,
        requester_id: &str,
        fingerprint: &Fingerprint,
        added_at: OffsetDateTime,
    ) -> Result<GalleryEntryRecord, RepoError> {
        let sql = format!(
            "INSERT INTO gallery_entries ({ENTRY_COLUMNS}) VALUES ($1, $2, $3, $4) \
             ON CONFLICT (requester_id, fingerprint) DO NOTHING \
             RETURNING {ENTRY_COLUMNS}"
        );
        let inserted = sqlx::query_as::<_, EntryRow>(&sql)
            .bind(Uuid::new_v4())
            .bind(requester_id)
            .bind(fingerprint.as_str())
            .bind(added_at)
            .fetch_optional(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        let row = match inserted {
            Some(row) => row,
            None => {
                let sql = format!(
                    "SELECT {ENTRY_COLUMNS} FROM gallery_entries \
                     WHERE requester_id = $1 AND fingerprint = $2"
                );
                sqlx::query_as::<_, EntryRow>(&sql)
                    .bind(requester_id)
                    .bind(fingerprint.as_str())
                    .fetch_one(self.pool())
                    .await
                    .map_err(map_sqlx_error)?
            }
        };

        row.try_into()
    }

    async fn find_gallery_entry(&self, id: Uuid) -> Result<Option<GalleryEntryRecord>, RepoError> {
        let sql = format!("SELECT {ENTRY_COLUMNS} FROM gallery_entries WHERE id = $1");
        let row = sqlx::query_as::<_, EntryRow>(&sql)
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        row.map(GalleryEntryRecord::try_from).transpose()
    }

    async fn delete_gallery_entry(&self, id: Uuid) -> Result<bool, RepoError> {
        let result = sqlx::query("DELETE FROM gallery_entries WHERE id = $1")
            .bind(id)
            .execute(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn count_gallery_references(&self, fingerprint: &Fingerprint) -> Result<u64, RepoError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM gallery_entries WHERE fingerprint = $1")
                .bind(fingerprint.as_str())
                .fetch_one(self.pool())
                .await
                .map_err(map_sqlx_error)?;

        Self::convert_count(count)
    }

    async fn list_gallery(
        &self,
        scope: &ListScope,
        query: &GalleryQuery,
    ) -> Result<ListPage<GalleryItem>, RepoError> {
        let mut count_qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(
            "SELECT COUNT(*) FROM gallery_entries g \
             INNER JOIN render_jobs j ON j.fingerprint = g.fingerprint",
        );
        push_conditions(&mut count_qb, scope, &query.filter)?;
        let total: i64 = count_qb
            .build_query_scalar()
            .fetch_one(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(
            "SELECT g.id, g.requester_id, g.fingerprint, g.added_at, \
                    j.width, j.height, j.max_iterations, j.power, j.c_real, j.c_imag, \
                    j.scale, j.offset_x, j.offset_y, j.colour_scheme, j.artifact_key \
               FROM gallery_entries g \
              INNER JOIN render_jobs j ON j.fingerprint = g.fingerprint",
        );
        push_conditions(&mut qb, scope, &query.filter)?;
        // Column and direction come from closed enums, never from caller text.
        qb.push(" ORDER BY ");
        qb.push(sort_column(query.sort_by));
        qb.push(" ");
        qb.push(query.sort_order.as_str());
        qb.push(", g.id ASC LIMIT ");
        qb.push_bind(i64::from(query.limit));
        qb.push(" OFFSET ");
        qb.push_bind(i64::from(query.offset));

        let rows = qb
            .build_query_as::<ItemRow>()
            .fetch_all(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        Ok(ListPage {
            items: rows
                .into_iter()
                .map(GalleryItem::try_from)
                .collect::<Result<_, _>>()?,
            total_count: Self::convert_count(total)?,
            limit: query.limit,
            offset: query.offset,
        })
    }
}
