use crate::{
    application::repos::RepoError,
    domain::{
        fingerprint::Fingerprint,
        request::{ComplexParam, RenderRequest},
        types::{ColourScheme, JobStatus},
    },
};

pub fn map_sqlx_error(err: sqlx::Error) -> RepoError {
    match err {
        sqlx::Error::RowNotFound => RepoError::NotFound,
        sqlx::Error::Database(db)
            if db.is_unique_violation() || db.message().contains("duplicate key") =>
        {
            RepoError::Duplicate {
                constraint: db.constraint().unwrap_or("unknown").to_string(),
            }
        }
        sqlx::Error::Database(db)
            if db.message().contains("violates foreign key constraint")
                || db.message().contains("invalid input syntax") =>
        {
            RepoError::InvalidInput {
                message: db.message().to_string(),
            }
        }
        sqlx::Error::Database(db) if db.message().contains("violates") => RepoError::Integrity {
            message: db.message().to_string(),
        },
        sqlx::Error::Database(db)
            if db
                .message()
                .contains("canceling statement due to user request") =>
        {
            RepoError::Timeout
        }
        other => RepoError::from_persistence(other),
    }
}

/// The render-parameter columns shared by every query that joins `render_jobs`.
#[derive(sqlx::FromRow)]
pub(super) struct RequestColumns {
    pub width: i32,
    pub height: i32,
    pub max_iterations: i32,
    pub power: f64,
    pub c_real: f64,
    pub c_imag: f64,
    pub scale: f64,
    pub offset_x: f64,
    pub offset_y: f64,
    pub colour_scheme: String,
}

impl TryFrom<RequestColumns> for RenderRequest {
    type Error = RepoError;

    fn try_from(row: RequestColumns) -> Result<Self, Self::Error> {
        let colour_scheme = row.colour_scheme.parse::<ColourScheme>().map_err(|_| {
            RepoError::Integrity {
                message: format!("unknown colour scheme `{}`", row.colour_scheme),
            }
        })?;
        Ok(Self {
            width: to_u32("width", row.width)?,
            height: to_u32("height", row.height)?,
            max_iterations: to_u32("max_iterations", row.max_iterations)?,
            power: row.power,
            c: ComplexParam {
                real: row.c_real,
                imag: row.c_imag,
            },
            scale: row.scale,
            offset_x: row.offset_x,
            offset_y: row.offset_y,
            colour_scheme,
        })
    }
}

pub(super) fn to_u32(column: &str, value: i32) -> Result<u32, RepoError> {
    u32::try_from(value).map_err(|_| RepoError::Integrity {
        message: format!("column `{column}` holds negative value {value}"),
    })
}

pub(super) fn to_i32(column: &str, value: u32) -> Result<i32, RepoError> {
    i32::try_from(value).map_err(|_| RepoError::InvalidInput {
        message: format!("`{column}` value {value} exceeds supported range"),
    })
}

pub(super) fn parse_fingerprint(raw: &str) -> Result<Fingerprint, RepoError> {
    Fingerprint::parse(raw).map_err(|err| RepoError::Integrity {
        message: err.to_string(),
    })
}

pub(super) fn parse_status(raw: &str) -> Result<JobStatus, RepoError> {
    JobStatus::try_from(raw).map_err(|_| RepoError::Integrity {
        message: format!("unknown job status `{raw}`"),
    })
}
