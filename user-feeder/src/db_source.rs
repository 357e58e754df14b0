use futures::StreamExt;
use sqlx::mysql::{MySqlPool, MySqlPoolOptions};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};
use user_pipeline::{Location, User};

use crate::feed::FeedStats;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("invalid table name {0:?}")]
    InvalidTable(String),
    #[error("invalid key column {0:?}")]
    InvalidKeyColumn(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

/// One row of the users table. Numeric columns are widened in the query so
/// integer column sizes don't matter.
#[derive(sqlx::FromRow, Debug)]
pub struct UserRow {
    pub id: i64,
    pub dob: Option<String>,
    pub weight: Option<i64>,
    pub height: Option<i64>,
    pub nickname: Option<String>,
    pub country: Option<i64>,
    pub city: Option<String>,
    pub caption: Option<String>,
    pub longitude: Option<f64>,
    pub latitude: Option<f64>,
    pub gender: Option<i64>,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        let narrow = |value: Option<i64>| value.and_then(|v| i32::try_from(v).ok());
        let mut user = User::new(row.id);
        user.dob = row.dob;
        user.weight = narrow(row.weight);
        user.height = narrow(row.height);
        user.nickname = row.nickname;
        user.country = narrow(row.country);
        user.city = row.city;
        user.caption = row.caption;
        user.location = match (row.longitude, row.latitude) {
            (Some(lon), Some(lat)) => Some(Location { lon, lat }),
            _ => None,
        };
        user.gender = narrow(row.gender);
        user
    }
}

fn is_identifier(name: &str, allow_qualified: bool) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || (allow_qualified && c == '.'))
}

/// Table and column names can't be bound as parameters, so only plain
/// identifiers are accepted. `key_column` is read as the user id.
pub fn users_query(table: &str, key_column: &str) -> Result<String, DbError> {
    if !is_identifier(table, true) {
        return Err(DbError::InvalidTable(table.to_owned()));
    }
    if !is_identifier(key_column, false) {
        return Err(DbError::InvalidKeyColumn(key_column.to_owned()));
    }

    Ok(format!(
        "SELECT CAST({key_column} AS SIGNED) AS id, CAST(dob AS CHAR) AS dob, \
         CAST(weight AS SIGNED) AS weight, CAST(height AS SIGNED) AS height, nickname, \
         CAST(country AS SIGNED) AS country, city, caption, \
         CAST(longitude AS DOUBLE) AS longitude, CAST(latitude AS DOUBLE) AS latitude, \
         CAST(gender AS SIGNED) AS gender \
         FROM {table} LIMIT ?"
    ))
}

pub async fn connect(database_url: &str) -> Result<MySqlPool, DbError> {
    let pool = MySqlPoolOptions::new()
        .max_connections(1)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Streams up to `limit` users into `out`. Rows that fail to decode are
/// counted and skipped, any other database error ends the read.
pub async fn read_users(
    pool: &MySqlPool,
    table: &str,
    key_column: &str,
    limit: u64,
    out: &mpsc::Sender<User>,
    stats: &FeedStats,
) -> Result<(), DbError> {
    let query = users_query(table, key_column)?;
    info!(table, key_column, limit, "reading users from database");

    let mut rows = sqlx::query_as::<_, UserRow>(&query).bind(limit).fetch(pool);
    while let Some(row) = rows.next().await {
        let row = match row {
            Ok(row) => row,
            Err(e @ (sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_))) => {
                warn!("skipping undecodable user row: {}", e);
                stats.read_error();
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        if out.send(User::from(row)).await.is_err() {
            warn!("producer stopped, abandoning the query");
            return Ok(());
        }
        stats.user_read();
    }

    let totals = stats.totals();
    info!(read = totals.read, read_errors = totals.read_errors, "finished reading database");
    Ok(())
}
