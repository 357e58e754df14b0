use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};
use clickhouse::error::Error as ClickHouseError;
use clickhouse::sql::Identifier;
use clickhouse::{Client, Row};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};
use user_pipeline::error::SinkError;
use user_pipeline::{BulkSink, Record, User};

use crate::config::ClickHouseConfig;

/// ReplacingMergeTree keeps the last inserted row per id once parts merge,
/// which makes re-inserting a redelivered user an upsert.
pub const CREATE_USERS_TABLE: &str = "
CREATE TABLE IF NOT EXISTS ? (
    id Int64,
    email Nullable(String),
    dob Nullable(Date32),
    weight Nullable(Int32),
    height Nullable(Int32),
    nickname Nullable(String),
    country Nullable(Int32),
    city Nullable(String),
    caption Nullable(String),
    longitude Nullable(Float64),
    latitude Nullable(Float64),
    gender Nullable(Int32)
)
ENGINE = ReplacingMergeTree
ORDER BY id";

// Date32 range
const MIN_DOB_YEAR: i32 = 1900;
const MAX_DOB_YEAR: i32 = 2299;

#[derive(Row, Serialize, Debug, Clone, PartialEq)]
pub struct UserRow {
    pub id: i64,
    pub email: Option<String>,
    #[serde(with = "clickhouse::serde::time::date32::option")]
    pub dob: Option<time::Date>,
    pub weight: Option<i32>,
    pub height: Option<i32>,
    pub nickname: Option<String>,
    pub country: Option<i32>,
    pub city: Option<String>,
    pub caption: Option<String>,
    pub longitude: Option<f64>,
    pub latitude: Option<f64>,
    pub gender: Option<i32>,
}

impl From<&User> for UserRow {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            email: user.email.clone(),
            dob: user.date_of_birth().and_then(|dob| storable_date(user.id, dob)),
            weight: user.weight,
            height: user.height,
            nickname: user.nickname.clone(),
            country: user.country,
            city: user.city.clone(),
            caption: user.caption.clone(),
            longitude: user.location.map(|l| l.lon),
            latitude: user.location.map(|l| l.lat),
            gender: user.gender,
        }
    }
}

fn storable_date(id: i64, dob: NaiveDate) -> Option<time::Date> {
    if !(MIN_DOB_YEAR..=MAX_DOB_YEAR).contains(&dob.year()) {
        warn!(id, dob = %dob, "birth date outside the storable range, dropping it");
        return None;
    }
    let month = time::Month::try_from(u8::try_from(dob.month()).ok()?).ok()?;
    let day = u8::try_from(dob.day()).ok()?;
    time::Date::from_calendar_date(dob.year(), month, day).ok()
}

/// Network failures and timeouts may succeed on a later attempt, anything the
/// server rejected will not.
pub fn classify(error: ClickHouseError) -> SinkError {
    match error {
        ClickHouseError::Network(_) | ClickHouseError::TimedOut => {
            SinkError::Retryable(error.to_string())
        }
        other => SinkError::Fatal(other.to_string()),
    }
}

pub struct ClickHouseSink {
    client: Client,
    table: String,
}

#[derive(Error, Debug)]
pub enum SetupError {
    #[error("invalid table name {0:?}")]
    InvalidTable(String),
    #[error(transparent)]
    ClickHouse(#[from] ClickHouseError),
}

/// Inserts name the table verbatim, so only plain (optionally database
/// qualified) identifiers are accepted.
fn valid_table(table: &str) -> bool {
    table.split('.').all(|part| {
        !part.is_empty() && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
    })
}

impl ClickHouseSink {
    pub fn new(config: &ClickHouseConfig) -> Result<Self, SetupError> {
        if !valid_table(&config.clickhouse_table) {
            return Err(SetupError::InvalidTable(config.clickhouse_table.clone()));
        }

        let client = Client::default()
            .with_url(config.clickhouse_url.clone())
            .with_database(config.clickhouse_database.clone())
            .with_user(config.clickhouse_user.clone())
            .with_password(config.clickhouse_password.clone());

        Ok(Self {
            client,
            table: config.clickhouse_table.clone(),
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub async fn ensure_table(&self) -> Result<(), SetupError> {
        self.client
            .query(CREATE_USERS_TABLE)
            .bind(Identifier(&self.table))
            .execute()
            .await?;
        info!(table = %self.table, "users table ready");
        Ok(())
    }
}

#[async_trait]
impl BulkSink<User> for ClickHouseSink {
    fn name(&self) -> &str {
        "clickhouse"
    }

    async fn write_batch(&self, records: &[Record<User>]) -> Result<(), SinkError> {
        let mut insert = self.client.insert::<UserRow>(&self.table).map_err(classify)?;
        for record in records {
            insert
                .write(&UserRow::from(record.payload()))
                .await
                .map_err(classify)?;
        }
        insert.end().await.map_err(classify)?;

        debug!(table = %self.table, batch_size = records.len(), "inserted users");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use envconfig::Envconfig;
    use user_pipeline::Location;

    use super::*;

    fn config_with_table(table: &str) -> ClickHouseConfig {
        let env = HashMap::from([("CLICKHOUSE_TABLE".to_string(), table.to_string())]);
        ClickHouseConfig::init_from_hashmap(&env).unwrap()
    }

    #[test]
    fn only_plain_table_names_are_accepted() {
        let sink = ClickHouseSink::new(&config_with_table("analytics.users")).unwrap();
        assert_eq!(sink.table(), "analytics.users");

        for table in ["", "users; DROP TABLE users", "users.", "`users`"] {
            assert!(matches!(
                ClickHouseSink::new(&config_with_table(table)),
                Err(SetupError::InvalidTable(_))
            ));
        }
    }

    #[test]
    fn maps_every_user_field_to_a_column() {
        let mut user = User::new(9);
        user.email = Some("nine@example.com".to_string());
        user.dob = Some("1984-02-29".to_string());
        user.weight = Some(70);
        user.height = Some(180);
        user.nickname = Some("nine".to_string());
        user.country = Some(250);
        user.city = Some("Paris".to_string());
        user.caption = Some("hi".to_string());
        user.location = Some(Location { lon: 2.35, lat: 48.85 });
        user.gender = Some(1);

        let row = UserRow::from(&user);
        assert_eq!(
            row,
            UserRow {
                id: 9,
                email: Some("nine@example.com".to_string()),
                dob: Some(time::macros::date!(1984 - 02 - 29)),
                weight: Some(70),
                height: Some(180),
                nickname: Some("nine".to_string()),
                country: Some(250),
                city: Some("Paris".to_string()),
                caption: Some("hi".to_string()),
                longitude: Some(2.35),
                latitude: Some(48.85),
                gender: Some(1),
            }
        );
    }

    #[test]
    fn absent_fields_become_nulls() {
        let row = UserRow::from(&User::new(3));
        assert_eq!(row.id, 3);
        assert_eq!(row.dob, None);
        assert_eq!(row.longitude, None);
        assert_eq!(row.latitude, None);
        assert_eq!(row.email, None);
    }

    #[test]
    fn unstorable_birth_dates_are_dropped() {
        let mut user = User::new(4);
        user.dob = Some("1850-06-01".to_string());
        assert_eq!(UserRow::from(&user).dob, None);
    }

    #[test]
    fn only_transport_errors_are_retryable() {
        assert!(classify(ClickHouseError::TimedOut).is_retryable());
        assert!(!classify(ClickHouseError::BadResponse(
            "Code: 60. DB::Exception: Table default.users does not exist".to_string()
        ))
        .is_retryable());
    }

    #[test]
    fn creates_a_replacing_table_keyed_by_id() {
        assert!(CREATE_USERS_TABLE.contains("CREATE TABLE IF NOT EXISTS ?"));
        assert!(CREATE_USERS_TABLE.contains("ENGINE = ReplacingMergeTree"));
        assert!(CREATE_USERS_TABLE.trim_end().ends_with("ORDER BY id"));
    }
}
