use std::fs::File;
use std::io;
use std::path::Path;

use csv::{ReaderBuilder, StringRecord};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};
use user_pipeline::{Location, User};

use crate::feed::FeedStats;

/// id, longitude, latitude, email, weight, height, nickname, country, city,
/// caption, gender, dob
pub const FIELD_COUNT: usize = 12;

#[derive(Error, Debug, PartialEq)]
pub enum LineError {
    #[error("expected 12 fields, found {0}")]
    FieldCount(usize),
    #[error("invalid {field}: {value:?}")]
    InvalidNumber { field: &'static str, value: String },
}

fn number<T: std::str::FromStr>(
    line: &StringRecord,
    index: usize,
    field: &'static str,
) -> Result<T, LineError> {
    let value = line.get(index).unwrap_or_default().trim();
    value.parse().map_err(|_| LineError::InvalidNumber {
        field,
        value: value.to_owned(),
    })
}

fn text(line: &StringRecord, index: usize) -> Option<String> {
    line.get(index)
        .filter(|value| !value.is_empty())
        .map(str::to_owned)
}

pub fn parse_line(line: &StringRecord) -> Result<User, LineError> {
    if line.len() != FIELD_COUNT {
        return Err(LineError::FieldCount(line.len()));
    }

    let mut user = User::new(number(line, 0, "id")?);
    let lon: f64 = number(line, 1, "longitude")?;
    let lat: f64 = number(line, 2, "latitude")?;
    if lon == 0.0 || lat == 0.0 {
        warn!(id = user.id, lon, lat, "location is probably wrong");
    }
    user.location = Some(Location { lon, lat });
    user.email = text(line, 3);
    user.weight = Some(number(line, 4, "weight")?);
    user.height = Some(number(line, 5, "height")?);
    user.nickname = text(line, 6);
    user.country = Some(number(line, 7, "country")?);
    user.city = text(line, 8);
    user.caption = text(line, 9);
    user.gender = Some(number(line, 10, "gender")?);
    user.dob = text(line, 11);
    Ok(user)
}

/// Parses `|` delimited user lines into `out`. Bad lines are counted and
/// skipped; only I/O errors end the read early. Blocks, so run it off the runtime.
pub fn read_users<R: io::Read>(
    reader: R,
    out: &mpsc::Sender<User>,
    stats: &FeedStats,
) -> Result<(), csv::Error> {
    let mut reader = ReaderBuilder::new()
        .delimiter(b'|')
        .has_headers(false)
        .flexible(true)
        .from_reader(reader);

    for (index, line) in reader.records().enumerate() {
        let parsed = match line {
            Ok(line) => parse_line(&line).map_err(|e| e.to_string()),
            Err(e) if e.is_io_error() => return Err(e),
            Err(e) => Err(e.to_string()),
        };

        match parsed {
            Ok(user) => {
                if out.blocking_send(user).is_err() {
                    warn!("producer stopped, abandoning the file");
                    return Ok(());
                }
                stats.user_read();
            }
            Err(e) => {
                warn!(line = index + 1, "skipping user line: {}", e);
                stats.read_error();
            }
        }
    }

    let totals = stats.totals();
    info!(read = totals.read, read_errors = totals.read_errors, "finished reading file");
    Ok(())
}

pub fn read_file(
    path: impl AsRef<Path>,
    out: &mpsc::Sender<User>,
    stats: &FeedStats,
) -> Result<(), csv::Error> {
    let file = File::open(path.as_ref())?;
    info!(path = %path.as_ref().display(), "reading users file");
    read_users(file, out, stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourceKind;

    const LINES: &str = "\
1|21.01|52.23|one@example.com|70|180|one|616|Warsaw|hello|1|1980-01-01
2|0|52.23|two@example.com|65|170|two|616|Warsaw||2|0000-00-00
3|21.01|52.23|three@example.com|heavy|170|three|616|Warsaw|x|1|1990-05-05
4|21.01
5|21.01|52.23|five@example.com|80|190|five|616|Krakow|\"quoted\"|1|1975-12-31
";

    fn record(fields: &[&str]) -> StringRecord {
        StringRecord::from(fields.to_vec())
    }

    #[test]
    fn parses_every_column() {
        let user = parse_line(&record(&[
            "7", "2.35", "48.85", "seven@example.com", "70", "180", "seven", "250", "Paris",
            "bonjour", "2", "1984-02-29",
        ]))
        .unwrap();

        assert_eq!(user.id, 7);
        assert_eq!(user.location, Some(Location { lon: 2.35, lat: 48.85 }));
        assert_eq!(user.email.as_deref(), Some("seven@example.com"));
        assert_eq!(user.weight, Some(70));
        assert_eq!(user.height, Some(180));
        assert_eq!(user.nickname.as_deref(), Some("seven"));
        assert_eq!(user.country, Some(250));
        assert_eq!(user.city.as_deref(), Some("Paris"));
        assert_eq!(user.caption.as_deref(), Some("bonjour"));
        assert_eq!(user.gender, Some(2));
        assert_eq!(user.dob.as_deref(), Some("1984-02-29"));
    }

    #[test]
    fn rejects_short_lines_and_bad_numbers() {
        assert_eq!(
            parse_line(&record(&["1", "2"])),
            Err(LineError::FieldCount(2))
        );
        assert_eq!(
            parse_line(&record(&[
                "x", "0", "0", "", "1", "1", "", "1", "", "", "1", ""
            ])),
            Err(LineError::InvalidNumber {
                field: "id",
                value: "x".to_string()
            })
        );
    }

    #[test]
    fn skips_bad_lines_and_keeps_going() {
        let stats = FeedStats::new(SourceKind::Csv, "users");
        let (tx, mut rx) = mpsc::channel(16);

        read_users(LINES.as_bytes(), &tx, &stats).unwrap();
        drop(tx);

        let mut ids = Vec::new();
        while let Ok(user) = rx.try_recv() {
            ids.push(user.id);
        }
        assert_eq!(ids, vec![1, 2, 5]);

        let totals = stats.totals();
        assert_eq!(totals.read, 3);
        assert_eq!(totals.read_errors, 2);
    }

    #[test]
    fn empty_fields_are_absent() {
        let stats = FeedStats::new(SourceKind::Csv, "users");
        let (tx, mut rx) = mpsc::channel(16);
        read_users(LINES.lines().nth(1).unwrap().as_bytes(), &tx, &stats).unwrap();

        let user = rx.try_recv().unwrap();
        assert_eq!(user.caption, None);
        // Placeholder dates are passed through, consumers normalize them
        assert_eq!(user.dob.as_deref(), Some("0000-00-00"));
    }
}
