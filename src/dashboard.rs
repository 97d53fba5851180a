//! The bike-share dashboard's queries.
//!
//! Each definition renders SQL over the configured trips table and turns the
//! database's rows (columns named like `count_star()` or
//! `dayofweek(start_time)`) into the view model a chart or map consumes.
//!
//! Distributions that a view can draw empty fall back to zero-filled values
//! when the backend fails; everything else surfaces a [`QueryFailure`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{ClientConfig, DEFAULT_TABLE_NAME};
use crate::raw::{RawResult, Row};
use crate::registry::QueryRegistry;
use crate::QueryDefinition;

/// Station identifier.
pub type StationId = i64;

const COUNT: &str = "count_star()";

/// Why a dashboard query has no usable value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueryFailure {
    /// The database reported an error.
    #[error("backend error: {message}")]
    Backend {
        /// Message from the database.
        message: String,
    },
    /// A row lacked a column, or it had an unexpected type.
    #[error("missing or malformed column {column}")]
    BadColumn {
        /// Column name.
        column: String,
    },
    /// The query returned no rows where one was required.
    #[error("no rows returned")]
    NoRows,
}

fn rows(raw: &RawResult) -> Result<&[Row], QueryFailure> {
    match raw {
        RawResult::Rows(rows) => Ok(rows),
        RawResult::Error(err) => Err(QueryFailure::Backend {
            message: err.message.clone(),
        }),
    }
}

fn first_row(raw: &RawResult) -> Result<&Row, QueryFailure> {
    rows(raw)?.first().ok_or(QueryFailure::NoRows)
}

fn bad_column(column: &str) -> QueryFailure {
    QueryFailure::BadColumn {
        column: column.to_string(),
    }
}

/// Integer column. Large integers may arrive as strings.
fn int_column(row: &Row, column: &str) -> Result<i64, QueryFailure> {
    match row.get(column) {
        Some(Value::Number(n)) => n.as_i64().ok_or_else(|| bad_column(column)),
        Some(Value::String(s)) => s.parse().map_err(|_| bad_column(column)),
        _ => Err(bad_column(column)),
    }
}

fn count_column(row: &Row) -> Result<u64, QueryFailure> {
    let count = int_column(row, COUNT)?;
    u64::try_from(count).map_err(|_| bad_column(COUNT))
}

fn float_column(row: &Row, column: &str) -> Result<f64, QueryFailure> {
    row.get(column)
        .and_then(Value::as_f64)
        .ok_or_else(|| bad_column(column))
}

fn str_column<'a>(row: &'a Row, column: &str) -> Result<&'a str, QueryFailure> {
    row.get(column)
        .and_then(Value::as_str)
        .ok_or_else(|| bad_column(column))
}

macro_rules! table_queries {
    ($($(#[$meta:meta])* $name:ident),* $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, PartialEq, Eq)]
            pub struct $name {
                table: String,
            }

            impl $name {
                /// Create the definition over `table`.
                pub fn new(table: impl Into<String>) -> Self {
                    Self { table: table.into() }
                }
            }

            impl Default for $name {
                fn default() -> Self {
                    Self::new(DEFAULT_TABLE_NAME)
                }
            }
        )*
    };
}

table_queries! {
    /// Total number of trips.
    TotalTrips,
    /// First and last trip start time.
    TripsTimerange,
    /// Largest trip count of any (hour of day, start station) pair; used to
    /// scale the hourly charts.
    MaxHourlyTrips,
    /// Every start station with its location.
    StationsMetadata,
    /// Trips from one station, counted by end station.
    TripCountsByEndStation,
    /// Trips from one station, counted by user type.
    TripCountsByUserType,
    /// Trips from one station, counted by day of week and hour of day.
    TripCountsByDayHour,
    /// Trips from one station, counted by rider birth year.
    TripCountsByUserBirthYear,
}

impl QueryDefinition for TotalTrips {
    const NAME: &'static str = "totalTrips";
    type Args = ();
    type Output = Result<u64, QueryFailure>;

    fn query_string(&self, _args: &()) -> String {
        format!("SELECT COUNT(*) FROM {}", self.table)
    }

    fn transform(&self, raw: &RawResult, _args: &()) -> Self::Output {
        count_column(first_row(raw)?)
    }
}

/// Span of trip start times, as the database formats timestamps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timerange {
    /// Earliest start time.
    pub start: String,
    /// Latest start time.
    pub end: String,
}

impl QueryDefinition for TripsTimerange {
    const NAME: &'static str = "tripsTimerange";
    type Args = ();
    type Output = Result<Timerange, QueryFailure>;

    fn query_string(&self, _args: &()) -> String {
        format!(
            "SELECT min(start_time), max(start_time) FROM {}",
            self.table
        )
    }

    fn transform(&self, raw: &RawResult, _args: &()) -> Self::Output {
        let row = first_row(raw)?;
        Ok(Timerange {
            start: str_column(row, "min(start_time)")?.to_string(),
            end: str_column(row, "max(start_time)")?.to_string(),
        })
    }
}

impl QueryDefinition for MaxHourlyTrips {
    const NAME: &'static str = "maxHourlyTrips";
    type Args = ();
    type Output = Result<u64, QueryFailure>;

    fn query_string(&self, _args: &()) -> String {
        format!(
            "SELECT COUNT(*) FROM {} GROUP BY HOUR(start_time), start_station_id",
            self.table
        )
    }

    fn transform(&self, raw: &RawResult, _args: &()) -> Self::Output {
        rows(raw)?
            .iter()
            .try_fold(0, |max, row| -> Result<u64, QueryFailure> {
                Ok(max.max(count_column(row)?))
            })
    }
}

/// A start station and its location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationMetadata {
    /// Station id.
    pub id: StationId,
    /// Latitude in degrees.
    pub latitude: f64,
    /// Longitude in degrees.
    pub longitude: f64,
    /// Display name.
    pub name: String,
}

impl QueryDefinition for StationsMetadata {
    const NAME: &'static str = "stationsMetadata";
    type Args = ();
    type Output = Result<Vec<StationMetadata>, QueryFailure>;

    fn query_string(&self, _args: &()) -> String {
        format!(
            "SELECT DISTINCT start_station_id, start_station_name, start_station_latitude, start_station_longitude FROM {}",
            self.table
        )
    }

    fn transform(&self, raw: &RawResult, _args: &()) -> Self::Output {
        rows(raw)?
            .iter()
            .map(|row| -> Result<StationMetadata, QueryFailure> {
                Ok(StationMetadata {
                    id: int_column(row, "start_station_id")?,
                    latitude: float_column(row, "start_station_latitude")?,
                    longitude: float_column(row, "start_station_longitude")?,
                    name: str_column(row, "start_station_name")?.to_string(),
                })
            })
            .collect()
    }
}

/// Trip counts from a station to each end station.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndStationCounts {
    /// The start station.
    pub station_id: StationId,
    /// End station id to trip count.
    pub trip_count_by_end_station: BTreeMap<StationId, u64>,
}

impl QueryDefinition for TripCountsByEndStation {
    const NAME: &'static str = "tripCountsByEndStation";
    type Args = StationId;
    type Output = Result<EndStationCounts, QueryFailure>;

    fn query_string(&self, station: &StationId) -> String {
        format!(
            "SELECT end_station_id, COUNT(*) FROM {} WHERE start_station_id={} GROUP BY end_station_id",
            self.table, station
        )
    }

    fn transform(&self, raw: &RawResult, station: &StationId) -> Self::Output {
        let trip_count_by_end_station = rows(raw)?
            .iter()
            .map(|row| -> Result<_, QueryFailure> {
                Ok((int_column(row, "end_station_id")?, count_column(row)?))
            })
            .collect::<Result<_, QueryFailure>>()?;
        Ok(EndStationCounts {
            station_id: *station,
            trip_count_by_end_station,
        })
    }
}

/// Trip counts from a station by user type.
///
/// Both types are always present; a failed query reads as zero trips.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserTypeCounts {
    /// The start station.
    pub station_id: StationId,
    /// Trips by annual members.
    pub subscriber: u64,
    /// Trips by single-ride customers.
    pub customer: u64,
}

impl QueryDefinition for TripCountsByUserType {
    const NAME: &'static str = "tripCountsByUserType";
    type Args = StationId;
    type Output = UserTypeCounts;

    fn query_string(&self, station: &StationId) -> String {
        format!(
            "SELECT user_type, COUNT(*) FROM {} WHERE start_station_id={} GROUP BY user_type",
            self.table, station
        )
    }

    fn transform(&self, raw: &RawResult, station: &StationId) -> Self::Output {
        let mut counts = UserTypeCounts {
            station_id: *station,
            ..Default::default()
        };
        let Some(rows) = raw.rows() else {
            tracing::warn!(query = Self::NAME, station, "backend error; showing zero counts");
            return counts;
        };
        for row in rows {
            let (Ok(user_type), Ok(count)) = (str_column(row, "user_type"), count_column(row))
            else {
                tracing::warn!(query = Self::NAME, ?row, "skipping malformed row");
                continue;
            };
            match user_type {
                "Subscriber" => counts.subscriber = count,
                "Customer" => counts.customer = count,
                other => tracing::debug!(query = Self::NAME, user_type = other, "ignoring user type"),
            }
        }
        counts
    }
}

/// Days in a week, indexed from the database's `dayofweek` (0 = Sunday).
pub const DAYS_PER_WEEK: usize = 7;
/// Hours in a day.
pub const HOURS_PER_DAY: usize = 24;

/// Trip counts from a station by day of week and hour of day.
///
/// Zero-filled; a failed query reads as zero trips everywhere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayHourCounts {
    /// The start station.
    pub station_id: StationId,
    /// `trip_count_by_day[day][hour]`.
    pub trip_count_by_day: [[u64; HOURS_PER_DAY]; DAYS_PER_WEEK],
}

impl QueryDefinition for TripCountsByDayHour {
    const NAME: &'static str = "tripCountsByDayHour";
    type Args = StationId;
    type Output = DayHourCounts;

    fn query_string(&self, station: &StationId) -> String {
        format!(
            "SELECT DAYOFWEEK(start_time), HOUR(start_time), COUNT(*) FROM {} WHERE start_station_id={} GROUP BY DAYOFWEEK(start_time), HOUR(start_time)",
            self.table, station
        )
    }

    fn transform(&self, raw: &RawResult, station: &StationId) -> Self::Output {
        let mut counts = DayHourCounts {
            station_id: *station,
            trip_count_by_day: [[0; HOURS_PER_DAY]; DAYS_PER_WEEK],
        };
        let Some(rows) = raw.rows() else {
            tracing::warn!(query = Self::NAME, station, "backend error; showing zero counts");
            return counts;
        };
        for row in rows {
            let cell = int_column(row, "dayofweek(start_time)")
                .and_then(|day| Ok((day, int_column(row, "hour(start_time)")?, count_column(row)?)));
            let Ok((day, hour, count)) = cell else {
                tracing::warn!(query = Self::NAME, ?row, "skipping malformed row");
                continue;
            };
            let slot = usize::try_from(day)
                .ok()
                .zip(usize::try_from(hour).ok())
                .and_then(|(day, hour)| counts.trip_count_by_day.get_mut(day)?.get_mut(hour));
            match slot {
                Some(slot) => *slot = count,
                None => tracing::warn!(query = Self::NAME, day, hour, "day or hour out of range"),
            }
        }
        counts
    }
}

/// Trip counts from a station by rider birth year.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BirthYearCounts {
    /// The start station.
    pub station_id: StationId,
    /// Birth year to trip count.
    pub trip_count_by_user_birth_year: BTreeMap<i64, u64>,
}

impl QueryDefinition for TripCountsByUserBirthYear {
    const NAME: &'static str = "tripCountsByUserBirthYear";
    type Args = StationId;
    type Output = Result<BirthYearCounts, QueryFailure>;

    fn query_string(&self, station: &StationId) -> String {
        format!(
            "SELECT birth_year, COUNT(*) FROM {} WHERE start_station_id={} GROUP BY birth_year",
            self.table, station
        )
    }

    fn transform(&self, raw: &RawResult, station: &StationId) -> Self::Output {
        let trip_count_by_user_birth_year = rows(raw)?
            .iter()
            .map(|row| -> Result<_, QueryFailure> {
                Ok((int_column(row, "birth_year")?, count_column(row)?))
            })
            .collect::<Result<_, QueryFailure>>()?;
        Ok(BirthYearCounts {
            station_id: *station,
            trip_count_by_user_birth_year,
        })
    }
}

/// Register every dashboard query over the configured table.
pub fn register_dashboard_queries(registry: &mut QueryRegistry, config: &ClientConfig) {
    let table = config.table_name.as_str();
    registry
        .register(TotalTrips::new(table))
        .register(TripsTimerange::new(table))
        .register(MaxHourlyTrips::new(table))
        .register(StationsMetadata::new(table))
        .register(TripCountsByEndStation::new(table))
        .register(TripCountsByUserType::new(table))
        .register(TripCountsByDayHour::new(table))
        .register(TripCountsByUserBirthYear::new(table));
}

/// A registry holding every dashboard query.
pub fn dashboard_registry(config: &ClientConfig) -> QueryRegistry {
    let mut registry = QueryRegistry::new();
    register_dashboard_queries(&mut registry, config);
    registry
}
