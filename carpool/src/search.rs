//! Ride and request search over Postgres projections. The haversine
//! distance is computed directly in SQL over `double precision` lon/lat
//! columns rather than via a geo-indexed document store — see `DESIGN.md`
//! for why this keeps the workspace on its existing `sqlx`/Postgres stack.

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use sqlx::PgPool;

use crate::types::{AirportId, Direction, GeoPoint, Money, RideId, UserId};

pub const DEFAULT_RADIUS_METERS: f64 = 8000.0;
pub const MAX_PAGE_LIMIT: u32 = 100;

#[derive(Clone, Debug, Default)]
pub struct RideSearchQuery {
    pub airport_id: AirportId,
    pub direction: Option<Direction>,
    pub date: Option<NaiveDate>,
    pub min_seats: Option<u32>,
    pub pickup_point: Option<GeoPoint>,
    pub radius_meters: Option<f64>,
    pub page: u32,
    pub limit: u32,
}

#[derive(Clone, Debug, Serialize)]
pub struct RideSearchResult {
    pub ride_id: RideId,
    pub driver_id: UserId,
    pub departure_at: DateTime<Utc>,
    pub seats_left: u32,
    pub luggage_left: u32,
    pub price_per_seat: Money,
    pub distance_meters: Option<f64>,
}

#[derive(Clone, Debug)]
pub struct RequestSearchQuery {
    pub driver_id: UserId,
    pub airport_id: Option<AirportId>,
    pub direction: Option<Direction>,
    pub date: Option<NaiveDate>,
    pub pickup_point: Option<GeoPoint>,
    pub radius_meters: Option<f64>,
    pub page: u32,
    pub limit: u32,
}

#[derive(Clone, Debug, Serialize)]
pub struct RequestSearchResult {
    pub request_id: crate::types::RideRequestId,
    pub passenger_id: UserId,
    pub airport_id: AirportId,
    pub direction: Direction,
    pub earliest_at: DateTime<Utc>,
    pub latest_at: DateTime<Utc>,
    pub seats: u32,
    pub luggage: u32,
    pub distance_meters: Option<f64>,
    pub has_user_offered: bool,
}

/// Haversine great-circle distance between two `(lon, lat)` points, in
/// meters, expressed as a SQL fragment operating on bound parameters
/// `$lon`/`$lat` against the columns named by `lon_col`/`lat_col`.
fn haversine_sql(lon_param: &str, lat_param: &str, lon_col: &str, lat_col: &str) -> String {
    format!(
        "6371000 * 2 * asin(sqrt(
            power(sin(radians({lat_col} - {lat_param}) / 2), 2) +
            cos(radians({lat_param})) * cos(radians({lat_col})) *
            power(sin(radians({lon_col} - {lon_param}) / 2), 2)
        ))"
    )
}

pub struct SearchService {
    pool: PgPool,
}

impl SearchService {
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Searches published, not-yet-departed rides. With a `pickup_point`,
    /// orders by distance to the ride's nearest route point (bounded by
    /// `radius_meters`); otherwise orders by `departure_at` ascending,
    /// filtered to the given calendar day in UTC or, absent a date, to the
    /// future.
    ///
    /// # Errors
    ///
    /// Returns an error if the query cannot be executed.
    pub async fn search_rides(
        &self,
        query: &RideSearchQuery,
    ) -> Result<Vec<RideSearchResult>, sqlx::Error> {
        let limit = query.limit.min(MAX_PAGE_LIMIT).max(1);
        let offset = query.page.saturating_mul(limit);

        if let Some(pickup) = query.pickup_point {
            let radius = query.radius_meters.unwrap_or(DEFAULT_RADIUS_METERS);
            let distance_expr = haversine_sql("$2", "$3", "route_lon", "route_lat");
            let sql = format!(
                r"
                SELECT ride_id, driver_id, departure_at, seats_left, luggage_left, price_per_seat_minor,
                       {distance_expr} AS distance_meters
                FROM rides_with_nearest_route_point
                WHERE airport_id = $1
                  AND status = 'active'
                  AND departure_at > now()
                  AND ($4::text IS NULL OR direction = $4)
                  AND ($5::int IS NULL OR seats_left >= $5)
                  AND {distance_expr} <= $6
                ORDER BY distance_meters ASC
                LIMIT $7 OFFSET $8
                "
            );
            let rows = sqlx::query(&sql)
                .bind(query.airport_id.0)
                .bind(pickup.lon)
                .bind(pickup.lat)
                .bind(query.direction.map(|d| format!("{d:?}")))
                .bind(query.min_seats.map(|s| i64::from(s)))
                .bind(radius)
                .bind(i64::from(limit))
                .bind(i64::from(offset))
                .fetch_all(&self.pool)
                .await?;
            return Ok(rows.into_iter().map(row_to_result).collect());
        }

        let sql = r"
            SELECT ride_id, driver_id, departure_at, seats_left, luggage_left, price_per_seat_minor,
                   NULL::double precision AS distance_meters
            FROM rides
            WHERE airport_id = $1
              AND status = 'active'
              AND ($2::text IS NULL OR direction = $2)
              AND ($3::int IS NULL OR seats_left >= $3)
              AND ($4::date IS NULL OR departure_at::date = $4)
              AND ($4::date IS NOT NULL OR departure_at > now())
            ORDER BY departure_at ASC
            LIMIT $5 OFFSET $6
        ";
        let rows = sqlx::query(sql)
            .bind(query.airport_id.0)
            .bind(query.direction.map(|d| format!("{d:?}")))
            .bind(query.min_seats.map(|s| i64::from(s)))
            .bind(query.date)
            .bind(i64::from(limit))
            .bind(i64::from(offset))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(row_to_result).collect())
    }

    /// Driver-side search over open, unexpired ride requests, annotated with
    /// whether `query.driver_id` already has a pending offer on each one —
    /// mirrors `search_rides`'s attribute-predicate-plus-optional-distance
    /// shape, ordered by pickup distance when given a point, otherwise by
    /// `earliestAt` ascending.
    ///
    /// # Errors
    ///
    /// Returns an error if the query cannot be executed.
    pub async fn search_requests(
        &self,
        query: &RequestSearchQuery,
    ) -> Result<Vec<RequestSearchResult>, sqlx::Error> {
        let limit = query.limit.min(MAX_PAGE_LIMIT).max(1);
        let offset = query.page.saturating_mul(limit);

        if let Some(pickup) = query.pickup_point {
            let radius = query.radius_meters.unwrap_or(DEFAULT_RADIUS_METERS);
            let distance_expr = haversine_sql("$2", "$3", "home_lon", "home_lat");
            let sql = format!(
                r"
                SELECT r.request_id, r.passenger_id, r.airport_id, r.direction, r.earliest_at, r.latest_at,
                       r.seats, r.luggage, {distance_expr} AS distance_meters,
                       EXISTS (
                           SELECT 1 FROM offers o
                           WHERE o.request_id = r.request_id AND o.driver_id = $6 AND o.status = 'pending'
                       ) AS has_user_offered
                FROM ride_requests r
                WHERE r.status = 'open'
                  AND r.expires_at > now()
                  AND ($1::uuid IS NULL OR r.airport_id = $1)
                  AND ($4::text IS NULL OR r.direction = $4)
                  AND {distance_expr} <= $5
                ORDER BY distance_meters ASC
                LIMIT $7 OFFSET $8
                "
            );
            let rows = sqlx::query(&sql)
                .bind(query.airport_id.map(|a| a.0))
                .bind(pickup.lon)
                .bind(pickup.lat)
                .bind(query.direction.map(|d| format!("{d:?}")))
                .bind(radius)
                .bind(query.driver_id.0)
                .bind(i64::from(limit))
                .bind(i64::from(offset))
                .fetch_all(&self.pool)
                .await?;
            return Ok(rows.into_iter().map(row_to_request_result).collect());
        }

        let sql = r"
            SELECT r.request_id, r.passenger_id, r.airport_id, r.direction, r.earliest_at, r.latest_at,
                   r.seats, r.luggage, NULL::double precision AS distance_meters,
                   EXISTS (
                       SELECT 1 FROM offers o
                       WHERE o.request_id = r.request_id AND o.driver_id = $4 AND o.status = 'pending'
                   ) AS has_user_offered
            FROM ride_requests r
            WHERE r.status = 'open'
              AND r.expires_at > now()
              AND ($1::uuid IS NULL OR r.airport_id = $1)
              AND ($2::text IS NULL OR r.direction = $2)
              AND ($3::date IS NULL OR r.earliest_at::date = $3)
              AND ($3::date IS NOT NULL OR r.latest_at > now())
            ORDER BY r.earliest_at ASC
            LIMIT $5 OFFSET $6
        ";
        let rows = sqlx::query(sql)
            .bind(query.airport_id.map(|a| a.0))
            .bind(query.direction.map(|d| format!("{d:?}")))
            .bind(query.date)
            .bind(query.driver_id.0)
            .bind(i64::from(limit))
            .bind(i64::from(offset))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(row_to_request_result).collect())
    }
}

fn row_to_result(row: sqlx::postgres::PgRow) -> RideSearchResult {
    use sqlx::Row;
    RideSearchResult {
        ride_id: RideId(row.get("ride_id")),
        driver_id: UserId(row.get("driver_id")),
        departure_at: row.get("departure_at"),
        #[allow(clippy::cast_sign_loss)]
        seats_left: row.get::<i32, _>("seats_left") as u32,
        #[allow(clippy::cast_sign_loss)]
        luggage_left: row.get::<i32, _>("luggage_left") as u32,
        price_per_seat: Money::from_minor(row.get("price_per_seat_minor")),
        distance_meters: row.try_get("distance_meters").ok(),
    }
}

fn parse_direction(text: &str) -> Direction {
    match text {
        "FromAirport" => Direction::FromAirport,
        _ => Direction::ToAirport,
    }
}

fn row_to_request_result(row: sqlx::postgres::PgRow) -> RequestSearchResult {
    use sqlx::Row;
    RequestSearchResult {
        request_id: crate::types::RideRequestId(row.get("request_id")),
        passenger_id: UserId(row.get("passenger_id")),
        airport_id: AirportId(row.get("airport_id")),
        direction: parse_direction(row.get("direction")),
        earliest_at: row.get("earliest_at"),
        latest_at: row.get("latest_at"),
        #[allow(clippy::cast_sign_loss)]
        seats: row.get::<i32, _>("seats") as u32,
        #[allow(clippy::cast_sign_loss)]
        luggage: row.get::<i32, _>("luggage") as u32,
        distance_meters: row.try_get("distance_meters").ok(),
        has_user_offered: row.get("has_user_offered"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn haversine_sql_is_symmetric_in_form() {
        let sql = haversine_sql("$2", "$3", "lon", "lat");
        assert!(sql.contains("radians(lat - $3)"));
        assert!(sql.contains("radians(lon - $2)"));
    }
}
