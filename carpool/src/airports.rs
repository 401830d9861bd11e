//! The airport catalog: a small, mostly-static reference table (airport
//! code, name, city, location) searched by text prefix or proximity. Reads
//! go straight to Postgres — this catalog changes rarely enough that the
//! cache layer is not worth the invalidation complexity RideRequests and
//! Rides already pay for.

use serde::Serialize;
use sqlx::PgPool;

use crate::types::{AirportId, GeoPoint};

#[derive(Clone, Debug, Serialize)]
pub struct Airport {
    pub id: AirportId,
    pub iata_code: String,
    pub name: String,
    pub city: String,
    pub location: GeoPoint,
}

pub struct AirportCatalog {
    pool: PgPool,
}

impl AirportCatalog {
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Case-insensitive prefix match against IATA code, name, or city.
    ///
    /// # Errors
    ///
    /// Returns an error if the query cannot be executed.
    pub async fn search_by_text(&self, query: &str, limit: u32) -> Result<Vec<Airport>, sqlx::Error> {
        let pattern = prefix_pattern(query);
        let rows = sqlx::query_as::<_, (uuid::Uuid, String, String, String, f64, f64)>(
            r"
            SELECT id, iata_code, name, city, lon, lat
            FROM airports
            WHERE lower(iata_code) LIKE $1 OR lower(name) LIKE $1 OR lower(city) LIKE $1
            ORDER BY iata_code ASC
            LIMIT $2
            ",
        )
        .bind(pattern)
        .bind(i64::from(limit.min(100)))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, iata_code, name, city, lon, lat)| Airport {
                id: AirportId(id),
                iata_code,
                name,
                city,
                location: GeoPoint::new(lon, lat),
            })
            .collect())
    }

    /// Looks up a single airport by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the query cannot be executed.
    pub async fn find_by_id(&self, id: AirportId) -> Result<Option<Airport>, sqlx::Error> {
        let row = sqlx::query_as::<_, (uuid::Uuid, String, String, String, f64, f64)>(
            "SELECT id, iata_code, name, city, lon, lat FROM airports WHERE id = $1",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(id, iata_code, name, city, lon, lat)| Airport {
            id: AirportId(id),
            iata_code,
            name,
            city,
            location: GeoPoint::new(lon, lat),
        }))
    }

    /// Nearest airports to a point, within `radius_meters`.
    ///
    /// # Errors
    ///
    /// Returns an error if the query cannot be executed.
    pub async fn search_nearby(
        &self,
        point: GeoPoint,
        radius_meters: f64,
        limit: u32,
    ) -> Result<Vec<Airport>, sqlx::Error> {
        let rows = sqlx::query_as::<_, (uuid::Uuid, String, String, String, f64, f64)>(
            r"
            SELECT id, iata_code, name, city, lon, lat
            FROM airports
            WHERE 6371000 * 2 * asin(sqrt(
                power(sin(radians(lat - $2) / 2), 2) +
                cos(radians($2)) * cos(radians(lat)) *
                power(sin(radians(lon - $1) / 2), 2)
            )) <= $3
            ORDER BY iata_code ASC
            LIMIT $4
            ",
        )
        .bind(point.lon)
        .bind(point.lat)
        .bind(radius_meters)
        .bind(i64::from(limit.min(100)))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, iata_code, name, city, lon, lat)| Airport {
                id: AirportId(id),
                iata_code,
                name,
                city,
                location: GeoPoint::new(lon, lat),
            })
            .collect())
    }
}

/// Lowercased `LIKE`-prefix pattern for `search_by_text`'s IATA/name/city match.
fn prefix_pattern(query: &str) -> String {
    format!("{}%", query.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_pattern_lowercases_and_anchors() {
        assert_eq!(prefix_pattern("CDG"), "cdg%");
        assert_eq!(prefix_pattern("Par"), "par%");
    }
}
