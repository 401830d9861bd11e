//! Shared value types used across every aggregate: ids, money, and the
//! enums that show up in more than one module's state.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Generates a newtype wrapper around `Uuid` with the trait impls every
/// identifier in this crate needs (`Display`, serde, stream-id conversion).
///
/// Every entity id in the source specification is described as an opaque
/// 12-byte value; this crate's convention instead (matching the teacher's
/// own `UserId` and the ticketing example's `CustomerId`/`OrderId`) is to use
/// `Uuid` for every identifier, since the value is opaque to callers either way
/// and `Uuid` is what the rest of the stack already expects (`sqlx`'s `uuid`
/// feature, JSON serialization, primary keys). See DESIGN.md.
macro_rules! id_type {
    ($name:ident) => {
        #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generate a new random id.
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl From<$name> for carpool_core::stream::StreamId {
            fn from(id: $name) -> Self {
                Self::new(format!("{}-{}", stringify!($name), id.0))
            }
        }
    };
}

id_type!(UserId);
id_type!(AirportId);
id_type!(RideId);
id_type!(BookingId);
id_type!(RideRequestId);
id_type!(OfferId);
id_type!(WalletId);
id_type!(TransactionId);
id_type!(PayoutId);
id_type!(NotificationId);
id_type!(RatingId);

/// An amount of money in integer minor units (cents). Never a float: every
/// arithmetic operation in the ledger and fee policy is exact integer math.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(pub i64);

impl Money {
    /// Zero minor units.
    pub const ZERO: Self = Self(0);

    /// Construct from a minor-unit amount (e.g. cents).
    #[must_use]
    pub const fn from_minor(amount: i64) -> Self {
        Self(amount)
    }

    /// The raw minor-unit value.
    #[must_use]
    pub const fn minor(self) -> i64 {
        self.0
    }

    #[must_use]
    pub fn checked_add(self, other: Self) -> Option<Self> {
        self.0.checked_add(other.0).map(Self)
    }

    #[must_use]
    pub fn checked_sub(self, other: Self) -> Option<Self> {
        self.0.checked_sub(other.0).map(Self)
    }

    #[must_use]
    pub const fn is_negative(self) -> bool {
        self.0 < 0
    }

    /// `amount * seats`, used for per-seat pricing.
    #[must_use]
    pub const fn times(self, units: i64) -> Self {
        Self(self.0 * units)
    }

    /// Splits a gross amount into `(fee, net)` given a percentage, rounding
    /// the fee half-up so `fee + net == gross` exactly.
    #[must_use]
    pub fn split_fee(self, fee_percent: u8) -> (Self, Self) {
        let gross = self.0;
        let fee = (gross * i64::from(fee_percent) + 50) / 100;
        (Self(fee), Self(gross - fee))
    }
}

impl std::ops::Neg for Money {
    type Output = Self;
    fn neg(self) -> Self {
        Self(-self.0)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.0 / 100, (self.0 % 100).abs())
    }
}

/// A point on the earth, used for rides, pickup locations, and airports.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lon: f64,
    pub lat: f64,
}

impl GeoPoint {
    #[must_use]
    pub const fn new(lon: f64, lat: f64) -> Self {
        Self { lon, lat }
    }

    /// Great-circle distance to another point, in meters.
    #[must_use]
    pub fn distance_meters(self, other: Self) -> f64 {
        const EARTH_RADIUS_M: f64 = 6_371_000.0;
        let lat1 = self.lat.to_radians();
        let lat2 = other.lat.to_radians();
        let dlat = (other.lat - self.lat).to_radians();
        let dlon = (other.lon - self.lon).to_radians();
        let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
        let c = 2.0 * a.sqrt().asin();
        EARTH_RADIUS_M * c
    }
}

/// Direction of travel relative to the airport.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    ToAirport,
    FromAirport,
}

/// How a booking or offer acceptance was paid for.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Card,
    Wallet,
    None,
}

/// Why a booking was refunded.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundReason {
    PassengerCancelled,
    DriverCancelled,
    RideCancelled,
    AdminAction,
}
