//! A real-time `Clock`. `carpool_core::environment`'s own module doc shows
//! this exact impl as the production counterpart to `carpool_testing`'s
//! `FixedClock`, but never actually defines it — this is that missing
//! piece.

use carpool_core::environment::Clock;
use chrono::{DateTime, Utc};

#[derive(Copy, Clone, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
