//! Backing-store abstractions. Everything above this module talks to
//! `RedisStore` or `TimeSeriesStore`, never to `redis`/`influxdb2` types
//! directly.

pub mod redis;
pub mod timeseries;

pub use self::redis::RedisStore;
pub use self::timeseries::TimeSeriesStore;
