mod database;
mod pool;

pub use database::{Database, DbTransaction};
pub use pool::{Pool, PoolStats, PooledConnection};
