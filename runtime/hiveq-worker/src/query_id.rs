use chrono::{DateTime, Local};
use md5::{Digest, Md5};
use rand::Rng;

const RANDOM_BUCKETS: u32 = 10_000;

/// Builds an opaque `yyyyMMdd_HHmmss_<md5 hex>` identifier for a submission.
pub fn generate(datasource: &str, sql: &str) -> String {
    let salt = rand::rng().random_range(0..RANDOM_BUCKETS);
    generate_at(Local::now(), datasource, sql, salt)
}

fn generate_at(now: DateTime<Local>, datasource: &str, sql: &str, salt: u32) -> String {
    let seed = format!("{datasource};{sql};{};{salt}", now.to_rfc3339());
    let digest = Md5::digest(seed.as_bytes());
    format!("{}_{:x}", now.format("%Y%m%d_%H%M%S"), digest)
}
