//! Table of user IPs authorized to open links

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

/// Why an IP may not open links
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IpRejection {
    #[error("The ip {0} is not in the validation list")]
    NotRegistered(String),

    #[error("The validity of the ip {0} has expired")]
    Expired(String),
}

/// IP → expiry
#[derive(Debug, Clone, Default)]
pub struct IpRegistry {
    entries: Arc<DashMap<String, DateTime<Utc>>>,
}

impl IpRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Authorize `ip` for `hours` from now
    pub fn register(&self, ip: &str, hours: i32) -> DateTime<Utc> {
        let expiry = Utc::now() + Duration::hours(i64::from(hours));
        self.entries.insert(ip.to_string(), expiry);
        info!(ip = %ip, hours, "Registered IP");
        expiry
    }

    pub fn expiry(&self, ip: &str) -> Option<DateTime<Utc>> {
        self.entries.get(ip).map(|e| *e)
    }

    /// Fails when `ip` was never registered or its registration lapsed
    pub fn verify(&self, ip: &str) -> Result<(), IpRejection> {
        self.verify_at(ip, Utc::now())
    }

    pub fn verify_at(&self, ip: &str, now: DateTime<Utc>) -> Result<(), IpRejection> {
        match self.expiry(ip) {
            None => Err(IpRejection::NotRegistered(ip.to_string())),
            Some(expiry) if expiry <= now => Err(IpRejection::Expired(ip.to_string())),
            Some(_) => Ok(()),
        }
    }

    /// Drop lapsed registrations
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let before = self.entries.len();
        self.entries.retain(|_, expiry| *expiry > now);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
