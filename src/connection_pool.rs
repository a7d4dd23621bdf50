//! LDAP connection pool
//!
//! Worker threads each need a bound `LdapConn`. Connections are created on
//! demand, returned to an idle list after use and dropped when an operation
//! fails at the transport level.

use crate::credentials::ExplicitCredentials;
use crate::errors::{AuditError, AuditResult};
use crate::ldap_timeout::{bind_with_timeout, connect_with_timeout};
use ldap3::LdapConn;
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Connection pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Idle connections kept for reuse
    pub max_idle: usize,
    pub connect_timeout: Duration,
    pub operation_timeout: Duration,
    /// Idle connections older than this are discarded instead of reused
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle: 4,
            connect_timeout: Duration::from_secs(15),
            operation_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(300),
        }
    }
}

struct PooledConnection {
    ldap: LdapConn,
    last_used: Instant,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolStats {
    pub connections_created: u64,
    pub connections_reused: u64,
    pub connections_dropped: u64,
    pub total_operations: u64,
}

pub struct LdapConnectionPool {
    url: String,
    credentials: ExplicitCredentials,
    config: PoolConfig,
    idle: Mutex<Vec<PooledConnection>>,
    stats: Mutex<PoolStats>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl LdapConnectionPool {
    pub fn new(url: impl Into<String>, credentials: ExplicitCredentials, config: PoolConfig) -> Self {
        Self {
            url: url.into(),
            credentials,
            config,
            idle: Mutex::new(Vec::new()),
            stats: Mutex::new(PoolStats::default()),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn operation_timeout(&self) -> Duration {
        self.config.operation_timeout
    }

    pub fn stats(&self) -> PoolStats {
        lock(&self.stats).clone()
    }

    /// Run `op` on a pooled connection. Connections that fail with a
    /// connectivity or timeout error are not returned to the pool.
    pub fn with_connection<T, F>(&self, op: F) -> AuditResult<T>
    where
        F: FnOnce(&mut LdapConn) -> AuditResult<T>,
    {
        let mut ldap = self.checkout()?;
        let result = op(&mut ldap);
        lock(&self.stats).total_operations += 1;

        match &result {
            Err(AuditError::Connectivity(_)) | Err(AuditError::Timeout(_)) => {
                warn!("Dropping LDAP connection to {} after failure", self.url);
                lock(&self.stats).connections_dropped += 1;
            }
            _ => self.checkin(ldap),
        }
        result
    }

    /// Establish and bind a connection without pooling it first; used to
    /// fail fast on bad server names or credentials.
    pub fn warm_up(&self) -> AuditResult<()> {
        let ldap = self.create_connection()?;
        self.checkin(ldap);
        Ok(())
    }

    fn checkout(&self) -> AuditResult<LdapConn> {
        let reused = {
            let mut idle = lock(&self.idle);
            idle.retain(|c| c.last_used.elapsed() <= self.config.idle_timeout);
            idle.pop()
        };
        if let Some(conn) = reused {
            lock(&self.stats).connections_reused += 1;
            return Ok(conn.ldap);
        }
        self.create_connection()
    }

    fn checkin(&self, ldap: LdapConn) {
        let mut idle = lock(&self.idle);
        if idle.len() < self.config.max_idle {
            idle.push(PooledConnection {
                ldap,
                last_used: Instant::now(),
            });
        }
    }

    fn create_connection(&self) -> AuditResult<LdapConn> {
        let mut ldap = connect_with_timeout(&self.url, self.config.connect_timeout)?;
        bind_with_timeout(
            &mut ldap,
            self.credentials.username(),
            self.credentials.password(),
            self.config.operation_timeout,
        )?;

        let created = {
            let mut stats = lock(&self.stats);
            stats.connections_created += 1;
            stats.connections_created
        };
        if created == 1 {
            info!("Connected to {} as {}", self.url, self.credentials.username());
        } else {
            debug!("Opened LDAP connection #{} to {}", created, self.url);
        }
        Ok(ldap)
    }
}
