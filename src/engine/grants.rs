use tracing::{info, warn};

use crate::limits::*;
use crate::model::*;
use crate::observability::GRANTS_SWEPT_TOTAL;

use super::occupancy::validate_user_id;
use super::{Engine, EngineError, now_ms};

/// Compare without short-circuiting on the first differing byte.
fn secrets_match(expected: &str, supplied: &str) -> bool {
    let (a, b) = (expected.as_bytes(), supplied.as_bytes());
    let mut diff = a.len() ^ b.len();
    for (i, x) in a.iter().enumerate() {
        diff |= usize::from(x ^ b.get(i).copied().unwrap_or(0));
    }
    diff == 0
}

impl Engine {
    /// Record (or renew) a user's access to a program.
    pub async fn grant_access(
        &self,
        user_id: &str,
        program_id: &str,
        expires_at: Option<Ms>,
    ) -> Result<Grant, EngineError> {
        validate_user_id(user_id)?;
        if program_id.trim().is_empty() {
            return Err(EngineError::InvalidArgument("program id is required".into()));
        }
        if program_id.len() > MAX_PROGRAM_ID_LEN {
            return Err(EngineError::LimitExceeded("program id too long"));
        }

        let _gate = self.commit_gate.read().await;
        let _writes = self.grant_lock.lock().await;
        let grant = Grant {
            key: GrantKey::new(user_id, program_id),
            granted_at: now_ms(),
            expires_at,
        };
        self.wal_append(&Event::GrantIssued {
            grant: grant.clone(),
        })
        .await?;
        self.grants.insert(grant.key.clone(), grant.clone());
        Ok(grant)
    }

    pub async fn revoke_access(&self, user_id: &str, program_id: &str) -> Result<(), EngineError> {
        let key = GrantKey::new(user_id, program_id);
        let _gate = self.commit_gate.read().await;
        let _writes = self.grant_lock.lock().await;
        if !self.grants.contains_key(&key) {
            return Err(EngineError::GrantNotFound {
                user_id: key.user_id,
                program_id: key.program_id,
            });
        }
        self.wal_append(&Event::GrantsRevoked {
            keys: vec![key.clone()],
        })
        .await?;
        self.grants.remove(&key);
        Ok(())
    }

    /// Keys of every grant strictly past its expiry at `now`, sorted.
    pub fn collect_expired_grants(&self, now: Ms) -> Vec<GrantKey> {
        let mut keys: Vec<GrantKey> = self
            .grants
            .iter()
            .filter(|e| e.value().is_expired(now))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        keys
    }

    /// Delete every expired grant in batches of at most `sweep_batch_size`.
    ///
    /// A failed batch is logged and counted; later batches still run.
    pub async fn sweep(&self, now: Ms) -> SweepReport {
        let mut report = SweepReport::default();
        let expired = self.collect_expired_grants(now);
        if expired.is_empty() {
            return report;
        }

        let batch_size = self.options.sweep_batch_size.max(1);
        for chunk in expired.chunks(batch_size) {
            report.batches += 1;
            let _gate = self.commit_gate.read().await;
            let _writes = self.grant_lock.lock().await;

            // A grant renewed since collection is no longer ours to delete.
            let keys: Vec<GrantKey> = chunk
                .iter()
                .filter(|k| self.grants.get(*k).is_some_and(|g| g.is_expired(now)))
                .cloned()
                .collect();
            if keys.is_empty() {
                continue;
            }

            let event = Event::GrantsRevoked { keys: keys.clone() };
            match self.wal_append(&event).await {
                Ok(()) => {
                    for key in &keys {
                        self.grants.remove(key);
                    }
                    report.deleted += keys.len() as u32;
                    metrics::counter!(GRANTS_SWEPT_TOTAL).increment(keys.len() as u64);
                }
                Err(e) => {
                    report.failed_batches += 1;
                    warn!(batch = report.batches, "grant sweep batch failed: {e}");
                }
            }
        }

        info!(
            deleted = report.deleted,
            batches = report.batches,
            failed_batches = report.failed_batches,
            "swept expired grants"
        );
        report
    }

    /// Admin-triggered sweep. Refused unless `secret` matches the configured one.
    pub async fn sweep_on_demand(
        &self,
        now: Ms,
        secret: Option<&str>,
    ) -> Result<SweepReport, EngineError> {
        let authorized = match (self.options.admin_secret.as_deref(), secret) {
            (Some(expected), Some(supplied)) => secrets_match(expected, supplied),
            _ => false,
        };
        if !authorized {
            warn!("on-demand sweep refused");
            return Err(EngineError::Unauthorized);
        }
        Ok(self.sweep(now).await)
    }

    /// A user's own grants split into active and just-expired; the expired ones are deleted.
    pub async fn check_grant_status(
        &self,
        user_id: &str,
        now: Ms,
    ) -> Result<GrantStatus, EngineError> {
        if user_id.trim().is_empty() {
            return Err(EngineError::Unauthenticated);
        }

        let _gate = self.commit_gate.read().await;
        let _writes = self.grant_lock.lock().await;
        let mut status = GrantStatus::default();
        let mut expired_keys = Vec::new();
        for entry in self.grants.iter().filter(|e| e.key().user_id == user_id) {
            if entry.value().is_expired(now) {
                status.expired.push(entry.key().program_id.clone());
                expired_keys.push(entry.key().clone());
            } else {
                status.active.push(entry.key().program_id.clone());
            }
        }
        status.active.sort();
        status.expired.sort();

        if !expired_keys.is_empty() {
            self.wal_append(&Event::GrantsRevoked {
                keys: expired_keys.clone(),
            })
            .await?;
            for key in &expired_keys {
                self.grants.remove(key);
            }
            metrics::counter!(GRANTS_SWEPT_TOTAL).increment(expired_keys.len() as u64);
        }
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::secrets_match;

    #[test]
    fn secret_comparison() {
        assert!(secrets_match("s3cret", "s3cret"));
        assert!(!secrets_match("s3cret", "s3cre"));
        assert!(!secrets_match("s3cret", "s3cret!"));
        assert!(!secrets_match("s3cret", "S3cret"));
        assert!(!secrets_match("s3cret", ""));
    }
}
