//! OAuth token lifecycle
//!
//! The token manager is the only place that refreshes tokens and the only
//! place that deactivates a profile. A profile is deactivated solely when
//! its platform reports the credentials as invalid; rate limits, timeouts
//! and server errors leave it active for the next attempt.
//!
//! Refreshes of one profile are serialized with an in-process lock. After
//! taking the lock the stored profile is read again, and the refresh is
//! skipped when another caller already pushed the expiry out of the
//! window. Refresh tokens that rotate are single-use, so two overlapping
//! refreshes would otherwise invalidate each other.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::clock::Clock;
use crate::config::TokenConfig;
use crate::db::Database;
use crate::error::{CrosscastError, Result};
use crate::platforms::{AdapterRegistry, ErrorKind};
use crate::types::{Platform, Profile};

/// True if the token expires within `threshold_hours` of `now`.
/// Tokens without an expiry never expire.
pub fn is_expiring_soon(
    expiry: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    threshold_hours: i64,
) -> bool {
    match expiry {
        Some(expires_at) => expires_at <= now + Duration::hours(threshold_hours),
        None => false,
    }
}

pub fn is_expired(expiry: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    match expiry {
        Some(expires_at) => expires_at <= now,
        None => false,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RefreshOutcome {
    Refreshed {
        #[serde(rename = "expiresAt")]
        expires_at: Option<DateTime<Utc>>,
    },
    /// Another caller refreshed first
    AlreadyFresh,
    /// Credentials were rejected; the profile is now inactive
    Deactivated { reason: String },
    /// Transient failure; the profile stays active
    Failed { kind: ErrorKind, error: String },
}

impl RefreshOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, RefreshOutcome::Deactivated { .. } | RefreshOutcome::Failed { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileRefresh {
    pub profile_id: String,
    pub platform: Platform,
    pub outcome: RefreshOutcome,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshSummary {
    pub total: usize,
    pub refreshed: usize,
    pub failed: usize,
    pub outcomes: Vec<ProfileRefresh>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpiringProfile {
    pub profile_id: String,
    pub user_id: String,
    pub platform: Platform,
    pub external_account_id: String,
    pub expires_at: DateTime<Utc>,
    pub hours_until_expiry: f64,
}

pub struct TokenManager {
    db: Database,
    adapters: AdapterRegistry,
    clock: Arc<dyn Clock>,
    threshold_hours: i64,
    inter_call_delay: std::time::Duration,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl TokenManager {
    pub fn new(
        db: Database,
        adapters: AdapterRegistry,
        clock: Arc<dyn Clock>,
        config: &TokenConfig,
    ) -> Self {
        Self {
            db,
            adapters,
            clock,
            threshold_hours: config.threshold_hours,
            inter_call_delay: config.inter_call_delay(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn threshold_hours(&self) -> i64 {
        self.threshold_hours
    }

    fn profile_lock(&self, profile_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(profile_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Make sure `profile` can be used to publish right now.
    ///
    /// An expired token must be refreshed successfully; a token that is
    /// merely close to expiry is refreshed on a best-effort basis.
    pub async fn ensure_valid(&self, profile: &Profile) -> Result<bool> {
        let now = self.clock.now();

        if is_expired(profile.token_expires_at, now) {
            let outcome = self.refresh(profile).await?;
            return Ok(!outcome.is_failure());
        }

        if is_expiring_soon(profile.token_expires_at, now, self.threshold_hours) {
            let outcome = self.refresh(profile).await?;
            if outcome.is_failure() {
                tracing::warn!(
                    profile_id = %profile.id,
                    platform = %profile.platform,
                    ?outcome,
                    "Proactive token refresh failed; publishing with current token"
                );
            }
        }

        Ok(true)
    }

    /// Refresh a profile that is expiring within the configured threshold
    pub async fn refresh(&self, profile: &Profile) -> Result<RefreshOutcome> {
        self.refresh_inner(&profile.id, Some(self.threshold_hours)).await
    }

    /// Refresh regardless of expiry or active flag; used to revive a
    /// deactivated profile after the user reconnected upstream
    pub async fn reactivate(&self, profile_id: &str) -> Result<RefreshOutcome> {
        self.refresh_inner(profile_id, None).await
    }

    /// `window`: skip the refresh unless the stored token expires within
    /// this many hours. `None` forces it.
    async fn refresh_inner(&self, profile_id: &str, window: Option<i64>) -> Result<RefreshOutcome> {
        let lock = self.profile_lock(profile_id);
        let _guard = lock.lock().await;

        let profile = self
            .db
            .get_profile(profile_id)
            .await?
            .ok_or_else(|| CrosscastError::NotFound(format!("profile {}", profile_id)))?;

        if let Some(hours) = window {
            if !is_expiring_soon(profile.token_expires_at, self.clock.now(), hours) {
                tracing::debug!(profile_id, "Token already refreshed by another caller");
                return Ok(RefreshOutcome::AlreadyFresh);
            }
        }

        let adapter = self.adapters.get(profile.platform);
        let result = adapter.refresh_token(&profile.credentials()).await;
        let now = self.clock.now();

        match result {
            Ok(fresh) => {
                self.db
                    .update_profile_tokens(
                        &profile.id,
                        &fresh.access_token,
                        fresh.refresh_token.as_ref(),
                        fresh.expires_at,
                        now,
                    )
                    .await?;
                tracing::info!(
                    profile_id,
                    platform = %profile.platform,
                    expires_at = ?fresh.expires_at,
                    "Token refreshed"
                );
                Ok(RefreshOutcome::Refreshed {
                    expires_at: fresh.expires_at,
                })
            }
            Err(error) => match adapter.classify_error(&error) {
                ErrorKind::InvalidCredentials => {
                    let reason = error.to_string();
                    self.db.deactivate_profile(&profile.id, &reason, now).await?;
                    tracing::warn!(
                        profile_id,
                        platform = %profile.platform,
                        reason = %reason,
                        "Profile deactivated, user must reconnect"
                    );
                    Ok(RefreshOutcome::Deactivated { reason })
                }
                kind => {
                    tracing::warn!(
                        profile_id,
                        platform = %profile.platform,
                        ?kind,
                        error = %error,
                        "Token refresh failed, will retry later"
                    );
                    Ok(RefreshOutcome::Failed {
                        kind,
                        error: error.to_string(),
                    })
                }
            },
        }
    }

    /// Refresh every active profile expiring within `threshold_hours`,
    /// one at a time with a pause between platform calls
    pub async fn refresh_all_expiring(&self, threshold_hours: i64) -> Result<RefreshSummary> {
        let cutoff = self.clock.now() + Duration::hours(threshold_hours);
        let profiles = self.db.active_profiles_expiring_before(cutoff).await?;

        let mut summary = RefreshSummary {
            total: profiles.len(),
            ..Default::default()
        };

        for (i, profile) in profiles.iter().enumerate() {
            if i > 0 && !self.inter_call_delay.is_zero() {
                tokio::time::sleep(self.inter_call_delay).await;
            }

            let outcome = match self.refresh_inner(&profile.id, Some(threshold_hours)).await {
                Ok(outcome) => outcome,
                // One broken row must not stop the sweep
                Err(e) => RefreshOutcome::Failed {
                    kind: ErrorKind::Server,
                    error: e.to_string(),
                },
            };

            match &outcome {
                RefreshOutcome::Refreshed { .. } => summary.refreshed += 1,
                RefreshOutcome::Deactivated { .. } | RefreshOutcome::Failed { .. } => {
                    summary.failed += 1
                }
                RefreshOutcome::AlreadyFresh => {}
            }
            summary.outcomes.push(ProfileRefresh {
                profile_id: profile.id.clone(),
                platform: profile.platform,
                outcome,
            });
        }

        tracing::info!(
            total = summary.total,
            refreshed = summary.refreshed,
            failed = summary.failed,
            "Token refresh sweep finished"
        );
        Ok(summary)
    }

    /// Active profiles expiring within `threshold_hours`, soonest first
    pub async fn expiring_profiles(&self, threshold_hours: i64) -> Result<Vec<ExpiringProfile>> {
        let now = self.clock.now();
        let profiles = self
            .db
            .active_profiles_expiring_before(now + Duration::hours(threshold_hours))
            .await?;

        Ok(profiles
            .into_iter()
            .filter_map(|p| {
                let expires_at = p.token_expires_at?;
                let hours = (expires_at - now).num_seconds() as f64 / 3600.0;
                Some(ExpiringProfile {
                    profile_id: p.id,
                    user_id: p.user_id,
                    platform: p.platform,
                    external_account_id: p.external_account_id,
                    expires_at,
                    hours_until_expiry: (hours * 10.0).round() / 10.0,
                })
            })
            .collect())
    }
}
