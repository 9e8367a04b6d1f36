//! Two independent gating mechanisms, both sliding-window fixed-width per
//! identity: a generic throttle (in-process, approximated with a token
//! bucket the same way the HTTP surface's per-route rate limiting does) and
//! a durable, subscription-gated AI-generation quota backed by Postgres with
//! a short-lived entitlement cache in front of the subscription provider.

use std::net::IpAddr;
use std::num::NonZeroU32;
use std::time::Duration;

use chrono::{DateTime, Utc};
use governor::clock::{Clock, DefaultClock};
use governor::state::keyed::DashMapStateStore;
use governor::{Quota, RateLimiter};
use lexiclip_adapters::SubscriptionProvider;
use moka::future::Cache;
use thiserror::Error;

const AI_QUOTA_MAX_REQUESTS: i32 = 3;
const AI_QUOTA_WINDOW_MINUTES: i64 = 240;
const ENTITLEMENT_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Error)]
pub enum ThrottleError {
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },
}

pub enum ThrottleIdentity<'a> {
    User(&'a str),
    Ip(IpAddr),
}

pub struct ThrottleConfig {
    pub user_limit: NonZeroU32,
    pub ip_limit: NonZeroU32,
    pub window: Duration,
}

/// Per-route sliding-window request limiter. Identity is the user id if
/// supplied, else the client IP.
pub struct GenericThrottle {
    user_limiter: RateLimiter<String, DashMapStateStore<String>, DefaultClock>,
    ip_limiter: RateLimiter<String, DashMapStateStore<String>, DefaultClock>,
}

impl GenericThrottle {
    pub fn new(config: ThrottleConfig) -> Self {
        let user_quota = Quota::with_period(config.window)
            .expect("throttle window must be non-zero")
            .allow_burst(config.user_limit);
        let ip_quota = Quota::with_period(config.window)
            .expect("throttle window must be non-zero")
            .allow_burst(config.ip_limit);

        Self {
            user_limiter: RateLimiter::dashmap(user_quota),
            ip_limiter: RateLimiter::dashmap(ip_quota),
        }
    }

    pub fn check(&self, identity: ThrottleIdentity<'_>) -> Result<(), ThrottleError> {
        let outcome = match identity {
            ThrottleIdentity::User(user_id) => self.user_limiter.check_key(&user_id.to_string()),
            ThrottleIdentity::Ip(ip) => self.ip_limiter.check_key(&ip.to_string()),
        };

        outcome.map_err(|not_until| ThrottleError::RateLimited {
            retry_after: not_until.wait_time_from(DefaultClock::default().now()),
        })
    }
}

#[derive(Debug, Error)]
pub enum AiQuotaError {
    #[error("AI quota exceeded, retry after {retry_after_secs}s")]
    Exceeded { retry_after_secs: i64 },
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
}

/// The outcome of applying the durable sliding-window policy, computed as a
/// pure function of the stored counter and the current time so it can be
/// tested without a database.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum QuotaDecision {
    /// Allowed; the counter row should be written with this count and window
    /// start.
    Allow {
        new_count: i32,
        window_start: DateTime<Utc>,
    },
    Deny {
        retry_after_secs: i64,
    },
}

fn decide(now: DateTime<Utc>, window_start: DateTime<Utc>, request_count: i32) -> QuotaDecision {
    let window = chrono::Duration::minutes(AI_QUOTA_WINDOW_MINUTES);
    let elapsed = now - window_start;

    if elapsed >= window {
        return QuotaDecision::Allow {
            new_count: 1,
            window_start: now,
        };
    }

    if request_count < AI_QUOTA_MAX_REQUESTS {
        return QuotaDecision::Allow {
            new_count: request_count + 1,
            window_start,
        };
    }

    QuotaDecision::Deny {
        retry_after_secs: (window - elapsed).num_seconds().max(0),
    }
}

/// Snapshot of where a user stands against the durable quota, shaped for the
/// HTTP boundary's `X-Paywall-*` headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaStatus {
    pub has_subscription: bool,
    pub used: i32,
    pub limit: i32,
}

#[derive(Clone)]
pub struct AiQuota {
    db: lexiclip_db::Db,
    subscriptions: std::sync::Arc<dyn SubscriptionProvider>,
    entitlement_cache: Cache<String, bool>,
}

impl AiQuota {
    pub fn new(db: lexiclip_db::Db, subscriptions: std::sync::Arc<dyn SubscriptionProvider>) -> Self {
        let entitlement_cache = Cache::builder().time_to_live(ENTITLEMENT_CACHE_TTL).build();
        Self {
            db,
            subscriptions,
            entitlement_cache,
        }
    }

    /// Unlimited if the subscription provider reports active entitlement.
    /// Otherwise consults the durable per-user counter, incrementing it only
    /// when the request is allowed.
    pub async fn check_and_increment(&self, user_id: &str) -> Result<QuotaStatus, AiQuotaError> {
        if self.is_entitled(user_id).await {
            return Ok(QuotaStatus {
                has_subscription: true,
                used: 0,
                limit: 0,
            });
        }

        let row: Option<CounterRow> = sqlx::query_as(
            r#"select request_count, window_start from ai_quota_counters where user_id = $1"#,
        )
        .bind(user_id)
        .fetch_optional(&self.db.pool)
        .await?;

        let now = Utc::now();
        let (request_count, window_start) = match row {
            Some(row) => (row.request_count, row.window_start),
            None => (0, now),
        };

        match decide(now, window_start, request_count) {
            QuotaDecision::Allow {
                new_count,
                window_start,
            } => {
                sqlx::query(
                    r#"
                    insert into ai_quota_counters (user_id, request_count, window_start)
                    values ($1, $2, $3)
                    on conflict (user_id) do update
                        set request_count = excluded.request_count,
                            window_start = excluded.window_start
                    "#,
                )
                .bind(user_id)
                .bind(new_count)
                .bind(window_start)
                .execute(&self.db.pool)
                .await?;
                Ok(QuotaStatus {
                    has_subscription: false,
                    used: new_count,
                    limit: AI_QUOTA_MAX_REQUESTS,
                })
            }
            QuotaDecision::Deny { retry_after_secs } => {
                Err(AiQuotaError::Exceeded { retry_after_secs })
            }
        }
    }

    /// Active entitlement results are cached for five minutes; inactive
    /// results are never cached so a freshly purchased entitlement takes
    /// effect on the next request. Provider errors fail open and are not
    /// cached either.
    async fn is_entitled(&self, user_id: &str) -> bool {
        if let Some(cached) = self.entitlement_cache.get(user_id).await {
            return cached;
        }

        match self.subscriptions.is_entitled(user_id).await {
            Ok(true) => {
                self.entitlement_cache
                    .insert(user_id.to_string(), true)
                    .await;
                true
            }
            Ok(false) => false,
            Err(_) => true,
        }
    }
}

#[derive(sqlx::FromRow)]
struct CounterRow {
    request_count: i32,
    window_start: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use lexiclip_adapters::AdapterError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn fresh_window_allows_and_seeds_counter() {
        let now = Utc::now();
        let decision = decide(now, now - chrono::Duration::minutes(241), 3);
        assert_eq!(
            decision,
            QuotaDecision::Allow {
                new_count: 1,
                window_start: now
            }
        );
    }

    #[test]
    fn within_window_under_cap_increments() {
        let now = Utc::now();
        let window_start = now - chrono::Duration::minutes(10);
        let decision = decide(now, window_start, 1);
        assert_eq!(
            decision,
            QuotaDecision::Allow {
                new_count: 2,
                window_start
            }
        );
    }

    #[test]
    fn within_window_at_cap_denies() {
        let now = Utc::now();
        let window_start = now - chrono::Duration::minutes(10);
        let decision = decide(now, window_start, AI_QUOTA_MAX_REQUESTS);
        assert!(matches!(decision, QuotaDecision::Deny { .. }));
    }

    struct CountingSubscriptions {
        entitled: bool,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl SubscriptionProvider for CountingSubscriptions {
        async fn is_entitled(&self, _user_id: &str) -> Result<bool, AdapterError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.entitled)
        }
    }

    #[tokio::test]
    async fn entitled_users_are_not_counted_against_the_db_quota() {
        let db = lexiclip_db::Db::from_pool(
            sqlx::PgPool::connect_lazy("postgres://localhost/lexiclip_test_unused").unwrap(),
        );
        let calls = Arc::new(AtomicUsize::new(0));
        let subscriptions = std::sync::Arc::new(CountingSubscriptions {
            entitled: true,
            calls: calls.clone(),
        });
        let quota = AiQuota::new(db, subscriptions);

        quota.check_and_increment("user-1").await.unwrap();
        quota.check_and_increment("user-1").await.unwrap();

        // Only the subscription provider was consulted; the cache serves
        // the second call, and neither call touches the database.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn throttle_denies_past_burst_capacity() {
        let throttle = GenericThrottle::new(ThrottleConfig {
            user_limit: NonZeroU32::new(1).unwrap(),
            ip_limit: NonZeroU32::new(1).unwrap(),
            window: Duration::from_secs(60),
        });

        assert!(throttle.check(ThrottleIdentity::User("u1")).is_ok());
        assert!(throttle.check(ThrottleIdentity::User("u1")).is_err());
        // A distinct identity has its own independent bucket.
        assert!(throttle.check(ThrottleIdentity::User("u2")).is_ok());
    }
}
