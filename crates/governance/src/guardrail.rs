//! Cost guardrail: per-tenant request rate, daily quotas and a monthly spend cap.
//!
//! Enforcement is active only in low-cost mode; otherwise every check allows
//! and nothing is recorded. All state lives behind one mutex so the rate and
//! daily checks for a request are decided atomically.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use marketops_core::{config::GuardrailSettings, Error, Result};

/// Length of the sliding rate window.
pub const RATE_WINDOW: Duration = Duration::from_secs(60);

/// Source of wall-clock time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let step = chrono::Duration::from_std(by).unwrap_or_else(|_| chrono::Duration::zero());
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += step;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Why a guardrail check failed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DenyReason {
    RateLimit { limit: u32, retry_after_secs: f64 },
    DailyRequestQuota { limit: u64 },
    DailyTokenQuota { limit: u64, used: u64, requested: u64 },
    MonthlyCostCap { cap_usd: f64, spent_usd: f64, requested_usd: f64 },
    InvalidAmount { amount: f64 },
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RateLimit { limit, .. } => write!(f, "rate limit of {} requests per minute reached", limit),
            Self::DailyRequestQuota { limit } => write!(f, "daily request quota of {} reached", limit),
            Self::DailyTokenQuota { limit, used, requested } => write!(
                f,
                "daily token quota of {} would be exceeded ({} used, {} requested)",
                limit, used, requested
            ),
            Self::MonthlyCostCap { cap_usd, spent_usd, requested_usd } => write!(
                f,
                "monthly cost cap of ${:.2} would be exceeded (${:.2} spent, ${:.2} requested)",
                cap_usd, spent_usd, requested_usd
            ),
            Self::InvalidAmount { amount } => write!(f, "invalid cost amount {}", amount),
        }
    }
}

/// Outcome of a guardrail check.
#[derive(Debug, Clone, PartialEq)]
pub enum GuardrailDecision {
    Allowed,
    Denied(DenyReason),
}

impl GuardrailDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }

    /// Map a denial to the error the gateway reports.
    pub fn into_result(self, tenant: &str) -> Result<()> {
        match self {
            Self::Allowed => Ok(()),
            Self::Denied(DenyReason::RateLimit { limit, retry_after_secs }) => Err(Error::RateLimited {
                tenant: tenant.to_string(),
                limit,
                retry_after: Duration::from_secs_f64(retry_after_secs.max(0.0)),
            }),
            Self::Denied(DenyReason::InvalidAmount { amount }) => {
                Err(Error::invalid_request(format!("invalid cost amount {}", amount)))
            }
            Self::Denied(reason) => Err(Error::QuotaExceeded(reason.to_string())),
        }
    }
}

#[derive(Debug, Default)]
struct TenantWindow {
    requests: VecDeque<DateTime<Utc>>,
    day: String,
    day_requests: u64,
    day_tokens: u64,
}

impl TenantWindow {
    /// Reset daily counters when the UTC date changed.
    fn roll_day(&mut self, today: &str) {
        if self.day != today {
            self.day = today.to_string();
            self.day_requests = 0;
            self.day_tokens = 0;
        }
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        while let Some(&oldest) = self.requests.front() {
            if now - oldest >= window() {
                self.requests.pop_front();
            } else {
                break;
            }
        }
    }

    fn in_window(&self, now: DateTime<Utc>) -> usize {
        self.requests.iter().filter(|&&at| now - at < window()).count()
    }
}

#[derive(Debug, Default)]
struct GuardrailState {
    tenants: HashMap<String, TenantWindow>,
    swept_day: String,
    month: String,
    month_cost_usd: f64,
}

impl GuardrailState {
    /// Once per UTC day, drop tenants with no requests in the window and no
    /// counters for today.
    fn evict_idle(&mut self, now: DateTime<Utc>, today: &str) {
        if self.swept_day == today {
            return;
        }
        self.swept_day = today.to_string();
        let before = self.tenants.len();
        self.tenants.retain(|_, entry| {
            entry.prune(now);
            entry.day == today || !entry.requests.is_empty()
        });
        let evicted = before - self.tenants.len();
        if evicted > 0 {
            tracing::debug!(evicted, remaining = self.tenants.len(), "Evicted idle guardrail tenants");
        }
    }

    fn tenant(&mut self, tenant: &str, now: DateTime<Utc>, today: &str) -> &mut TenantWindow {
        self.evict_idle(now, today);
        self.tenants.entry(tenant.to_string()).or_default()
    }
}

/// Read-only usage report for one tenant.
#[derive(Debug, Clone, Serialize)]
pub struct UsageSnapshot {
    pub enabled: bool,
    pub tenant: String,
    pub requests_last_minute: u64,
    pub rate_limit_rpm: u32,
    pub rpm_remaining: u64,
    pub day: String,
    pub requests_today: u64,
    pub daily_request_quota: u64,
    pub daily_requests_remaining: u64,
    pub tokens_today: u64,
    pub daily_token_quota: u64,
    pub daily_tokens_remaining: u64,
    pub month: String,
    pub monthly_cost_usd: f64,
    pub monthly_cap_usd: f64,
    pub monthly_cost_remaining_usd: f64,
}

/// Process-wide spend and rate tracker.
pub struct CostGuardrail {
    settings: GuardrailSettings,
    clock: Arc<dyn Clock>,
    state: Mutex<GuardrailState>,
}

fn window() -> chrono::Duration {
    chrono::Duration::seconds(RATE_WINDOW.as_secs() as i64)
}

fn day_key(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%d").to_string()
}

fn month_key(now: DateTime<Utc>) -> String {
    now.format("%Y-%m").to_string()
}

impl CostGuardrail {
    pub fn new(settings: GuardrailSettings) -> Self {
        Self::with_clock(settings, Arc::new(SystemClock))
    }

    pub fn with_clock(settings: GuardrailSettings, clock: Arc<dyn Clock>) -> Self {
        if settings.low_cost_mode {
            tracing::info!(
                rpm = settings.rate_limit_rpm,
                daily_requests = settings.daily_request_quota,
                daily_tokens = settings.daily_token_quota,
                monthly_cap_usd = settings.monthly_cap_usd,
                "Low-cost mode enabled"
            );
        }
        Self {
            settings,
            clock,
            state: Mutex::new(GuardrailState::default()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.settings.low_cost_mode
    }

    pub fn settings(&self) -> &GuardrailSettings {
        &self.settings
    }

    /// Admit one request for `tenant`, recording it when allowed.
    pub fn allow_request(&self, tenant: &str) -> GuardrailDecision {
        if !self.is_enabled() {
            return GuardrailDecision::Allowed;
        }
        let now = self.clock.now();
        let today = day_key(now);

        let mut state = self.lock();
        let entry = state.tenant(tenant, now, &today);
        entry.prune(now);
        entry.roll_day(&today);

        let decision = if entry.requests.len() as u64 >= u64::from(self.settings.rate_limit_rpm) {
            let retry_after = entry
                .requests
                .front()
                .and_then(|&oldest| (oldest + window() - now).to_std().ok())
                .unwrap_or(Duration::ZERO);
            GuardrailDecision::Denied(DenyReason::RateLimit {
                limit: self.settings.rate_limit_rpm,
                retry_after_secs: retry_after.as_secs_f64(),
            })
        } else if entry.day_requests >= self.settings.daily_request_quota {
            GuardrailDecision::Denied(DenyReason::DailyRequestQuota {
                limit: self.settings.daily_request_quota,
            })
        } else {
            entry.requests.push_back(now);
            entry.day_requests += 1;
            GuardrailDecision::Allowed
        };
        drop(state);

        self.observe("request", tenant, &decision);
        decision
    }

    /// Add `tokens` to today's usage unless that would exceed the quota.
    pub fn record_tokens(&self, tenant: &str, tokens: u64) -> GuardrailDecision {
        if !self.is_enabled() {
            return GuardrailDecision::Allowed;
        }
        let now = self.clock.now();
        let today = day_key(now);

        let mut state = self.lock();
        let entry = state.tenant(tenant, now, &today);
        entry.roll_day(&today);

        let decision = match entry.day_tokens.checked_add(tokens) {
            Some(total) if total <= self.settings.daily_token_quota => {
                entry.day_tokens = total;
                GuardrailDecision::Allowed
            }
            _ => GuardrailDecision::Denied(DenyReason::DailyTokenQuota {
                limit: self.settings.daily_token_quota,
                used: entry.day_tokens,
                requested: tokens,
            }),
        };
        drop(state);

        self.observe("tokens", tenant, &decision);
        decision
    }

    /// Add `usd` to this month's spend unless that would exceed the cap.
    pub fn record_cost(&self, usd: f64) -> GuardrailDecision {
        if !self.is_enabled() {
            return GuardrailDecision::Allowed;
        }
        let month = month_key(self.clock.now());

        let mut state = self.lock();
        if state.month != month {
            state.month = month;
            state.month_cost_usd = 0.0;
        }

        let decision = if !usd.is_finite() || usd < 0.0 {
            GuardrailDecision::Denied(DenyReason::InvalidAmount { amount: usd })
        } else if state.month_cost_usd + usd > self.settings.monthly_cap_usd {
            GuardrailDecision::Denied(DenyReason::MonthlyCostCap {
                cap_usd: self.settings.monthly_cap_usd,
                spent_usd: state.month_cost_usd,
                requested_usd: usd,
            })
        } else {
            state.month_cost_usd += usd;
            GuardrailDecision::Allowed
        };
        drop(state);

        self.observe("cost", "global", &decision);
        decision
    }

    pub fn enforce_request(&self, tenant: &str) -> Result<()> {
        self.allow_request(tenant).into_result(tenant)
    }

    pub fn enforce_tokens(&self, tenant: &str, tokens: u64) -> Result<()> {
        self.record_tokens(tenant, tokens).into_result(tenant)
    }

    pub fn enforce_cost(&self, usd: f64) -> Result<()> {
        self.record_cost(usd).into_result("global")
    }

    /// Current usage and headroom for `tenant`. Does not mutate state.
    pub fn usage_snapshot(&self, tenant: &str) -> UsageSnapshot {
        let now = self.clock.now();
        let today = day_key(now);
        let month = month_key(now);
        let settings = &self.settings;

        let state = self.lock();
        let (last_minute, requests_today, tokens_today) = match state.tenants.get(tenant) {
            Some(entry) if entry.day == today => {
                (entry.in_window(now) as u64, entry.day_requests, entry.day_tokens)
            }
            Some(entry) => (entry.in_window(now) as u64, 0, 0),
            None => (0, 0, 0),
        };
        let monthly_cost = if state.month == month { state.month_cost_usd } else { 0.0 };
        drop(state);

        UsageSnapshot {
            enabled: settings.low_cost_mode,
            tenant: tenant.to_string(),
            requests_last_minute: last_minute,
            rate_limit_rpm: settings.rate_limit_rpm,
            rpm_remaining: u64::from(settings.rate_limit_rpm).saturating_sub(last_minute),
            day: today,
            requests_today,
            daily_request_quota: settings.daily_request_quota,
            daily_requests_remaining: settings.daily_request_quota.saturating_sub(requests_today),
            tokens_today,
            daily_token_quota: settings.daily_token_quota,
            daily_tokens_remaining: settings.daily_token_quota.saturating_sub(tokens_today),
            month,
            monthly_cost_usd: monthly_cost,
            monthly_cap_usd: settings.monthly_cap_usd,
            monthly_cost_remaining_usd: (settings.monthly_cap_usd - monthly_cost).max(0.0),
        }
    }

    fn observe(&self, check: &'static str, tenant: &str, decision: &GuardrailDecision) {
        let outcome = match decision {
            GuardrailDecision::Allowed => "allowed",
            GuardrailDecision::Denied(reason) => {
                tracing::warn!(check, tenant, reason = %reason, "Guardrail denied");
                "denied"
            }
        };
        metrics::counter!("guardrail_decisions_total", "check" => check, "outcome" => outcome).increment(1);
    }

    fn lock(&self) -> MutexGuard<'_, GuardrailState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn settings() -> GuardrailSettings {
        GuardrailSettings {
            low_cost_mode: true,
            rate_limit_rpm: 2,
            daily_request_quota: 5,
            daily_token_quota: 1_000,
            monthly_cap_usd: 10.0,
        }
    }

    fn guardrail(settings: GuardrailSettings) -> (CostGuardrail, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 14, 12, 0, 0).unwrap()));
        (CostGuardrail::with_clock(settings, clock.clone()), clock)
    }

    #[test]
    fn test_rpm_window_slides() {
        let (guardrail, clock) = guardrail(settings());
        let mut outcomes = Vec::new();
        for _ in 0..3 {
            outcomes.push(guardrail.allow_request("tenantA").is_allowed());
            clock.advance(Duration::from_millis(300));
        }
        assert_eq!(outcomes, vec![true, true, false]);

        clock.advance(Duration::from_secs(61));
        assert!(guardrail.allow_request("tenantA").is_allowed());
    }

    #[test]
    fn test_rate_denial_maps_to_rate_limited_error() {
        let (guardrail, clock) = guardrail(settings());
        guardrail.enforce_request("t").unwrap();
        clock.advance(Duration::from_secs(20));
        guardrail.enforce_request("t").unwrap();

        let err = guardrail.enforce_request("t").unwrap_err();
        assert!(matches!(err, Error::RateLimited { limit: 2, .. }));
        assert_eq!(err.retry_after(), Some(Duration::from_secs(40)));
    }

    #[test]
    fn test_tenants_are_independent() {
        let (guardrail, _clock) = guardrail(settings());
        assert!(guardrail.allow_request("a").is_allowed());
        assert!(guardrail.allow_request("a").is_allowed());
        assert!(!guardrail.allow_request("a").is_allowed());
        assert!(guardrail.allow_request("b").is_allowed());
    }

    #[test]
    fn test_daily_quota_resets_at_utc_midnight() {
        let (guardrail, clock) = guardrail(settings());
        for _ in 0..5 {
            assert!(guardrail.allow_request("a").is_allowed());
            clock.advance(Duration::from_secs(61));
        }
        assert_eq!(
            guardrail.allow_request("a"),
            GuardrailDecision::Denied(DenyReason::DailyRequestQuota { limit: 5 })
        );

        clock.set(Utc.with_ymd_and_hms(2026, 3, 15, 0, 0, 1).unwrap());
        assert!(guardrail.allow_request("a").is_allowed());
        assert_eq!(guardrail.usage_snapshot("a").requests_today, 1);
    }

    #[test]
    fn test_idle_tenants_evicted_after_day_rolls() {
        let (guardrail, clock) = guardrail(settings());
        for tenant in ["a", "b", "c"] {
            assert!(guardrail.allow_request(tenant).is_allowed());
        }
        guardrail.record_tokens("d", 10);
        assert_eq!(guardrail.lock().tenants.len(), 4);

        clock.set(Utc.with_ymd_and_hms(2026, 3, 14, 23, 59, 30).unwrap());
        assert!(guardrail.allow_request("late").is_allowed());

        clock.set(Utc.with_ymd_and_hms(2026, 3, 15, 0, 0, 10).unwrap());
        assert!(guardrail.allow_request("e").is_allowed());

        // "late" still has a request inside the window and survives.
        let tenants: Vec<String> = guardrail.lock().tenants.keys().cloned().collect();
        assert_eq!(tenants.len(), 2);
        assert!(tenants.contains(&"late".to_string()));
        assert_eq!(guardrail.usage_snapshot("late").requests_last_minute, 1);
        assert_eq!(guardrail.usage_snapshot("a").requests_today, 0);
    }

    #[test]
    fn test_monthly_cap() {
        let (guardrail, clock) = guardrail(settings());
        assert!(guardrail.record_cost(6.0).is_allowed());
        assert!(!guardrail.record_cost(5.0).is_allowed());
        assert_eq!(guardrail.usage_snapshot("any").monthly_cost_usd, 6.0);

        assert!(!guardrail.record_cost(-1.0).is_allowed());
        assert!(!guardrail.record_cost(f64::NAN).is_allowed());
        assert!(guardrail.enforce_cost(f64::NAN).unwrap_err().is_caller_fault());

        clock.set(Utc.with_ymd_and_hms(2026, 4, 1, 0, 0, 0).unwrap());
        assert!(guardrail.record_cost(9.0).is_allowed());
    }

    #[test]
    fn test_token_quota_rejects_without_recording() {
        let (guardrail, _clock) = guardrail(settings());
        assert!(guardrail.record_tokens("a", 800).is_allowed());
        assert!(!guardrail.record_tokens("a", 201).is_allowed());
        assert!(guardrail.record_tokens("a", 200).is_allowed());
        assert!(matches!(guardrail.enforce_tokens("a", 1), Err(Error::QuotaExceeded(_))));

        let snapshot = guardrail.usage_snapshot("a");
        assert_eq!(snapshot.tokens_today, 1_000);
        assert_eq!(snapshot.daily_tokens_remaining, 0);
    }

    #[test]
    fn test_disabled_mode_is_pass_through() {
        let (guardrail, _clock) = guardrail(GuardrailSettings {
            low_cost_mode: false,
            ..settings()
        });
        for _ in 0..100 {
            assert!(guardrail.allow_request("a").is_allowed());
        }
        assert!(guardrail.record_cost(1_000.0).is_allowed());

        let snapshot = guardrail.usage_snapshot("a");
        assert!(!snapshot.enabled);
        assert_eq!(snapshot.requests_today, 0);
    }

    #[test]
    fn test_snapshot_reports_headroom() {
        let (guardrail, _clock) = guardrail(settings());
        guardrail.allow_request("a");
        guardrail.record_cost(2.5);

        let snapshot = guardrail.usage_snapshot("a");
        assert_eq!(snapshot.requests_last_minute, 1);
        assert_eq!(snapshot.rpm_remaining, 1);
        assert_eq!(snapshot.daily_requests_remaining, 4);
        assert_eq!(snapshot.monthly_cost_remaining_usd, 7.5);
        assert_eq!(snapshot.day, "2026-03-14");
    }

    #[tokio::test]
    async fn test_concurrent_requests_respect_limit() {
        let (guardrail, _clock) = guardrail(GuardrailSettings {
            rate_limit_rpm: 10,
            daily_request_quota: 1_000,
            ..settings()
        });
        let guardrail = Arc::new(guardrail);

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..50 {
            let guardrail = guardrail.clone();
            tasks.spawn(async move { guardrail.allow_request("burst").is_allowed() });
        }
        let mut allowed = 0;
        while let Some(result) = tasks.join_next().await {
            if result.unwrap() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 10);
    }
}
