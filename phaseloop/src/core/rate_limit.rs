//! Hourly call budget and provider-overload cooldown.
//!
//! All deadlines are wall-clock timestamps checked lazily when `check` is
//! called; nothing here runs on a timer.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, TimeDelta, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

pub const DEFAULT_CALLS_PER_HOUR: u32 = 100;
/// Length of the rolling call window.
pub const HOURLY_WINDOW_MINUTES: i64 = 60;
/// Fixed wait after the provider reports overload.
pub const COOLDOWN_MINUTES: i64 = 60;

pub fn hourly_window() -> TimeDelta {
    TimeDelta::minutes(HOURLY_WINDOW_MINUTES)
}

pub fn cooldown_duration() -> TimeDelta {
    TimeDelta::minutes(COOLDOWN_MINUTES)
}

/// Whether a worker error text indicates the external provider is overloaded.
pub fn looks_overloaded(message: &str) -> bool {
    static OVERLOAD_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?i)overloaded|rate[ _-]?limit|usage limit|too many requests|\b529\b")
            .expect("overload pattern should compile")
    });
    OVERLOAD_RE.is_match(message)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HourlyWindow {
    pub calls_made: u32,
    pub limit: u32,
    pub window_start: DateTime<Utc>,
    pub next_reset: DateTime<Utc>,
    /// Operator chose to continue past the limit for this window.
    #[serde(default)]
    pub override_active: bool,
    /// Operator chose to wait for the window to reset.
    #[serde(default)]
    pub awaiting_reset: bool,
}

impl HourlyWindow {
    fn starting_at(limit: u32, now: DateTime<Utc>) -> Self {
        Self {
            calls_made: 0,
            limit,
            window_start: now,
            next_reset: now + hourly_window(),
            override_active: false,
            awaiting_reset: false,
        }
    }

    pub fn exhausted(&self) -> bool {
        self.calls_made >= self.limit && !self.override_active
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cooldown {
    pub detected: bool,
    pub detected_at: Option<DateTime<Utc>>,
    pub resume_at: Option<DateTime<Utc>>,
    pub waiting: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Persisted limiter record (`rate_limit.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitState {
    pub revision: u64,
    pub hourly: HourlyWindow,
    pub cooldown: Cooldown,
    pub paused: bool,
    pub pause_reason: Option<String>,
}

/// Answer to "may the worker be invoked now?".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Permit {
    Granted,
    /// Provider cooldown in effect; block until `resume_at`.
    Cooldown { resume_at: DateTime<Utc> },
    /// Limit reached and the operator chose to wait; block until `next_reset`.
    AwaitReset { next_reset: DateTime<Utc> },
    /// Limit reached with no decision recorded; the loop must pause.
    LimitReached {
        calls_made: u32,
        limit: u32,
        next_reset: DateTime<Utc>,
    },
}

/// Operator decision once the hourly limit is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitDecision {
    Wait,
    Override,
    Abort,
}

impl fmt::Display for LimitDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LimitDecision::Wait => "wait",
            LimitDecision::Override => "override",
            LimitDecision::Abort => "abort",
        })
    }
}

impl FromStr for LimitDecision {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "wait" => Ok(LimitDecision::Wait),
            "override" => Ok(LimitDecision::Override),
            "abort" => Ok(LimitDecision::Abort),
            other => Err(format!(
                "unknown decision '{other}' (expected wait, override, or abort)"
            )),
        }
    }
}

impl RateLimitState {
    pub fn new(limit: u32, now: DateTime<Utc>) -> Self {
        Self {
            revision: 0,
            hourly: HourlyWindow::starting_at(limit, now),
            cooldown: Cooldown::default(),
            paused: false,
            pause_reason: None,
        }
    }

    /// Apply the configured ceiling (startup override).
    pub fn set_limit(&mut self, limit: u32) {
        self.hourly.limit = limit;
    }

    /// Lazily roll the hourly window and expire the cooldown.
    pub fn refresh(&mut self, now: DateTime<Utc>) {
        if now >= self.hourly.next_reset {
            self.hourly = HourlyWindow::starting_at(self.hourly.limit, now);
            self.paused = false;
            self.pause_reason = None;
        }
        if self.cooldown.waiting && self.cooldown.resume_at.is_some_and(|at| now >= at) {
            self.cooldown.waiting = false;
        }
    }

    /// Decide whether the next worker invocation may start at `now`.
    pub fn check(&mut self, now: DateTime<Utc>) -> Permit {
        self.refresh(now);

        if self.cooldown.waiting
            && let Some(resume_at) = self.cooldown.resume_at
        {
            return Permit::Cooldown { resume_at };
        }

        if self.hourly.exhausted() {
            if self.hourly.awaiting_reset {
                return Permit::AwaitReset {
                    next_reset: self.hourly.next_reset,
                };
            }
            self.paused = true;
            self.pause_reason = Some(format!(
                "hourly call limit reached ({}/{}); decide wait, override, or abort",
                self.hourly.calls_made, self.hourly.limit
            ));
            return Permit::LimitReached {
                calls_made: self.hourly.calls_made,
                limit: self.hourly.limit,
                next_reset: self.hourly.next_reset,
            };
        }

        Permit::Granted
    }

    /// Count one finished invocation, successful or not.
    pub fn record_call(&mut self) {
        self.hourly.calls_made = self.hourly.calls_made.saturating_add(1);
    }

    /// Start the provider-overload cooldown window.
    pub fn open_cooldown(&mut self, now: DateTime<Utc>, reason: &str) {
        self.cooldown = Cooldown {
            detected: true,
            detected_at: Some(now),
            resume_at: Some(now + cooldown_duration()),
            waiting: true,
            reason: Some(reason.to_string()),
        };
    }

    /// True while the limiter waits for an operator decision.
    pub fn awaiting_decision(&self) -> bool {
        self.paused
    }

    /// Record the operator's answer to a reached limit.
    pub fn apply_decision(&mut self, decision: LimitDecision) {
        match decision {
            LimitDecision::Wait => self.hourly.awaiting_reset = true,
            LimitDecision::Override => self.hourly.override_active = true,
            LimitDecision::Abort => {}
        }
        self.paused = false;
        self.pause_reason = None;
    }
}
