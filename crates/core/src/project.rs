use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RosterError;
use crate::time::after_secs;

/// Identifies a project by its master URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(String);

impl ProjectId {
    pub fn new(url: impl Into<String>) -> Self {
        Self(url.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProjectId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ProjectId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Exponential backoff state for an unreachable project.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Backoff {
    /// Consecutive unreachable replies since the last successful contact.
    pub failures: u32,
    /// Interval applied after the most recent failure, in seconds.
    pub interval_secs: f64,
}

impl Backoff {
    /// Register a failure and return the next interval: `min` on the first
    /// failure, then doubling up to `max`.
    pub fn next_interval(&mut self, min_secs: f64, max_secs: f64) -> f64 {
        self.failures = self.failures.saturating_add(1);
        self.interval_secs = if self.failures == 1 {
            min_secs
        } else {
            (self.interval_secs * 2.0).clamp(min_secs, max_secs)
        };
        self.interval_secs
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// A project the host is attached to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    /// Relative entitlement to processor time. Always > 0.
    pub resource_share: f64,
    pub short_term_debt: f64,
    pub long_term_debt: f64,
    /// Wall seconds consumed since the last debt update.
    pub work_done_this_period: f64,
    /// Wall seconds consumed since the project was attached.
    pub total_wall_time: f64,
    pub suspended: bool,
    pub no_new_work: bool,
    pub next_contact_not_before: Option<DateTime<Utc>>,
    /// A work request is outstanding and its reply has not arrived yet.
    pub fetch_in_flight: bool,
    pub backoff: Backoff,
}

impl Project {
    pub fn new(
        id: impl Into<ProjectId>,
        name: impl Into<String>,
        resource_share: f64,
    ) -> Result<Self, RosterError> {
        let id = id.into();
        check_share(&id, resource_share)?;
        Ok(Self {
            id,
            name: name.into(),
            resource_share,
            short_term_debt: 0.0,
            long_term_debt: 0.0,
            work_done_this_period: 0.0,
            total_wall_time: 0.0,
            suspended: false,
            no_new_work: false,
            next_contact_not_before: None,
            fetch_in_flight: false,
            backoff: Backoff::default(),
        })
    }

    pub fn set_resource_share(&mut self, share: f64) -> Result<(), RosterError> {
        check_share(&self.id, share)?;
        self.resource_share = share;
        Ok(())
    }

    /// The project asked not to be contacted before some future instant.
    pub fn is_deferred(&self, now: DateTime<Utc>) -> bool {
        self.next_contact_not_before.is_some_and(|t| t > now)
    }

    pub fn record_usage(&mut self, wall_secs: f64) {
        self.work_done_this_period += wall_secs;
        self.total_wall_time += wall_secs;
    }

    /// Defer the project after an unreachable reply. Returns the interval applied.
    pub fn defer_after_failure(&mut self, now: DateTime<Utc>, min_secs: f64, max_secs: f64) -> f64 {
        let interval = self.backoff.next_interval(min_secs, max_secs);
        self.next_contact_not_before = Some(after_secs(now, interval));
        interval
    }

    /// Clear the backoff after any successful contact.
    pub fn record_contact(&mut self) {
        self.backoff.reset();
        self.next_contact_not_before = None;
    }
}

fn check_share(id: &ProjectId, share: f64) -> Result<(), RosterError> {
    if share.is_finite() && share > 0.0 {
        Ok(())
    } else {
        Err(RosterError::InvalidResourceShare {
            project: id.clone(),
            share,
        })
    }
}
