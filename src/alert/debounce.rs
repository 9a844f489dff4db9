use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::{AlertConfig, Config, DebouncePolicy};
use crate::sampler::Sample;

use super::AlertMessage;

/// Result of evaluating one sample.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    None,
    Fire(AlertMessage),
}

impl Action {
    pub fn is_fire(&self) -> bool {
        matches!(self, Self::Fire(_))
    }
}

/// Debounce state, mutated once per evaluated sample.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertState {
    pub threshold: f64,
    pub sustain: Duration,
    pub cooldown: Duration,
    /// Start of the current run of high samples (sustained policy only).
    pub since_above_threshold: Option<DateTime<Utc>>,
    pub last_alert_sent: Option<DateTime<Utc>>,
}

/// Decides when a run of high CPU samples turns into an alert.
///
/// Time is taken from sample timestamps, never from the wall clock, so the
/// same sample sequence always yields the same decisions.
#[derive(Debug, Clone)]
pub struct Debouncer {
    state: AlertState,
    policy: DebouncePolicy,
    enabled: bool,
    host: String,
    subject: String,
    recipient: String,
}

impl Debouncer {
    /// Creates a debouncer. Without a recipient or a positive threshold it
    /// is disabled and never fires.
    pub fn new(cfg: &AlertConfig, host: &str, recipient: Option<&str>) -> Self {
        let recipient = recipient.unwrap_or_default().trim().to_string();
        let enabled = !recipient.is_empty() && cfg.threshold > 0.0;

        Self {
            state: AlertState {
                threshold: cfg.threshold,
                sustain: cfg.sustain,
                cooldown: cfg.cooldown,
                since_above_threshold: None,
                last_alert_sent: None,
            },
            policy: cfg.policy,
            enabled,
            host: host.to_string(),
            subject: cfg.subject.clone(),
            recipient,
        }
    }

    /// Creates a debouncer that is enabled only when alert delivery is fully
    /// configured.
    pub fn from_config(cfg: &Config) -> Self {
        let recipient = cfg
            .alerting_enabled()
            .then_some(cfg.smtp.recipient.as_str());

        Self::new(&cfg.alert, &cfg.host, recipient)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn policy(&self) -> DebouncePolicy {
        self.policy
    }

    pub fn state(&self) -> &AlertState {
        &self.state
    }

    /// Feed one sample and decide whether to alert.
    pub fn evaluate(&mut self, sample: &Sample) -> Action {
        if !self.enabled {
            return Action::None;
        }

        let fire = match self.policy {
            DebouncePolicy::Sustained => self.evaluate_sustained(sample),
            DebouncePolicy::Cooldown => self.evaluate_cooldown(sample),
        };

        if !fire {
            return Action::None;
        }

        self.state.last_alert_sent = Some(sample.timestamp);
        Action::Fire(self.message(sample))
    }

    fn evaluate_sustained(&mut self, sample: &Sample) -> bool {
        if sample.percent <= self.state.threshold {
            self.state.since_above_threshold = None;
            return false;
        }

        let Some(since) = self.state.since_above_threshold else {
            self.state.since_above_threshold = Some(sample.timestamp);
            return false;
        };

        if elapsed(since, sample.timestamp) < self.state.sustain {
            return false;
        }

        // Restart the window so sustained load alerts once per sustain.
        self.state.since_above_threshold = Some(sample.timestamp);
        true
    }

    fn evaluate_cooldown(&self, sample: &Sample) -> bool {
        if sample.percent <= self.state.threshold {
            return false;
        }

        match self.state.last_alert_sent {
            None => true,
            Some(last) => elapsed(last, sample.timestamp) >= self.state.cooldown,
        }
    }

    fn message(&self, sample: &Sample) -> AlertMessage {
        let body = match self.policy {
            DebouncePolicy::Sustained => format!(
                "CPU usage on {} has exceeded {:.2}% for over {}. Current usage: {:.2}%",
                self.host,
                self.state.threshold,
                humantime::format_duration(self.state.sustain),
                sample.percent
            ),
            DebouncePolicy::Cooldown => format!(
                "CPU usage on {} is above {:.2}%. Current usage: {:.2}%",
                self.host, self.state.threshold, sample.percent
            ),
        };

        AlertMessage {
            subject: self.subject.clone(),
            body,
            recipient: self.recipient.clone(),
        }
    }
}

/// Elapsed time between two instants. A backwards step counts as zero.
fn elapsed(from: DateTime<Utc>, to: DateTime<Utc>) -> Duration {
    (to - from).to_std().unwrap_or(Duration::ZERO)
}
