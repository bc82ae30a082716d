//! Operator alerts raised by STOP_AND_ALERT guards and kill-switch halts.

use std::cell::RefCell;

use serde::Serialize;
use tracing::error;

use crate::core::types::Phase;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Alert {
    pub phase: Phase,
    /// Rule ids that triggered the alert.
    pub rules: Vec<String>,
    pub message: String,
}

pub trait AlertSink {
    fn raise(&self, alert: &Alert);
}

/// Emits alerts as `error!` events.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn raise(&self, alert: &Alert) {
        error!(
            phase = %alert.phase,
            rules = ?alert.rules,
            message = %alert.message,
            "operator alert"
        );
    }
}

/// Collects alerts in memory.
#[derive(Debug, Default)]
pub struct RecordingAlertSink {
    alerts: RefCell<Vec<Alert>>,
}

impl RecordingAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.borrow().clone()
    }
}

impl AlertSink for RecordingAlertSink {
    fn raise(&self, alert: &Alert) {
        self.alerts.borrow_mut().push(alert.clone());
    }
}
