use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::project::Environment;
use crate::services::caddy::ProxyActivation;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum SlotColor {
    Blue,
    Green,
}

impl SlotColor {
    pub fn other(self) -> Self {
        match self {
            Self::Blue => Self::Green,
            Self::Green => Self::Blue,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Blue => "blue",
            Self::Green => "green",
        }
    }
}

impl fmt::Display for SlotColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SlotState {
    Empty,
    Deploying,
    Deployed,
    Active,
    Grace,
    Draining,
}

impl fmt::Display for SlotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Empty => "empty",
            Self::Deploying => "deploying",
            Self::Deployed => "deployed",
            Self::Active => "active",
            Self::Grace => "grace",
            Self::Draining => "draining",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Degraded,
    #[default]
    Unknown,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
            Self::Degraded => "degraded",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Slot {
    pub state: SlotState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployed_by: Option<String>,
    #[serde(default)]
    pub health_status: HealthStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Slot {
    pub fn empty() -> Self {
        Self {
            state: SlotState::Empty,
            port: None,
            version: None,
            image: None,
            deployed_at: None,
            deployed_by: None,
            health_status: HealthStatus::Unknown,
            error: None,
        }
    }

    /// Clear everything except the recorded port, which stays reserved for the next deploy.
    pub fn reset_keeping_port(&mut self) {
        let port = self.port;
        *self = Self::empty();
        self.port = port;
    }
}

impl Default for Slot {
    fn default() -> Self {
        Self::empty()
    }
}

/// Blue/green registry for one project-environment pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SlotRegistry {
    pub project: String,
    pub environment: Environment,
    pub active_slot: Option<SlotColor>,
    pub blue: Slot,
    pub green: Slot,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grace_expires_at: Option<DateTime<Utc>>,
    pub last_updated: DateTime<Utc>,
}

impl SlotRegistry {
    pub fn new(project: &str, environment: Environment) -> Self {
        Self {
            project: project.to_string(),
            environment,
            active_slot: None,
            blue: Slot::empty(),
            green: Slot::empty(),
            grace_expires_at: None,
            last_updated: Utc::now(),
        }
    }

    pub fn slot(&self, color: SlotColor) -> &Slot {
        match color {
            SlotColor::Blue => &self.blue,
            SlotColor::Green => &self.green,
        }
    }

    pub fn slot_mut(&mut self, color: SlotColor) -> &mut Slot {
        match color {
            SlotColor::Blue => &mut self.blue,
            SlotColor::Green => &mut self.green,
        }
    }

    /// The slot a new deploy lands in. Blue on a fresh registry.
    pub fn inactive_color(&self) -> SlotColor {
        match self.active_slot {
            Some(active) => active.other(),
            None => SlotColor::Blue,
        }
    }

    pub fn find_in_state(&self, state: SlotState) -> Option<SlotColor> {
        [SlotColor::Blue, SlotColor::Green]
            .into_iter()
            .find(|c| self.slot(*c).state == state)
    }

    /// The grace slot, if its window is still open at `now`.
    pub fn open_grace_slot(&self, now: DateTime<Utc>) -> Option<SlotColor> {
        let color = self.find_in_state(SlotState::Grace)?;
        match self.grace_expires_at {
            Some(expires) if expires > now => Some(color),
            _ => None,
        }
    }

    /// The grace slot, if its window closed at or before `now`.
    pub fn expired_grace_slot(&self, now: DateTime<Utc>) -> Option<SlotColor> {
        let color = self.find_in_state(SlotState::Grace)?;
        match self.grace_expires_at {
            Some(expires) if expires > now => None,
            _ => Some(color),
        }
    }

    /// Make `color` the live slot and move the previously active one into grace.
    ///
    /// Requires the activation produced by a verified proxy reload for the same port.
    /// Returns the color that went into grace, if any.
    pub fn activate(
        &mut self,
        color: SlotColor,
        activation: &ProxyActivation,
        grace_period: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<SlotColor>, String> {
        let port = self.slot(color).port;
        if port != Some(activation.port()) {
            return Err(format!(
                "proxy points at port {} but slot {color} is on {port:?}",
                activation.port()
            ));
        }

        let previous = self.active_slot.filter(|p| *p != color);
        self.slot_mut(color).state = SlotState::Active;
        self.slot_mut(color).error = None;
        self.active_slot = Some(color);

        match previous {
            Some(prev) => {
                self.slot_mut(prev).state = SlotState::Grace;
                self.grace_expires_at = Some(now + grace_period);
            }
            None => {
                // A grace slot from an earlier promote keeps its own window.
                if self.find_in_state(SlotState::Grace).is_none() {
                    self.grace_expires_at = None;
                }
            }
        }
        self.last_updated = now;
        Ok(previous)
    }

    /// Check the structural invariants that every persisted registry must hold.
    pub fn validate(&self) -> Result<(), String> {
        let actives: Vec<SlotColor> = [SlotColor::Blue, SlotColor::Green]
            .into_iter()
            .filter(|c| self.slot(*c).state == SlotState::Active)
            .collect();
        if actives.len() > 1 {
            return Err("both slots are active".into());
        }
        if actives.first().copied() != self.active_slot {
            return Err(format!(
                "activeSlot {:?} disagrees with slot states (active: {:?})",
                self.active_slot,
                actives.first()
            ));
        }
        let has_grace = self.find_in_state(SlotState::Grace).is_some();
        if has_grace != self.grace_expires_at.is_some() {
            return Err("graceExpiresAt must be set exactly when a slot is in grace".into());
        }
        Ok(())
    }
}
