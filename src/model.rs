use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, NaiveTime, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// UTC instant — the only time type on the wire and in the WAL.
/// Slots are identified by their exact start instant.
pub type Stamp = DateTime<Utc>;

/// Externally visible state of a single slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotState {
    Available,
    Held,
    Booked,
}

/// Opaque client-chosen identity proving hold ownership. Compared by
/// exact equality, never parsed. Deliberately has no Display impl so it
/// does not end up in logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HolderToken(String);

impl HolderToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// One recurring availability window. Slot starts are generated every
/// `slot_minutes` from `start`, keeping only those that end by `end`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateWindow {
    pub weekday: Weekday,
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub slot_minutes: u32,
}

/// Weekly recurrence defining which slot starts exist for a resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeekTemplate {
    pub windows: Vec<TemplateWindow>,
}

impl WeekTemplate {
    /// True when some window generates a slot starting exactly at `at`.
    pub fn generates(&self, at: Stamp) -> bool {
        if at.time().nanosecond() != 0 {
            return false;
        }
        let secs = at.time().num_seconds_from_midnight();
        self.windows.iter().any(|w| {
            let start = w.start.num_seconds_from_midnight();
            let end = w.end.num_seconds_from_midnight();
            let step = w.slot_minutes.saturating_mul(60);
            w.weekday == at.weekday()
                && step > 0
                && secs >= start
                && (secs - start) % step == 0
                && secs + step <= end
        })
    }
}

/// Per-slot departure from the template. No override means the template
/// alone decides whether the slot exists and it reads as available.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotOverride {
    /// Temporary exclusive claim with a deadline.
    Held {
        holder: HolderToken,
        held_at: Stamp,
        expires_at: Stamp,
    },
    /// Terminal. Never reopened by this process.
    Booked { booking_id: Ulid },
}

impl SlotOverride {
    /// State this override presents at `now`. Expired holds read as available.
    pub fn state_at(&self, now: Stamp) -> SlotState {
        match self {
            SlotOverride::Held { expires_at, .. } if *expires_at <= now => SlotState::Available,
            SlotOverride::Held { .. } => SlotState::Held,
            SlotOverride::Booked { .. } => SlotState::Booked,
        }
    }
}

/// Full slot knowledge for one resource: the weekly template plus any
/// per-slot overrides, keyed by slot start.
#[derive(Debug, Clone)]
pub struct ResourceCalendar {
    pub id: Ulid,
    pub template: WeekTemplate,
    pub overrides: BTreeMap<Stamp, SlotOverride>,
}

impl ResourceCalendar {
    pub fn new(id: Ulid) -> Self {
        Self {
            id,
            template: WeekTemplate::default(),
            overrides: BTreeMap::new(),
        }
    }

    /// Override in force for the slot starting at `start`, as seen at
    /// `now`. An expired hold is already dead — it reads as no override
    /// even before the reaper removes it.
    pub fn live_override(&self, start: Stamp, now: Stamp) -> Option<&SlotOverride> {
        match self.overrides.get(&start) {
            Some(SlotOverride::Held { expires_at, .. }) if *expires_at <= now => None,
            other => other,
        }
    }
}

/// Append-only WAL record. Every accepted mutation is exactly one event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    /// Weekly template replaced. Existing overrides survive.
    ScheduleDefined {
        resource_id: Ulid,
        template: WeekTemplate,
    },
    HoldPlaced {
        resource_id: Ulid,
        start: Stamp,
        holder: HolderToken,
        held_at: Stamp,
        expires_at: Stamp,
    },
    HoldReleased { resource_id: Ulid, start: Stamp },
    /// Hold converted into a booking via the coordinator.
    SlotBooked {
        resource_id: Ulid,
        start: Stamp,
        booking_id: Ulid,
    },
    /// Slot closed by an external system, bypassing the hold protocol.
    SlotOccupied {
        resource_id: Ulid,
        start: Stamp,
        booking_id: Ulid,
    },
}

impl Event {
    /// Resource this event belongs to. Fan-out channels are keyed by this.
    pub fn resource_id(&self) -> Ulid {
        match self {
            Event::ScheduleDefined { resource_id, .. }
            | Event::HoldPlaced { resource_id, .. }
            | Event::HoldReleased { resource_id, .. }
            | Event::SlotBooked { resource_id, .. }
            | Event::SlotOccupied { resource_id, .. } => *resource_id,
        }
    }

    /// Wire form sent to stream subscribers. Booked and occupied look the
    /// same to clients; a template change is only a hint to refetch.
    pub fn to_wire(&self, emitted_at: Stamp) -> SlotEvent {
        match self {
            Event::ScheduleDefined { resource_id, .. } => SlotEvent {
                kind: SlotEventKind::CalendarUpdated,
                resource_id: *resource_id,
                datetime: None,
                emitted_at,
            },
            Event::HoldPlaced {
                resource_id, start, ..
            } => SlotEvent {
                kind: SlotEventKind::Held,
                resource_id: *resource_id,
                datetime: Some(*start),
                emitted_at,
            },
            Event::HoldReleased { resource_id, start } => SlotEvent {
                kind: SlotEventKind::Released,
                resource_id: *resource_id,
                datetime: Some(*start),
                emitted_at,
            },
            Event::SlotBooked {
                resource_id, start, ..
            }
            | Event::SlotOccupied {
                resource_id, start, ..
            } => SlotEvent {
                kind: SlotEventKind::Booked,
                resource_id: *resource_id,
                datetime: Some(*start),
                emitted_at,
            },
        }
    }
}

/// Discriminator on the wire event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotEventKind {
    Held,
    Released,
    Booked,
    CalendarUpdated,
}

/// Event shape streamed to subscribers, one JSON object per line.
/// `datetime` is absent for calendar_updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotEvent {
    #[serde(rename = "type")]
    pub kind: SlotEventKind,
    pub resource_id: Ulid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datetime: Option<Stamp>,
    pub emitted_at: Stamp,
}

/// Point-in-time view of a resource's slots over the snapshot horizon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalendarSnapshot {
    pub resource_id: Ulid,
    pub generated_at: Stamp,
    pub slots: BTreeMap<Stamp, SlotState>,
}

/// Durable record handed to the booking store when a hold is confirmed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookingRecord {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub start: Stamp,
    pub payload: serde_json::Value,
    pub recorded_at: Stamp,
}
