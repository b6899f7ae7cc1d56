use std::collections::BTreeMap;

use chrono::Utc;
use serde_json::Value;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::calendar::{build_snapshot, validate_template};
use super::{Registry, TransitionError};

impl Registry {
    /// Replace the resource's weekly template. Existing holds and bookings
    /// survive; subscribers get a calendar_updated hint to refetch.
    pub async fn define_schedule(
        &self,
        resource_id: Ulid,
        template: WeekTemplate,
    ) -> Result<(), TransitionError> {
        validate_template(&template)?;
        let cal = self.get_or_create(resource_id)?;
        let mut guard = cal.write().await;
        let event = Event::ScheduleDefined {
            resource_id,
            template,
        };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// Available → Held(holder). The sole way to claim a slot.
    pub async fn reserve(
        &self,
        resource_id: Ulid,
        start: Stamp,
        holder: &HolderToken,
    ) -> Result<(), TransitionError> {
        if holder.as_str().len() > MAX_HOLDER_TOKEN_LEN {
            return Err(TransitionError::LimitExceeded("holder token too long"));
        }
        let cal = self.get_or_create(resource_id)?;
        let mut guard = cal.write().await;
        let now = Utc::now();

        // State check before existence check: a slot that is held or booked
        // conflicts even when the template no longer generates it.
        if guard.live_override(start, now).is_some() {
            return Err(TransitionError::AlreadyHeld);
        }
        if !guard.template.generates(start) {
            return Err(TransitionError::OutsideCalendar);
        }
        if guard.overrides.len() >= MAX_OVERRIDES_PER_RESOURCE {
            return Err(TransitionError::LimitExceeded("too many overrides on resource"));
        }

        let event = Event::HoldPlaced {
            resource_id,
            start,
            holder: holder.clone(),
            held_at: now,
            expires_at: now + self.hold_ttl,
        };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// Held(holder) → Available. Succeeds silently when there is nothing
    /// to release — release must be safe to call on every exit path.
    pub async fn release(
        &self,
        resource_id: Ulid,
        start: Stamp,
        holder: &HolderToken,
    ) -> Result<(), TransitionError> {
        let Some(cal) = self.get_calendar(&resource_id) else {
            return Ok(());
        };
        let mut guard = cal.write().await;
        let now = Utc::now();

        match guard.live_override(start, now) {
            // Already available (or the hold lapsed) — idempotent, no event.
            None => return Ok(()),
            Some(SlotOverride::Booked { .. }) => return Err(TransitionError::NotHolder),
            Some(SlotOverride::Held { holder: h, .. }) if h != holder => {
                return Err(TransitionError::NotHolder);
            }
            Some(SlotOverride::Held { .. }) => {}
        }

        let event = Event::HoldReleased { resource_id, start };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// Held(holder) → Booked. The booking is recorded with the collaborator
    /// first; a WAL failure afterwards compensates by removing the record,
    /// so no state survives where one side exists without the other.
    pub async fn confirm(
        &self,
        resource_id: Ulid,
        start: Stamp,
        holder: &HolderToken,
        payload: Value,
    ) -> Result<Ulid, TransitionError> {
        if payload.to_string().len() > MAX_BOOKING_PAYLOAD_BYTES {
            return Err(TransitionError::LimitExceeded("booking payload too large"));
        }
        let Some(cal) = self.get_calendar(&resource_id) else {
            return Err(TransitionError::ExpiredHold);
        };
        let mut guard = cal.write().await;
        let now = Utc::now();

        match guard.live_override(start, now) {
            None => return Err(TransitionError::ExpiredHold),
            Some(SlotOverride::Booked { .. }) => return Err(TransitionError::NotHolder),
            Some(SlotOverride::Held { holder: h, .. }) if h != holder => {
                return Err(TransitionError::NotHolder);
            }
            Some(SlotOverride::Held { .. }) => {}
        }

        let booking_id = Ulid::new();
        let booking = BookingRecord {
            id: booking_id,
            resource_id,
            start,
            payload,
            recorded_at: now,
        };
        self.bookings
            .record(&booking)
            .await
            .map_err(|e| TransitionError::Booking(e.to_string()))?;

        let event = Event::SlotBooked {
            resource_id,
            start,
            booking_id,
        };
        if let Err(e) = self.persist_and_apply(&mut guard, &event).await {
            if let Err(rm) = self.bookings.remove(booking_id).await {
                tracing::error!("booking {booking_id} orphaned after WAL failure: {rm}");
            }
            return Err(e);
        }
        Ok(booking_id)
    }

    /// Any non-booked state → Booked, bypassing the hold protocol. External
    /// systems book directly; a displaced holder learns from the broadcast
    /// booked event. Does not touch the booking store — the external system
    /// already owns that record.
    pub async fn occupy(
        &self,
        resource_id: Ulid,
        start: Stamp,
        booking_id: Option<Ulid>,
    ) -> Result<Ulid, TransitionError> {
        let cal = self.get_or_create(resource_id)?;
        let mut guard = cal.write().await;
        let now = Utc::now();

        if let Some(SlotOverride::Booked { .. }) = guard.live_override(start, now) {
            return Err(TransitionError::AlreadyHeld);
        }
        if guard.overrides.len() >= MAX_OVERRIDES_PER_RESOURCE {
            return Err(TransitionError::LimitExceeded("too many overrides on resource"));
        }

        let booking_id = booking_id.unwrap_or_else(Ulid::new);
        let event = Event::SlotOccupied {
            resource_id,
            start,
            booking_id,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(booking_id)
    }

    /// Collect one expired hold, emitting the same released event an
    /// explicit release would. Ok(false) means the hold was refreshed,
    /// released, or booked since collection — a benign race.
    pub async fn expire_hold(
        &self,
        resource_id: Ulid,
        start: Stamp,
    ) -> Result<bool, TransitionError> {
        let Some(cal) = self.get_calendar(&resource_id) else {
            return Ok(false);
        };
        let mut guard = cal.write().await;
        let now = Utc::now();

        // Raw lookup, not live_override: the point is to see the dead entry.
        match guard.overrides.get(&start) {
            Some(SlotOverride::Held { expires_at, .. }) if *expires_at <= now => {}
            _ => return Ok(false),
        }

        let event = Event::HoldReleased { resource_id, start };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(true)
    }

    /// Calendar snapshot over the next `days` days. Unknown resources give
    /// an empty calendar, not an error — they simply have no template yet.
    pub async fn list_slots(&self, resource_id: Ulid, days: u32) -> CalendarSnapshot {
        let days = days.clamp(1, MAX_SNAPSHOT_DAYS);
        let now = Utc::now();
        match self.get_calendar(&resource_id) {
            Some(cal) => {
                let guard = cal.read().await;
                build_snapshot(&guard, now, days)
            }
            None => CalendarSnapshot {
                resource_id,
                generated_at: now,
                slots: BTreeMap::new(),
            },
        }
    }

    /// Current weekly template; empty for unknown resources.
    pub async fn get_template(&self, resource_id: Ulid) -> WeekTemplate {
        match self.get_calendar(&resource_id) {
            Some(cal) => cal.read().await.template.clone(),
            None => WeekTemplate::default(),
        }
    }
}
