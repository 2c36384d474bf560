//! Typed replacement for the beat trigger callback.
//!
//! A [`BeatSignal`] carries at most one pending [`BeatEvent`] to at most one
//! subscriber. Emitting while an earlier event is still pending replaces it:
//! the signal never queues.

use std::sync::{Arc, Mutex};

use crate::{BeatEvent, BeatReelError, Result};

#[derive(Debug, Default)]
struct Slot {
    subscribed: bool,
    pending: Option<BeatEvent>,
    emitted: u64,
    dropped: u64,
}

/// Producer side, owned by whoever runs beat detection.
#[derive(Debug, Clone, Default)]
pub struct BeatSignal {
    slot: Arc<Mutex<Slot>>,
}

/// Consumer side. Only one can exist per signal.
#[derive(Debug)]
pub struct BeatReceiver {
    slot: Arc<Mutex<Slot>>,
}

impl BeatSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the single consumer of this signal.
    pub fn subscribe(&self) -> Result<BeatReceiver> {
        let mut slot = self.lock()?;
        if slot.subscribed {
            return Err(BeatReelError::msg("beat signal already has a subscriber"));
        }
        slot.subscribed = true;
        Ok(BeatReceiver {
            slot: self.slot.clone(),
        })
    }

    pub fn has_subscriber(&self) -> Result<bool> {
        Ok(self.lock()?.subscribed)
    }

    /// Publishes `event`. Returns `false` when nobody listens or an unread
    /// event had to be discarded.
    pub fn emit(&self, event: BeatEvent) -> Result<bool> {
        let mut slot = self.lock()?;
        slot.emitted += 1;
        if !slot.subscribed {
            slot.dropped += 1;
            tracing::debug!(intensity = event.intensity, "beat emitted without subscriber");
            return Ok(false);
        }
        let replaced = slot.pending.replace(event).is_some();
        if replaced {
            slot.dropped += 1;
        }
        Ok(!replaced)
    }

    /// `(emitted, dropped)` counters since creation.
    pub fn stats(&self) -> Result<(u64, u64)> {
        let slot = self.lock()?;
        Ok((slot.emitted, slot.dropped))
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Slot>> {
        self.slot
            .lock()
            .map_err(|_| BeatReelError::msg("beat signal has been poisoned"))
    }
}

impl BeatReceiver {
    /// Takes the pending event, if any.
    pub fn take(&self) -> Result<Option<BeatEvent>> {
        let mut slot = self
            .slot
            .lock()
            .map_err(|_| BeatReelError::msg("beat signal has been poisoned"))?;
        Ok(slot.pending.take())
    }
}

impl Drop for BeatReceiver {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.slot.lock() {
            slot.subscribed = false;
            slot.pending = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn beat(ms: u64) -> BeatEvent {
        BeatEvent {
            timestamp: Duration::from_millis(ms),
            intensity: 0.5,
        }
    }

    #[test]
    fn allows_a_single_subscriber() {
        let signal = BeatSignal::new();
        let receiver = signal.subscribe().unwrap();
        assert!(signal.subscribe().is_err());

        drop(receiver);
        assert!(signal.subscribe().is_ok());
    }

    #[test]
    fn unobserved_events_are_dropped() {
        let signal = BeatSignal::new();
        assert!(!signal.emit(beat(0)).unwrap());
        assert_eq!(signal.stats().unwrap(), (1, 1));
    }

    #[test]
    fn pending_event_is_replaced_not_queued() {
        let signal = BeatSignal::new();
        let receiver = signal.subscribe().unwrap();

        assert!(signal.emit(beat(0)).unwrap());
        assert!(!signal.emit(beat(10)).unwrap());

        assert_eq!(receiver.take().unwrap(), Some(beat(10)));
        assert_eq!(receiver.take().unwrap(), None);
        assert_eq!(signal.stats().unwrap(), (2, 1));
    }
}
