use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(u64);

/// Cancelable one-shot timers keyed by deadline. Nothing here sleeps; the
/// owner asks for the next deadline and drains what is due.
#[derive(Debug)]
pub struct TimerScheduler<E> {
    next_id: u64,
    queue: BTreeMap<(DateTime<Utc>, u64), E>,
    deadlines: HashMap<u64, DateTime<Utc>>,
}

impl<E> Default for TimerScheduler<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> TimerScheduler<E> {
    pub fn new() -> Self {
        Self {
            next_id: 0,
            queue: BTreeMap::new(),
            deadlines: HashMap::new(),
        }
    }

    pub fn schedule(&mut self, now: DateTime<Utc>, delay_ms: u64, event: E) -> TimerHandle {
        self.next_id += 1;
        let id = self.next_id;
        let deadline = now + Duration::milliseconds(i64::try_from(delay_ms).unwrap_or(i64::MAX / 2));
        self.queue.insert((deadline, id), event);
        self.deadlines.insert(id, deadline);
        TimerHandle(id)
    }

    /// Returns false when the timer already fired or was canceled.
    pub fn cancel(&mut self, handle: TimerHandle) -> bool {
        match self.deadlines.remove(&handle.0) {
            Some(deadline) => self.queue.remove(&(deadline, handle.0)).is_some(),
            None => false,
        }
    }

    pub fn cancel_all(&mut self) {
        self.queue.clear();
        self.deadlines.clear();
    }

    pub fn deadline(&self, handle: TimerHandle) -> Option<DateTime<Utc>> {
        self.deadlines.get(&handle.0).copied()
    }

    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.queue.keys().next().map(|(deadline, _)| *deadline)
    }

    /// Removes and returns every event with `deadline <= now`, earliest first.
    pub fn drain_due(&mut self, now: DateTime<Utc>) -> Vec<E> {
        let mut due = Vec::new();
        while let Some(entry) = self.queue.first_entry() {
            let (deadline, id) = *entry.key();
            if deadline > now {
                break;
            }
            due.push(entry.remove());
            self.deadlines.remove(&id);
        }
        due
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
