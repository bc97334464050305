use qwatch_common::types::Timestamp;

struct Slot<B> {
    start: Timestamp,
    data: Option<B>,
}

/// Fixed ring of time buckets covering the most recent `window` ms.
///
/// A bucket is live while its start is within `(latest - window, latest]`
/// where `latest` is the start of the newest bucket seen. Moving `latest`
/// forward ("a tick") clears every slot that fell out of the window, so a
/// slot is never reused before its previous contents are dropped.
pub(crate) struct BucketRing<B> {
    granularity: i64,
    slots: Vec<Slot<B>>,
    latest: Option<Timestamp>,
    template: B,
}

impl<B: Clone> BucketRing<B> {
    /// `window_ms` is rounded down to a whole number of buckets, with at
    /// least one bucket.
    pub fn new(window_ms: i64, granularity_ms: i64, template: B) -> Self {
        let granularity = granularity_ms.max(1);
        let len = (window_ms / granularity).max(1) as usize;
        let slots = (0..len).map(|_| Slot { start: 0, data: None }).collect();
        Self {
            granularity,
            slots,
            latest: None,
            template,
        }
    }

    pub fn window(&self) -> i64 {
        self.granularity * self.slots.len() as i64
    }

    pub fn granularity(&self) -> i64 {
        self.granularity
    }

    pub fn bucket_count(&self) -> usize {
        self.slots.len()
    }

    pub fn align(&self, ts: Timestamp) -> Timestamp {
        ts - ts.rem_euclid(self.granularity)
    }

    /// Moves the clock forward to `ts`, evicting buckets that left the
    /// window. Returns `true` when a new bucket became current.
    pub fn advance(&mut self, ts: Timestamp) -> bool {
        let aligned = self.align(ts);
        if matches!(self.latest, Some(latest) if aligned <= latest) {
            return false;
        }
        self.latest = Some(aligned);
        let horizon = aligned - self.window();
        for slot in &mut self.slots {
            if slot.data.is_some() && slot.start <= horizon {
                slot.data = None;
            }
        }
        true
    }

    /// Bucket that `ts` falls into, created on demand. `None` when `ts`
    /// predates the window.
    pub fn bucket_mut(&mut self, ts: Timestamp) -> Option<&mut B> {
        self.advance(ts);
        let aligned = self.align(ts);
        let latest = self.latest?;
        if aligned <= latest - self.window() {
            return None;
        }
        let idx = aligned.div_euclid(self.granularity).rem_euclid(self.slots.len() as i64) as usize;
        let slot = &mut self.slots[idx];
        if slot.data.is_none() || slot.start != aligned {
            slot.start = aligned;
            slot.data = Some(self.template.clone());
        }
        slot.data.as_mut()
    }

    /// Live buckets as of the newest bucket seen.
    pub fn live(&self) -> impl Iterator<Item = &B> {
        self.live_at(None)
    }

    /// Live buckets as of `now` (or the newest bucket seen, whichever is
    /// later), without mutating the ring.
    pub fn live_at(&self, now: Option<Timestamp>) -> impl Iterator<Item = &B> {
        let latest = match (self.latest, now.map(|ts| self.align(ts))) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        let horizon = latest.map(|l| l - self.window());
        self.slots.iter().filter_map(move |slot| match (&slot.data, horizon) {
            (Some(data), Some(h)) if slot.start > h => Some(data),
            _ => None,
        })
    }

    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            slot.data = None;
        }
        self.latest = None;
    }
}
