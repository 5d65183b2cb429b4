use crate::telemetry::Point;
use std::collections::VecDeque;

/// Where an admitted batch ended up. `dropped` points are gone for good and
/// must be counted by the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Admission {
    pub fresh: usize,
    pub backlog: usize,
    pub dropped: usize,
}

/// Two bounded tiers. New points compete for backlog space, never for
/// already-buffered fresh space.
#[derive(Debug)]
pub struct TieredBuffer {
    fresh: Vec<Point>,
    backlog: VecDeque<Point>,
    fresh_limit: usize,
    backlog_limit: usize,
}

impl TieredBuffer {
    pub fn new(fresh_limit: usize, backlog_limit: usize) -> Self {
        Self {
            fresh: Vec::with_capacity(fresh_limit),
            backlog: VecDeque::new(),
            fresh_limit,
            backlog_limit,
        }
    }

    pub fn fresh_len(&self) -> usize {
        self.fresh.len()
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    pub fn fresh_limit(&self) -> usize {
        self.fresh_limit
    }

    pub fn backlog_limit(&self) -> usize {
        self.backlog_limit
    }

    pub fn len(&self) -> usize {
        self.fresh.len() + self.backlog.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fresh.is_empty() && self.backlog.is_empty()
    }

    pub fn fresh(&self) -> &[Point] {
        &self.fresh
    }

    pub fn admit(&mut self, mut points: Vec<Point>) -> Admission {
        let mut admission = Admission::default();
        let room = self.fresh_limit.saturating_sub(self.fresh.len());
        let remainder = if points.len() > room {
            points.split_off(room)
        } else {
            Vec::new()
        };
        admission.fresh = points.len();
        self.fresh.extend(points);

        if remainder.is_empty() {
            return admission;
        }
        if self.backlog.len() + remainder.len() <= self.backlog_limit {
            admission.backlog = remainder.len();
            self.backlog.extend(remainder);
        } else {
            admission.dropped = remainder.len();
        }
        admission
    }

    /// Moves every fresh point to the back of the backlog. Points that do not
    /// fit are discarded; returns how many.
    pub fn demote_fresh(&mut self) -> usize {
        let room = self.backlog_limit.saturating_sub(self.backlog.len());
        let total = self.fresh.len();
        let kept = total.min(room);
        self.backlog.extend(self.fresh.drain(..kept));
        self.fresh.clear();
        total - kept
    }

    pub fn clear_fresh(&mut self) -> usize {
        let len = self.fresh.len();
        self.fresh.clear();
        len
    }

    /// The oldest `max` backlog points, left in place until released.
    pub fn backlog_chunk(&mut self, max: usize) -> &[Point] {
        let len = max.min(self.backlog.len());
        &self.backlog.make_contiguous()[..len]
    }

    pub fn release_backlog(&mut self, count: usize) -> usize {
        let count = count.min(self.backlog.len());
        self.backlog.drain(..count);
        count
    }

    /// Empties both tiers, returning how many points were discarded.
    pub fn discard_all(&mut self) -> usize {
        let len = self.len();
        self.fresh.clear();
        self.backlog.clear();
        len
    }
}
