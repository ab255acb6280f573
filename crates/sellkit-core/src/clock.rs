use std::cell::Cell;
use std::rc::Rc;

use time::{Duration, OffsetDateTime};

pub trait Clock {
    fn now(&self) -> OffsetDateTime;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// Clock that only moves when told to. Clones share the same instant, so a page simulation and
/// the widget it drives observe the same time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Rc<Cell<OffsetDateTime>>,
}

impl ManualClock {
    #[must_use]
    pub fn new(start: OffsetDateTime) -> Self {
        Self { now: Rc::new(Cell::new(start)) }
    }

    pub fn set(&self, instant: OffsetDateTime) {
        self.now.set(instant);
    }

    pub fn advance(&self, by: Duration) {
        self.now.set(self.now.get() + by);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> OffsetDateTime {
        self.now.get()
    }
}
