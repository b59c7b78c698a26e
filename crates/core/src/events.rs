//! Deterministic single-threaded event kernel.
//!
//! All protocol timing in Airlink runs on simulated time: a component
//! registers a callback for a future instant and returns immediately,
//! and is re-entered when the kernel reaches that instant. Within one
//! instant events fire in registration order.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::rc::Rc;

/// Simulated time in seconds.
pub type Time = f64;

/// Handle to a pending event, used for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventHandle(u64);

struct Event {
    fire_at: Time,
    seq: u64,
    callback: Box<dyn FnOnce()>,
}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> Ordering {
        // reversed so the BinaryHeap pops the earliest event first;
        // seq breaks ties FIFO within one instant
        other
            .fire_at
            .total_cmp(&self.fire_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.fire_at == other.fire_at && self.seq == other.seq
    }
}

impl Eq for Event {}

struct Inner {
    now: Time,
    next_seq: u64,
    queue: BinaryHeap<Event>,
    cancelled: HashSet<u64>,
}

/// The event queue. Shared as `Rc<EventScheduler>`; interior
/// mutability lets a running callback schedule or cancel further
/// events.
pub struct EventScheduler {
    inner: RefCell<Inner>,
}

impl EventScheduler {
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            inner: RefCell::new(Inner {
                now: 0.0,
                next_seq: 0,
                queue: BinaryHeap::new(),
                cancelled: HashSet::new(),
            }),
        })
    }

    /// Current simulated time.
    pub fn now(&self) -> Time {
        self.inner.borrow().now
    }

    /// Schedule `callback` to fire at absolute time `at`.
    pub fn schedule_at(&self, at: Time, callback: impl FnOnce() + 'static) -> EventHandle {
        let mut inner = self.inner.borrow_mut();
        assert!(
            at >= inner.now,
            "cannot schedule an event in the past ({} < {})",
            at,
            inner.now
        );
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.queue.push(Event {
            fire_at: at,
            seq,
            callback: Box::new(callback),
        });
        EventHandle(seq)
    }

    /// Schedule `callback` to fire `delay` seconds from now.
    pub fn schedule_in(&self, delay: Time, callback: impl FnOnce() + 'static) -> EventHandle {
        let at = self.now() + delay;
        self.schedule_at(at, callback)
    }

    /// Cancel a pending event. Cancelling an already-fired or unknown
    /// handle is a no-op.
    pub fn cancel(&self, handle: EventHandle) {
        self.inner.borrow_mut().cancelled.insert(handle.0);
    }

    /// Run until the queue drains.
    pub fn run(&self) {
        while self.step() {}
    }

    /// Run all events up to and including `until`, then fast-forward
    /// the clock to `until`.
    pub fn run_until(&self, until: Time) {
        loop {
            let due = {
                let mut inner = self.inner.borrow_mut();
                // drop cancelled entries so peek sees the next live
                // event
                loop {
                    let cancelled_head = match inner.queue.peek() {
                        Some(next) => inner.cancelled.contains(&next.seq),
                        None => false,
                    };
                    if !cancelled_head {
                        break;
                    }
                    let event = inner.queue.pop().expect("peeked entry exists");
                    inner.cancelled.remove(&event.seq);
                }
                matches!(inner.queue.peek(), Some(next) if next.fire_at <= until)
            };
            if !due || !self.step() {
                break;
            }
        }
        let mut inner = self.inner.borrow_mut();
        if inner.now < until {
            inner.now = until;
        }
    }

    /// Pop and dispatch one event. Returns false once the queue is
    /// empty. The queue borrow is released before the callback runs,
    /// so callbacks may schedule freely.
    fn step(&self) -> bool {
        loop {
            let event = {
                let mut inner = self.inner.borrow_mut();
                match inner.queue.pop() {
                    Some(event) => {
                        if inner.cancelled.remove(&event.seq) {
                            continue;
                        }
                        inner.now = event.fire_at;
                        event
                    }
                    None => return false,
                }
            };
            (event.callback)();
            return true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_fire_in_time_order() {
        let scheduler = EventScheduler::new();
        let order = Rc::new(RefCell::new(Vec::new()));

        for (delay, tag) in [(3.0, 'c'), (1.0, 'a'), (2.0, 'b')] {
            let order = order.clone();
            scheduler.schedule_in(delay, move || order.borrow_mut().push(tag));
        }
        scheduler.run();

        assert_eq!(*order.borrow(), vec!['a', 'b', 'c']);
        assert_eq!(scheduler.now(), 3.0);
    }

    #[test]
    fn same_instant_events_fire_fifo() {
        let scheduler = EventScheduler::new();
        let order = Rc::new(RefCell::new(Vec::new()));

        for tag in 0..4 {
            let order = order.clone();
            scheduler.schedule_in(1.0, move || order.borrow_mut().push(tag));
        }
        scheduler.run();

        assert_eq!(*order.borrow(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn cancelled_events_do_not_fire() {
        let scheduler = EventScheduler::new();
        let fired = Rc::new(RefCell::new(false));

        let fired2 = fired.clone();
        let handle = scheduler.schedule_in(1.0, move || *fired2.borrow_mut() = true);
        scheduler.cancel(handle);
        scheduler.run();

        assert!(!*fired.borrow());
    }

    #[test]
    fn callbacks_can_reschedule() {
        let scheduler = EventScheduler::new();
        let count = Rc::new(RefCell::new(0u32));

        fn tick(scheduler: Rc<EventScheduler>, count: Rc<RefCell<u32>>) {
            *count.borrow_mut() += 1;
            if *count.borrow() < 5 {
                let s = scheduler.clone();
                scheduler.schedule_in(1.0, move || tick(s.clone(), count));
            }
        }
        let s = scheduler.clone();
        let c = count.clone();
        scheduler.schedule_in(1.0, move || tick(s, c));
        scheduler.run();

        assert_eq!(*count.borrow(), 5);
        assert_eq!(scheduler.now(), 5.0);
    }

    #[test]
    fn run_until_stops_at_the_requested_time() {
        let scheduler = EventScheduler::new();
        let fired = Rc::new(RefCell::new(Vec::new()));

        for delay in [1.0, 2.0, 5.0] {
            let fired = fired.clone();
            scheduler.schedule_in(delay, move || fired.borrow_mut().push(delay));
        }
        scheduler.run_until(3.0);

        assert_eq!(*fired.borrow(), vec![1.0, 2.0]);
        assert_eq!(scheduler.now(), 3.0);
    }
}
