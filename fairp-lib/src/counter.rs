//! A thread-safe integer counter whose changes can be observed.
//!
//! Every mutation and every subscriber notification happens under one lock,
//! so subscribers see values in exactly the order the mutations happened.
//! Callbacks run while that lock is held: they must be cheap and must never
//! call back into the same [`Counter`], which would deadlock.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

type Callback = Box<dyn Fn(i64) + Send + Sync>;

#[derive(Default)]
struct CounterState {
    value: i64,
    next_ticket: u64,
    subscribers: BTreeMap<u64, Callback>,
}

/// A shared counter with change notifications.
///
/// Cloning a [`Counter`] yields another handle to the same value.
#[derive(Clone, Default)]
pub struct Counter {
    state: Arc<Mutex<CounterState>>,
}

impl Counter {
    /// Create a counter starting at zero
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, CounterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add `delta` and notify every subscriber with the new value
    pub fn add(&self, delta: i64) {
        let mut state = self.lock();
        state.value += delta;

        let value = state.value;
        for subscriber in state.subscribers.values() {
            subscriber(value);
        }
    }

    /// Subtract `delta`, same as `add(-delta)`
    pub fn sub(&self, delta: i64) {
        self.add(-delta);
    }

    /// Point-in-time snapshot of the value
    #[must_use]
    pub fn get(&self) -> i64 {
        self.lock().value
    }

    /// Register `callback` to be called with the new value after every
    /// mutation.
    ///
    /// The subscription lasts until [`Ticket::unsubscribe`] is called or the
    /// ticket is dropped.
    pub fn subscribe<F>(&self, callback: F) -> Ticket
    where
        F: Fn(i64) + Send + Sync + 'static,
    {
        let mut state = self.lock();
        let number = state.next_ticket;
        state.next_ticket += 1;
        state.subscribers.insert(number, Box::new(callback));

        Ticket {
            counter: Arc::downgrade(&self.state),
            number,
        }
    }

    /// Increment the counter now and decrement it again when the returned
    /// guard is dropped
    #[must_use]
    pub fn track(&self) -> CounterGuard {
        self.add(1);
        CounterGuard {
            counter: self.clone(),
        }
    }

    #[cfg(test)]
    fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }
}

impl fmt::Debug for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("Counter")
            .field("value", &state.value)
            .field("subscribers", &state.subscribers.len())
            .finish()
    }
}

/// A live subscription on a [`Counter`]
#[derive(Debug)]
#[must_use = "dropping a ticket unsubscribes immediately"]
pub struct Ticket {
    counter: Weak<Mutex<CounterState>>,
    number: u64,
}

impl Ticket {
    /// Remove the subscription.
    ///
    /// Once this returns the callback is guaranteed not to be called again,
    /// even if other threads are mutating the counter concurrently.
    pub fn unsubscribe(self) {
        // Drop does the work
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        if let Some(state) = self.counter.upgrade() {
            state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .subscribers
                .remove(&self.number);
        }
    }
}

/// Keeps a [`Counter`] incremented by one while alive
#[derive(Debug)]
pub struct CounterGuard {
    counter: Counter,
}

impl Drop for CounterGuard {
    fn drop(&mut self) {
        self.counter.sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_add() {
        let c = Counter::new();
        c.add(5);
        assert_eq!(c.get(), 5);

        c.add(3);
        assert_eq!(c.get(), 8);
    }

    #[test]
    fn test_sub() {
        let c = Counter::new();
        c.add(10);
        c.sub(3);
        assert_eq!(c.get(), 7);
    }

    #[test]
    fn test_get_starts_at_zero() {
        assert_eq!(Counter::new().get(), 0);
    }

    #[test]
    fn test_concurrent_add_and_sub() {
        let c = Counter::new();
        let handles: Vec<_> = (0..10)
            .map(|_| {
                let c = c.clone();
                thread::spawn(move || c.add(1))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(c.get(), 10);

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let c = c.clone();
                thread::spawn(move || c.sub(1))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(c.get(), 0);
    }

    #[test]
    fn test_notifications_follow_mutation_order() {
        let c = Counter::new();
        let history = Arc::new(Mutex::new(Vec::new()));

        let recorder = Arc::clone(&history);
        let _ticket = c.subscribe(move |value| recorder.lock().unwrap().push(value));

        c.add(1);
        c.add(2);
        c.sub(1);
        c.add(-5);

        assert_eq!(*history.lock().unwrap(), vec![1, 3, 2, -3]);
    }

    #[test]
    fn test_subscribers_called_in_registration_order() {
        let c = Counter::new();
        let history = Arc::new(Mutex::new(Vec::new()));

        let first = Arc::clone(&history);
        let _first = c.subscribe(move |value| first.lock().unwrap().push(("first", value)));
        let second = Arc::clone(&history);
        let _second = c.subscribe(move |value| second.lock().unwrap().push(("second", value)));

        c.add(1);
        c.add(1);

        assert_eq!(
            *history.lock().unwrap(),
            vec![("first", 1), ("second", 1), ("first", 2), ("second", 2)]
        );
    }

    #[test]
    fn test_unsubscribe_stops_notifications() {
        let c = Counter::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let seen = Arc::clone(&calls);
        let ticket = c.subscribe(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        c.add(1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let seen = Arc::clone(&calls);
        let other = c.subscribe(move |_| {
            seen.fetch_add(100, Ordering::SeqCst);
        });

        ticket.unsubscribe();
        c.add(1);
        assert_eq!(calls.load(Ordering::SeqCst), 101);

        drop(other);
        c.add(1);
        assert_eq!(calls.load(Ordering::SeqCst), 101);
        assert_eq!(c.subscriber_count(), 0);
    }

    #[test]
    fn test_unsubscribe_while_adding_concurrently() {
        let c = Counter::new();
        let unsubscribed = Arc::new(AtomicBool::new(false));
        let late_calls = Arc::new(AtomicUsize::new(0));

        let flag = Arc::clone(&unsubscribed);
        let late = Arc::clone(&late_calls);
        let ticket = c.subscribe(move |_| {
            if flag.load(Ordering::SeqCst) {
                late.fetch_add(1, Ordering::SeqCst);
            }
        });

        let writers: Vec<_> = (0..4)
            .map(|_| {
                let c = c.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        c.add(1);
                    }
                })
            })
            .collect();

        thread::yield_now();
        ticket.unsubscribe();
        unsubscribed.store(true, Ordering::SeqCst);

        for writer in writers {
            writer.join().unwrap();
        }

        assert_eq!(late_calls.load(Ordering::SeqCst), 0);
        assert_eq!(c.get(), 4000);
    }

    #[test]
    fn test_track_guard() {
        let c = Counter::new();
        {
            let _first = c.track();
            let _second = c.track();
            assert_eq!(c.get(), 2);
        }
        assert_eq!(c.get(), 0);
    }

    #[test]
    fn test_ticket_outliving_counter() {
        let c = Counter::new();
        let ticket = c.subscribe(|_| {});
        drop(c);
        ticket.unsubscribe();
    }
}
