//! Single-threaded event dispatch
//!
//! Sources are merged chronologically and events from one source are
//! delivered in FIFO order. Each event's handlers run to completion before
//! the next event is popped, so bar processing and strategy reactions
//! interleave deterministically.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::error;

use crate::types::Bar;

/// A bar delivered as an event.
#[derive(Debug, Clone)]
pub struct BarEvent {
    pub bar: Bar,
}

impl BarEvent {
    pub fn new(bar: Bar) -> Self {
        BarEvent { bar }
    }

    /// The point in time this event belongs to.
    pub fn when(&self) -> DateTime<Utc> {
        self.bar.datetime
    }
}

/// Produces events for the dispatcher. `peek_next` drives the chronological
/// merge; `pop` must return the event `peek_next` announced.
pub trait EventSource {
    fn peek_next(&self) -> Option<DateTime<Utc>>;
    fn pop(&mut self) -> Option<BarEvent>;
}

/// Callback invoked for every event delivered from a subscribed source.
pub type EventHandler = Box<dyn FnMut(&BarEvent) -> Result<()>>;

/// An in-memory FIFO event source that can be pushed to while the dispatcher
/// is running. Cloning returns a handle to the same queue.
#[derive(Clone, Default)]
pub struct FifoQueueEventSource {
    queue: Rc<RefCell<VecDeque<BarEvent>>>,
}

impl FifoQueueEventSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue an event for later delivery.
    pub fn push(&self, event: BarEvent) {
        self.queue.borrow_mut().push_back(event);
    }
}

impl EventSource for FifoQueueEventSource {
    fn peek_next(&self) -> Option<DateTime<Utc>> {
        self.queue.borrow().front().map(BarEvent::when)
    }

    fn pop(&mut self) -> Option<BarEvent> {
        self.queue.borrow_mut().pop_front()
    }
}

struct Subscription {
    source: Rc<RefCell<dyn EventSource>>,
    handlers: Vec<EventHandler>,
}

#[derive(Default)]
struct DispatcherState {
    subscriptions: Vec<Subscription>,
}

/// Drives event delivery to exhaustion. Cloning returns a handle to the same
/// dispatcher.
#[derive(Clone, Default)]
pub struct EventDispatcher {
    state: Rc<RefCell<DispatcherState>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for events from `source`. Subscribing the same
    /// source again attaches an additional handler; a source's handlers run
    /// in subscription order.
    pub fn subscribe(&self, source: Rc<RefCell<dyn EventSource>>, handler: EventHandler) {
        let mut state = self.state.borrow_mut();
        if let Some(subscription) = state
            .subscriptions
            .iter_mut()
            .find(|subscription| Rc::ptr_eq(&subscription.source, &source))
        {
            subscription.handlers.push(handler);
            return;
        }
        state.subscriptions.push(Subscription {
            source,
            handlers: vec![handler],
        });
    }

    /// Dispatches events until every source is exhausted. Ties between
    /// sources are broken by subscription order. Handler failures are logged
    /// and do not stop the run.
    pub fn run(&self) {
        while let Some((index, event)) = self.pop_next() {
            // Handlers are detached while they run so they can subscribe or
            // push events without re-borrowing the dispatcher.
            let mut handlers =
                std::mem::take(&mut self.state.borrow_mut().subscriptions[index].handlers);
            for handler in handlers.iter_mut() {
                if let Err(e) = handler(&event) {
                    error!("Event handler failed: {:#}", e);
                }
            }
            let mut state = self.state.borrow_mut();
            let slot = &mut state.subscriptions[index].handlers;
            handlers.append(slot);
            *slot = handlers;
        }
    }

    fn pop_next(&self) -> Option<(usize, BarEvent)> {
        let state = self.state.borrow();
        let mut next: Option<(usize, DateTime<Utc>)> = None;
        for (index, subscription) in state.subscriptions.iter().enumerate() {
            if let Some(when) = subscription.source.borrow().peek_next() {
                if next.map_or(true, |(_, best)| when < best) {
                    next = Some((index, when));
                }
            }
        }
        next.map(|(index, _)| {
            let event = state.subscriptions[index]
                .source
                .borrow_mut()
                .pop()
                .expect("peeked source must pop an event");
            (index, event)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Pair, Symbol};
    use chrono::{Datelike, TimeZone};
    use rust_decimal_macros::dec;

    fn bar_event(day: u32) -> BarEvent {
        BarEvent::new(Bar {
            pair: Pair::new(Symbol::new("BTC"), Symbol::new("USDT")),
            datetime: Utc.with_ymd_and_hms(2023, 1, day, 0, 0, 0).unwrap(),
            open: dec!(100),
            high: dec!(110),
            low: dec!(90),
            close: dec!(105),
            volume: dec!(1000),
        })
    }

    #[test]
    fn test_fifo_delivery_per_source() {
        let dispatcher = EventDispatcher::new();
        let source = FifoQueueEventSource::new();
        source.push(bar_event(1));
        source.push(bar_event(2));
        source.push(bar_event(3));

        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen_clone = seen.clone();
        dispatcher.subscribe(
            Rc::new(RefCell::new(source)),
            Box::new(move |event| {
                seen_clone.borrow_mut().push(event.when());
                Ok(())
            }),
        );
        dispatcher.run();

        let seen = seen.borrow();
        assert_eq!(seen.len(), 3);
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_chronological_merge_across_sources() {
        let dispatcher = EventDispatcher::new();
        let first = FifoQueueEventSource::new();
        first.push(bar_event(1));
        first.push(bar_event(4));
        let second = FifoQueueEventSource::new();
        second.push(bar_event(2));
        second.push(bar_event(3));

        let seen = Rc::new(RefCell::new(Vec::new()));
        for source in [first, second] {
            let seen_clone = seen.clone();
            dispatcher.subscribe(
                Rc::new(RefCell::new(source)),
                Box::new(move |event| {
                    seen_clone.borrow_mut().push(event.when().day());
                    Ok(())
                }),
            );
        }
        dispatcher.run();

        assert_eq!(*seen.borrow(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_events_pushed_during_dispatch_are_delivered() {
        let dispatcher = EventDispatcher::new();
        let source = FifoQueueEventSource::new();
        source.push(bar_event(1));
        source.push(bar_event(2));

        // Forwarding queue, filled from the first source's handler.
        let forward = FifoQueueEventSource::new();
        let forward_handle = forward.clone();
        dispatcher.subscribe(
            Rc::new(RefCell::new(source)),
            Box::new(move |event| {
                forward_handle.push(event.clone());
                Ok(())
            }),
        );

        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen_clone = seen.clone();
        dispatcher.subscribe(
            Rc::new(RefCell::new(forward)),
            Box::new(move |event| {
                seen_clone.borrow_mut().push(event.when().day());
                Ok(())
            }),
        );
        dispatcher.run();

        assert_eq!(*seen.borrow(), vec![1, 2]);
    }

    #[test]
    fn test_handler_error_does_not_stop_dispatch() {
        let dispatcher = EventDispatcher::new();
        let source = FifoQueueEventSource::new();
        source.push(bar_event(1));
        source.push(bar_event(2));

        let count = Rc::new(RefCell::new(0));
        let count_clone = count.clone();
        dispatcher.subscribe(
            Rc::new(RefCell::new(source)),
            Box::new(move |_| {
                *count_clone.borrow_mut() += 1;
                anyhow::bail!("strategy failure")
            }),
        );
        dispatcher.run();

        assert_eq!(*count.borrow(), 2);
    }
}
