//! Event notification hub for the command protocol.
//!
//! One handler per event kind. Subscribing replaces the previous handler
//! for that kind. Handlers receive the protocol client itself so they can
//! issue further commands from inside a callback; while a handler runs its
//! slot is vacated, so a nested dispatch of the same kind is a no-op rather
//! than a recursive call.

use std::fmt;

use crate::protocol::{DeviceMode, ParsedCommand};

/// Event kinds a handler can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Received,
    Progress,
    PreCommand,
    PostCommand,
    Connected,
    Disconnected,
}

impl EventKind {
    pub const ALL: [EventKind; 6] = [
        EventKind::Received,
        EventKind::Progress,
        EventKind::PreCommand,
        EventKind::PostCommand,
        EventKind::Connected,
        EventKind::Disconnected,
    ];

    fn slot(self) -> usize {
        self as usize
    }
}

/// A protocol lifecycle event.
#[derive(Debug, Clone, PartialEq)]
pub enum HubEvent {
    /// Console data drained from the bulk IN endpoint.
    Received { data: Vec<u8> },
    Progress {
        sent: u64,
        total: u64,
        percent: f64,
        label: &'static str,
    },
    /// About to transmit a command.
    PreCommand { text: String },
    /// A command was transmitted.
    PostCommand {
        text: String,
        command: ParsedCommand,
    },
    Connected { mode: DeviceMode },
    Disconnected,
}

impl HubEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            HubEvent::Received { .. } => EventKind::Received,
            HubEvent::Progress { .. } => EventKind::Progress,
            HubEvent::PreCommand { .. } => EventKind::PreCommand,
            HubEvent::PostCommand { .. } => EventKind::PostCommand,
            HubEvent::Connected { .. } => EventKind::Connected,
            HubEvent::Disconnected => EventKind::Disconnected,
        }
    }
}

/// What a handler asks the protocol layer to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventAction {
    #[default]
    Proceed,
    /// On PreCommand: suppress the transmission. On Received: stop draining.
    Halt,
}

pub type Handler<C> = Box<dyn FnMut(&mut C, &HubEvent) -> EventAction + Send>;

struct Slot<C> {
    handler: Option<Handler<C>>,
    /// Bumped on every subscribe/unsubscribe.
    generation: u64,
}

/// Per-session handler table, generic over the client type handed to handlers.
pub struct EventHub<C> {
    slots: [Slot<C>; 6],
}

/// A handler checked out for the duration of one dispatch.
pub struct Checkout<C> {
    kind: EventKind,
    generation: u64,
    handler: Handler<C>,
}

impl<C> Checkout<C> {
    pub fn call(&mut self, client: &mut C, event: &HubEvent) -> EventAction {
        (self.handler)(client, event)
    }
}

impl<C> EventHub<C> {
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| Slot {
                handler: None,
                generation: 0,
            }),
        }
    }

    /// Register `handler` for `kind`, replacing any existing one.
    pub fn subscribe<F>(&mut self, kind: EventKind, handler: F)
    where
        F: FnMut(&mut C, &HubEvent) -> EventAction + Send + 'static,
    {
        let slot = &mut self.slots[kind.slot()];
        slot.handler = Some(Box::new(handler));
        slot.generation += 1;
    }

    pub fn unsubscribe(&mut self, kind: EventKind) {
        let slot = &mut self.slots[kind.slot()];
        slot.handler = None;
        slot.generation += 1;
    }

    pub fn is_subscribed(&self, kind: EventKind) -> bool {
        self.slots[kind.slot()].handler.is_some()
    }

    /// Take the handler out of its slot for a dispatch.
    pub fn checkout(&mut self, kind: EventKind) -> Option<Checkout<C>> {
        let slot = &mut self.slots[kind.slot()];
        slot.handler.take().map(|handler| Checkout {
            kind,
            generation: slot.generation,
            handler,
        })
    }

    /// Return a checked-out handler, unless the slot was changed meanwhile.
    pub fn restore(&mut self, checkout: Checkout<C>) {
        let slot = &mut self.slots[checkout.kind.slot()];
        if slot.generation == checkout.generation && slot.handler.is_none() {
            slot.handler = Some(checkout.handler);
        }
    }
}

impl<C> Default for EventHub<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> fmt::Debug for EventHub<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let subscribed: Vec<EventKind> = EventKind::ALL
            .into_iter()
            .filter(|k| self.is_subscribed(*k))
            .collect();
        f.debug_struct("EventHub")
            .field("subscribed", &subscribed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Counter {
        hits: u32,
    }

    fn dispatch(hub: &mut EventHub<Counter>, c: &mut Counter, event: &HubEvent) -> EventAction {
        match hub.checkout(event.kind()) {
            Some(mut h) => {
                let action = h.call(c, event);
                hub.restore(h);
                action
            }
            None => EventAction::Proceed,
        }
    }

    #[test]
    fn test_subscribe_replaces() {
        let mut hub = EventHub::<Counter>::new();
        let mut c = Counter::default();
        hub.subscribe(EventKind::Disconnected, |c, _| {
            c.hits += 1;
            EventAction::Proceed
        });
        hub.subscribe(EventKind::Disconnected, |c, _| {
            c.hits += 10;
            EventAction::Halt
        });

        assert_eq!(
            dispatch(&mut hub, &mut c, &HubEvent::Disconnected),
            EventAction::Halt
        );
        assert_eq!(c.hits, 10);
        // Handler survives the dispatch.
        assert!(hub.is_subscribed(EventKind::Disconnected));
    }

    #[test]
    fn test_unsubscribe() {
        let mut hub = EventHub::<Counter>::new();
        hub.subscribe(EventKind::Progress, |_, _| EventAction::Halt);
        hub.unsubscribe(EventKind::Progress);
        let mut c = Counter::default();
        let ev = HubEvent::Progress {
            sent: 1,
            total: 2,
            percent: 50.0,
            label: "Uploading",
        };
        assert_eq!(dispatch(&mut hub, &mut c, &ev), EventAction::Proceed);
    }

    #[test]
    fn test_resubscribe_during_dispatch_wins() {
        let mut hub = EventHub::<Counter>::new();
        hub.subscribe(EventKind::Disconnected, |_, _| EventAction::Proceed);

        let h = hub.checkout(EventKind::Disconnected).unwrap();
        assert!(!hub.is_subscribed(EventKind::Disconnected));
        hub.subscribe(EventKind::Disconnected, |c, _| {
            c.hits = 7;
            EventAction::Proceed
        });
        hub.restore(h);

        let mut c = Counter::default();
        dispatch(&mut hub, &mut c, &HubEvent::Disconnected);
        assert_eq!(c.hits, 7);
    }
}
