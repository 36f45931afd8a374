//! Ordered sequence of captured events for one request.
//!
//! The original links arena-allocated nodes with a hand-rolled singly
//! linked list for O(1) append. A `Vec<Event>` gives the same O(1)
//! amortized append without unsafe pointer-chasing, and the event text it
//! holds is still either arena-backed or a borrowed `'static` literal —
//! never a fresh heap allocation on the hot path.

use crate::arena::{Arena, ArenaBytes};

/// Text carried by a push-prefix or print event.
///
/// `Literal` text is never copied: callers of `logl`/`pushprefixl`
/// promise the string outlives the request, so no allocation or copy
/// happens on that path at all. `Owned` text was rendered from a format
/// string and copied into the request arena.
#[derive(Clone, Copy)]
pub enum EventText {
    Owned(ArenaBytes),
    Literal(&'static str),
}

impl EventText {
    pub fn as_str<'a>(&'a self, arena: &'a Arena) -> &'a str {
        match self {
            EventText::Owned(h) => arena.get_str(*h),
            EventText::Literal(s) => s,
        }
    }
}

/// One entry in a request's captured event stream.
pub enum Event {
    PushPrefix(EventText),
    PopPrefix,
    PopPrefixAll,
    Print { class: u32, text: EventText },
}

/// Append-only log of events captured for the current request.
#[derive(Default)]
pub struct EventLog {
    events: Vec<Event>,
}

impl EventLog {
    pub fn new() -> Self {
        EventLog { events: Vec::new() }
    }

    pub fn push(&mut self, event: Event) {
        self.events.push(event);
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Event> {
        self.events.iter()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Drops every captured event, keeping the backing allocation for
    /// reuse by the next request (mirrors [`Arena::free_all`]'s reuse of
    /// its first chunk).
    pub fn clear(&mut self) {
        self.events.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_iterate_in_order() {
        let mut arena = Arena::new();
        let mut log = EventLog::new();
        let h = arena.alloc_str("hello").unwrap();
        log.push(Event::PushPrefix(EventText::Literal("A ")));
        log.push(Event::Print {
            class: 1,
            text: EventText::Owned(h),
        });
        log.push(Event::PopPrefix);

        let texts: Vec<String> = log
            .iter()
            .map(|e| match e {
                Event::PushPrefix(t) => format!("push:{}", t.as_str(&arena)),
                Event::PopPrefix => "pop".to_string(),
                Event::PopPrefixAll => "popall".to_string(),
                Event::Print { text, .. } => format!("print:{}", text.as_str(&arena)),
            })
            .collect();
        assert_eq!(texts, vec!["push:A ", "print:hello", "pop"]);
    }

    #[test]
    fn clear_empties_the_log() {
        let mut log = EventLog::new();
        log.push(Event::PopPrefixAll);
        log.clear();
        assert_eq!(log.len(), 0);
        assert!(log.is_empty());
    }
}
