//! Ordered, once-only contact queue for a single campaign run.

use std::sync::{Arc, Mutex};

use crate::engine::models::Contact;

/// Hands each contact to exactly one caller, in submission order, even under
/// concurrent `take_next` calls. The contact list itself is immutable; only
/// the cursor moves, and only forward.
pub struct ContactQueue {
    contacts: Arc<[Contact]>,
    next: Mutex<usize>,
}

impl ContactQueue {
    pub fn new(contacts: Vec<Contact>) -> Self {
        Self {
            contacts: contacts.into(),
            next: Mutex::new(0),
        }
    }

    /// Rebuild the queue for a restored campaign, leaving out contacts that
    /// already reached a terminal outcome in a previous process lifetime.
    /// Completion order varies, so terminal ordinals may be non-contiguous;
    /// the survivors keep their original relative order.
    pub fn resume_after(contacts: Vec<Contact>, terminal_ordinals: &[u32]) -> Self {
        let remaining: Vec<Contact> = contacts
            .into_iter()
            .filter(|c| !terminal_ordinals.contains(&c.ordinal))
            .collect();
        Self::new(remaining)
    }

    /// Yield the next never-taken contact, or `None` when exhausted.
    pub fn take_next(&self) -> Option<Contact> {
        let mut next = self.next.lock().expect("queue lock poisoned");
        let contact = self.contacts.get(*next).cloned()?;
        *next += 1;
        Some(contact)
    }

    /// Atomically consume everything left. Used by cancel so each remaining
    /// contact is recorded as skipped exactly once.
    pub fn drain_remaining(&self) -> Vec<Contact> {
        let mut next = self.next.lock().expect("queue lock poisoned");
        let rest = self.contacts[*next..].to_vec();
        *next = self.contacts.len();
        rest
    }

    pub fn remaining(&self) -> usize {
        let next = self.next.lock().expect("queue lock poisoned");
        self.contacts.len() - *next
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }
}
