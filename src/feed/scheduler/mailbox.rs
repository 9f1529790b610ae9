use std::sync::Mutex;

use super::lock;

/// Single-slot latest-wins handoff. A put replaces whatever the consumer has
/// not taken yet.
#[derive(Debug)]
pub struct Mailbox<T> {
    slot: Mutex<Option<T>>,
}

impl<T> Default for Mailbox<T> {
    fn default() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }
}

impl<T> Mailbox<T> {
    /// Returns the value that was overwritten, if any.
    pub fn put(&self, value: T) -> Option<T> {
        lock(&self.slot).replace(value)
    }

    pub fn take(&self) -> Option<T> {
        lock(&self.slot).take()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.slot).is_none()
    }
}
