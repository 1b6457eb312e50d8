//! Per-message-type handler stacks.
//!
//! Each message type owns a stack of handlers: `push` installs on top, `pop` removes the most
//! recently installed one. Dispatch never reads the live stack; it takes a [`snapshot`] so a
//! push or pop racing with an in-flight dispatch cannot be observed half-applied.
//!
//! [`snapshot`]: HandlerRegistry::snapshot

use crate::error::DispatchError;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Thread-safe mapping from message type to an ordered stack of handlers.
pub struct HandlerRegistry<H> {
    stacks: RwLock<HashMap<String, Vec<H>>>,
}

impl<H: Clone> HandlerRegistry<H> {
    pub fn new() -> Self {
        Self {
            stacks: RwLock::new(HashMap::new()),
        }
    }

    /// Install `handler` on top of the stack for `message_type`, creating the stack if needed.
    pub fn push(&self, message_type: impl Into<String>, handler: H) {
        self.stacks
            .write()
            .entry(message_type.into())
            .or_default()
            .push(handler);
    }

    /// Remove and return the most recently pushed handler for `message_type`.
    ///
    /// # Errors
    /// [`DispatchError::NotRegistered`] if the type never had a stack (or it was cleared),
    /// [`DispatchError::EmptyStack`] if every handler was already popped.
    pub fn pop(&self, message_type: &str) -> Result<H, DispatchError> {
        let mut stacks = self.stacks.write();
        let stack = stacks
            .get_mut(message_type)
            .ok_or_else(|| DispatchError::NotRegistered(message_type.to_string()))?;
        stack
            .pop()
            .ok_or_else(|| DispatchError::EmptyStack(message_type.to_string()))
    }

    /// Drop the whole stack for one message type, or every stack when `None`.
    ///
    /// # Errors
    /// [`DispatchError::NotRegistered`] when a specific type is named and has no stack.
    pub fn clear(&self, message_type: Option<&str>) -> Result<(), DispatchError> {
        let mut stacks = self.stacks.write();
        match message_type {
            Some(message_type) => stacks
                .remove(message_type)
                .map(|_| ())
                .ok_or_else(|| DispatchError::NotRegistered(message_type.to_string())),
            None => {
                stacks.clear();
                Ok(())
            }
        }
    }

    /// Copy of the handlers currently installed for `message_type`, bottom of the stack first.
    pub fn snapshot(&self, message_type: &str) -> Vec<H> {
        self.stacks
            .read()
            .get(message_type)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of handlers installed for `message_type`.
    pub fn depth(&self, message_type: &str) -> usize {
        self.stacks.read().get(message_type).map_or(0, Vec::len)
    }

    /// Message types that currently own a stack (possibly empty), sorted.
    pub fn message_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.stacks.read().keys().cloned().collect();
        types.sort();
        types
    }

    /// Total number of installed handlers across all message types.
    pub fn len(&self) -> usize {
        self.stacks.read().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<H: Clone> Default for HandlerRegistry<H> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn pop_returns_handlers_in_lifo_order() {
        let registry = HandlerRegistry::new();
        for id in 0..5u32 {
            registry.push("HEARTBEAT", id);
        }
        let popped: Vec<u32> = (0..5).map(|_| registry.pop("HEARTBEAT").unwrap()).collect();
        assert_eq!(popped, vec![4, 3, 2, 1, 0]);
    }

    #[test]
    fn popping_past_the_bottom_reports_empty_stack() {
        let registry = HandlerRegistry::new();
        registry.push("HEARTBEAT", 1u32);
        registry.pop("HEARTBEAT").unwrap();

        let err = registry.pop("HEARTBEAT").unwrap_err();
        assert!(matches!(err, DispatchError::EmptyStack(ref t) if t == "HEARTBEAT"));
        assert!(err.is_not_found());
    }

    #[test]
    fn popping_unknown_type_reports_not_registered() {
        let registry: HandlerRegistry<u32> = HandlerRegistry::new();
        let err = registry.pop("GPS_RAW_INT").unwrap_err();
        assert!(matches!(err, DispatchError::NotRegistered(_)));
        assert!(err.is_not_found());
    }

    #[test]
    fn clear_one_type_leaves_the_others() {
        let registry = HandlerRegistry::new();
        registry.push("HEARTBEAT", 1u32);
        registry.push("ATTITUDE", 2u32);

        registry.clear(Some("HEARTBEAT")).unwrap();
        assert!(matches!(
            registry.pop("HEARTBEAT"),
            Err(DispatchError::NotRegistered(_))
        ));
        assert_eq!(registry.pop("ATTITUDE").unwrap(), 2);
    }

    #[test]
    fn clear_missing_type_is_an_error() {
        let registry: HandlerRegistry<u32> = HandlerRegistry::new();
        assert!(matches!(
            registry.clear(Some("HEARTBEAT")),
            Err(DispatchError::NotRegistered(_))
        ));
    }

    #[test]
    fn clear_all_removes_every_stack() {
        let registry = HandlerRegistry::new();
        registry.push("HEARTBEAT", 1u32);
        registry.push("ATTITUDE", 2u32);
        registry.clear(None).unwrap();
        assert!(registry.is_empty());
        assert!(registry.message_types().is_empty());
        // Clearing an already-empty registry is fine.
        registry.clear(None).unwrap();
    }

    #[test]
    fn snapshot_is_detached_from_later_pushes() {
        let registry = HandlerRegistry::new();
        registry.push("HEARTBEAT", 1u32);
        let snapshot = registry.snapshot("HEARTBEAT");
        registry.push("HEARTBEAT", 2u32);

        assert_eq!(snapshot, vec![1]);
        assert_eq!(registry.snapshot("HEARTBEAT"), vec![1, 2]);
        assert_eq!(registry.depth("HEARTBEAT"), 2);
        assert!(registry.snapshot("UNKNOWN").is_empty());
    }

    #[test]
    fn concurrent_pushes_are_all_recorded() {
        let registry = Arc::new(HandlerRegistry::new());
        let handles: Vec<_> = (0..8u32)
            .map(|thread_id| {
                let registry = registry.clone();
                thread::spawn(move || {
                    for n in 0..100u32 {
                        registry.push("HEARTBEAT", thread_id * 1000 + n);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(registry.depth("HEARTBEAT"), 800);
        assert_eq!(registry.len(), 800);
    }
}
