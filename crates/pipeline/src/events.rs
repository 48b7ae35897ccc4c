use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use tracing::trace;

use crate::task::ObjectId;

type Observer<T> = Rc<RefCell<Box<dyn FnMut(&T)>>>;

/// Typed event source owned by the component that raises it. Observers are
/// keyed by their owner; one owner holds at most one subscription.
pub struct EventChannel<T> {
    name: &'static str,
    observers: BTreeMap<ObjectId, Observer<T>>,
}

impl<T> EventChannel<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            observers: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Replaces any previous subscription of `owner`.
    pub fn subscribe(&mut self, owner: ObjectId, observer: impl FnMut(&T) + 'static) {
        self.observers
            .insert(owner, Rc::new(RefCell::new(Box::new(observer))));
    }

    pub fn unsubscribe(&mut self, owner: ObjectId) -> bool {
        self.observers.remove(&owner).is_some()
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    pub fn clear(&mut self) {
        self.observers.clear();
    }

    pub fn emit(&self, event: &T) {
        trace!(channel = self.name, observers = self.observers.len(), "event");
        let observers: Vec<_> = self.observers.values().cloned().collect();
        for observer in observers {
            if let Ok(mut callback) = observer.try_borrow_mut() {
                callback(event);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NetworkState {
    pub online: bool,
    pub metered: bool,
    pub vpn: bool,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ThemeInfo {
    pub color_scheme: String,
    pub dark: bool,
    pub text_scale: f32,
    pub cursor_size: u32,
}
