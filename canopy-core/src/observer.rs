//! Explicit observer containers.
//!
//! Mutators call [`Observers::notify`] synchronously after they change
//! state. Listeners run in registration order on the mutating thread.
//!
//! [`SharedObservers`] is for lists that sit behind a lock: clone the
//! listeners out with [`SharedObservers::listeners`], let go of the lock,
//! then call them. A listener may then call back into its owner.

use std::sync::Arc;

/// Handle returned by [`Observers::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener<E> = Box<dyn FnMut(&E) + Send>;

pub struct Observers<E> {
    next_id: u64,
    listeners: Vec<(ListenerId, Listener<E>)>,
}

impl<E> Default for Observers<E> {
    fn default() -> Self {
        Self {
            next_id: 0,
            listeners: Vec::new(),
        }
    }
}

impl<E> Observers<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. The same closure may be registered twice.
    pub fn subscribe<F>(&mut self, listener: F) -> ListenerId
    where
        F: FnMut(&E) + Send + 'static,
    {
        let id = ListenerId(self.next_id);
        self.next_id += 1;
        self.listeners.push((id, Box::new(listener)));
        id
    }

    /// Returns false if the id was unknown.
    pub fn unsubscribe(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(lid, _)| *lid != id);
        self.listeners.len() != before
    }

    pub fn notify(&mut self, event: &E) {
        for (_, listener) in self.listeners.iter_mut() {
            listener(event);
        }
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}

impl<E> std::fmt::Debug for Observers<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observers")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

type SharedListener<E> = Arc<dyn Fn(&E) + Send + Sync>;

pub struct SharedObservers<E> {
    next_id: u64,
    listeners: Vec<(ListenerId, SharedListener<E>)>,
}

impl<E> Default for SharedObservers<E> {
    fn default() -> Self {
        Self {
            next_id: 0,
            listeners: Vec::new(),
        }
    }
}

impl<E> SharedObservers<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&mut self, listener: F) -> ListenerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id);
        self.next_id += 1;
        self.listeners.push((id, Arc::new(listener)));
        id
    }

    pub fn unsubscribe(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(lid, _)| *lid != id);
        self.listeners.len() != before
    }

    /// Registered listeners in registration order.
    pub fn listeners(&self) -> Vec<SharedListener<E>> {
        self.listeners.iter().map(|(_, l)| l.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}

impl<E> std::fmt::Debug for SharedObservers<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedObservers")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_notify_in_registration_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut observers = Observers::<u32>::new();

        let s1 = seen.clone();
        observers.subscribe(move |e| s1.lock().unwrap().push(("first", *e)));
        let s2 = seen.clone();
        observers.subscribe(move |e| s2.lock().unwrap().push(("second", *e)));

        observers.notify(&7);
        assert_eq!(*seen.lock().unwrap(), vec![("first", 7), ("second", 7)]);
    }

    #[test]
    fn test_unsubscribe() {
        let count = Arc::new(Mutex::new(0));
        let mut observers = Observers::<()>::new();
        let c = count.clone();
        let id = observers.subscribe(move |_| *c.lock().unwrap() += 1);

        observers.notify(&());
        assert!(observers.unsubscribe(id));
        assert!(!observers.unsubscribe(id));
        observers.notify(&());

        assert_eq!(*count.lock().unwrap(), 1);
        assert!(observers.is_empty());
    }

    #[test]
    fn test_shared_listeners_run_after_lock_is_released() {
        let observers = Arc::new(Mutex::new(SharedObservers::<u32>::new()));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let (o, s) = (observers.clone(), seen.clone());
        observers.lock().unwrap().subscribe(move |e| {
            // Re-entering the owner is fine once the list is cloned out.
            let count = o.lock().unwrap().len();
            s.lock().unwrap().push((*e, count));
        });

        let listeners = observers.lock().unwrap().listeners();
        for listener in listeners {
            listener(&3);
        }
        assert_eq!(*seen.lock().unwrap(), vec![(3, 1)]);
    }

    #[test]
    fn test_shared_unsubscribe() {
        let mut observers = SharedObservers::<()>::new();
        let first = observers.subscribe(|_| {});
        let second = observers.subscribe(|_| {});
        assert!(observers.unsubscribe(first));
        assert!(!observers.unsubscribe(first));
        assert_eq!(observers.len(), 1);
        assert!(observers.unsubscribe(second));
        assert!(observers.listeners().is_empty());
    }
}
