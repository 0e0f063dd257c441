//! Listener registry: binds callbacks to event sources and dispatches
//! payloads to them in registration order.
//!
//! The registry is confined to the event-loop thread. Callbacks receive the
//! owning state explicitly (`&mut D`) instead of capturing it, so a binding
//! never keeps its owner alive and the state can be mutated freely from
//! inside a callback, including registering or unregistering bindings on
//! the very registry that is dispatching.

use std::fmt;

/// Handle returned by [`ListenerRegistry::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerId(u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

type Callback<D, P, E> = Box<dyn FnMut(&mut D, &P) -> Result<(), E>>;

struct Binding<S, D, P, E> {
    id: ListenerId,
    source: S,
    /// `None` while the callback is running.
    callback: Option<Callback<D, P, E>>,
}

/// Maps event sources `S` to ordered callbacks over state `D`, payload `P`
/// and error `E`.
pub struct ListenerRegistry<S, D, P, E> {
    /// Kept sorted by id, which is also registration order.
    bindings: Vec<Binding<S, D, P, E>>,
    next_id: u64,
}

impl<S, D, P, E> Default for ListenerRegistry<S, D, P, E> {
    fn default() -> Self {
        Self {
            bindings: Vec::new(),
            next_id: 1,
        }
    }
}

impl<S, D, P, E> fmt::Debug for ListenerRegistry<S, D, P, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("bindings", &self.bindings.len())
            .field("next_id", &self.next_id)
            .finish()
    }
}

impl<S: PartialEq, D, P, E> ListenerRegistry<S, D, P, E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `callback` to `source`.
    pub fn register<F>(&mut self, source: S, callback: F) -> ListenerId
    where
        F: FnMut(&mut D, &P) -> Result<(), E> + 'static,
    {
        let id = ListenerId(self.next_id);
        self.next_id += 1;
        self.bindings.push(Binding {
            id,
            source,
            callback: Some(Box::new(callback)),
        });
        id
    }

    /// Detach a binding. Returns `false` if it was already detached.
    pub fn unregister(&mut self, id: ListenerId) -> bool {
        match self.position(id) {
            Some(idx) => {
                self.bindings.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Detach every binding on `source`, returning how many were removed.
    pub fn unregister_source(&mut self, source: &S) -> usize {
        let before = self.bindings.len();
        self.bindings.retain(|b| b.source != *source);
        before - self.bindings.len()
    }

    pub fn is_registered(&self, id: ListenerId) -> bool {
        self.position(id).is_some()
    }

    pub fn listener_count(&self, source: &S) -> usize {
        self.bindings.iter().filter(|b| b.source == *source).count()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn clear(&mut self) {
        self.bindings.clear();
    }

    fn position(&self, id: ListenerId) -> Option<usize> {
        self.bindings.binary_search_by_key(&id, |b| b.id).ok()
    }

    /// Invoke every callback bound to `source` with `payload`.
    ///
    /// The set of bindings is fixed when the pass starts: bindings added by
    /// a callback run on the next pass, bindings removed before their turn
    /// are skipped. The first error aborts the pass and is returned.
    ///
    /// `registry` projects the registry out of the state, since the state
    /// owns the registry and is also handed to every callback.
    pub fn dispatch<F>(state: &mut D, registry: F, source: &S, payload: &P) -> Result<usize, E>
    where
        F: Fn(&mut D) -> &mut Self,
    {
        let pending: Vec<ListenerId> = registry(state)
            .bindings
            .iter()
            .filter(|b| b.source == *source)
            .map(|b| b.id)
            .collect();

        let mut invoked = 0;
        for id in pending {
            let Some(mut callback) = registry(state).take_callback(id) else {
                continue;
            };
            let result = callback(state, payload);
            registry(state).restore_callback(id, callback);
            result?;
            invoked += 1;
        }
        Ok(invoked)
    }

    fn take_callback(&mut self, id: ListenerId) -> Option<Callback<D, P, E>> {
        let idx = self.position(id)?;
        self.bindings[idx].callback.take()
    }

    /// Put a callback back after it ran. Dropped if its binding was
    /// unregistered in the meantime.
    fn restore_callback(&mut self, id: ListenerId, callback: Callback<D, P, E>) {
        if let Some(idx) = self.position(id) {
            self.bindings[idx].callback = Some(callback);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Source {
        A,
        B,
    }

    type Registry = ListenerRegistry<Source, Host, u32, String>;

    #[derive(Default)]
    struct Host {
        registry: Registry,
        log: Vec<String>,
        pending_unregister: Option<ListenerId>,
    }

    fn dispatch(host: &mut Host, source: Source, payload: u32) -> Result<usize, String> {
        Registry::dispatch(host, |h| &mut h.registry, &source, &payload)
    }

    #[test]
    fn test_dispatch_in_registration_order() {
        let mut host = Host::default();
        host.registry
            .register(Source::A, |h: &mut Host, p: &u32| {
                h.log.push(format!("first {p}"));
                Ok(())
            });
        host.registry
            .register(Source::B, |h: &mut Host, _: &u32| {
                h.log.push("other source".into());
                Ok(())
            });
        host.registry
            .register(Source::A, |h: &mut Host, p: &u32| {
                h.log.push(format!("second {p}"));
                Ok(())
            });

        assert_eq!(dispatch(&mut host, Source::A, 7), Ok(2));
        assert_eq!(host.log, vec!["first 7", "second 7"]);
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let mut host = Host::default();
        let first = host.registry.register(Source::A, |h: &mut Host, _: &u32| {
            h.log.push("first".into());
            Ok(())
        });
        let second = host.registry.register(Source::A, |h: &mut Host, _: &u32| {
            h.log.push("second".into());
            Ok(())
        });

        assert!(host.registry.unregister(first));
        assert!(!host.registry.unregister(first));
        assert!(host.registry.is_registered(second));
        assert_eq!(host.registry.listener_count(&Source::A), 1);

        dispatch(&mut host, Source::A, 0).unwrap();
        assert_eq!(host.log, vec!["second"]);
    }

    #[test]
    fn test_register_during_dispatch_runs_next_pass() {
        let mut host = Host::default();
        host.registry.register(Source::A, |h: &mut Host, _: &u32| {
            h.log.push("outer".into());
            h.registry.register(Source::A, |h: &mut Host, _: &u32| {
                h.log.push("inner".into());
                Ok(())
            });
            Ok(())
        });

        assert_eq!(dispatch(&mut host, Source::A, 0), Ok(1));
        assert_eq!(host.log, vec!["outer"]);

        host.log.clear();
        assert_eq!(dispatch(&mut host, Source::A, 0), Ok(2));
        assert_eq!(host.log, vec!["outer", "inner"]);
    }

    #[test]
    fn test_unregister_during_dispatch_skips_removed_binding() {
        let mut host = Host::default();
        host.registry.register(Source::A, |h: &mut Host, _: &u32| {
            h.log.push("remover".into());
            if let Some(id) = h.pending_unregister.take() {
                h.registry.unregister(id);
            }
            Ok(())
        });
        let victim = host.registry.register(Source::A, |h: &mut Host, _: &u32| {
            h.log.push("victim".into());
            Ok(())
        });
        host.registry.register(Source::A, |h: &mut Host, _: &u32| {
            h.log.push("survivor".into());
            Ok(())
        });
        host.pending_unregister = Some(victim);

        assert_eq!(dispatch(&mut host, Source::A, 0), Ok(2));
        assert_eq!(host.log, vec!["remover", "survivor"]);
        assert!(!host.registry.is_registered(victim));
    }

    #[test]
    fn test_self_unregister_drops_callback() {
        let mut host = Host::default();
        let id = host.registry.register(Source::A, |h: &mut Host, _: &u32| {
            h.log.push("once".into());
            h.registry.unregister_source(&Source::A);
            Ok(())
        });

        dispatch(&mut host, Source::A, 0).unwrap();
        dispatch(&mut host, Source::A, 0).unwrap();
        assert_eq!(host.log, vec!["once"]);
        assert!(!host.registry.is_registered(id));
        assert!(host.registry.is_empty());
    }

    #[test]
    fn test_error_aborts_pass_and_keeps_binding() {
        let mut host = Host::default();
        let failing = host.registry.register(Source::A, |_: &mut Host, p: &u32| {
            Err(format!("bad payload {p}"))
        });
        host.registry.register(Source::A, |h: &mut Host, _: &u32| {
            h.log.push("after".into());
            Ok(())
        });

        assert_eq!(dispatch(&mut host, Source::A, 3), Err("bad payload 3".to_string()));
        assert!(host.log.is_empty());
        assert!(host.registry.is_registered(failing));
    }

    #[test]
    fn test_nested_dispatch_does_not_reenter_running_binding() {
        let mut host = Host::default();
        host.registry.register(Source::A, |h: &mut Host, p: &u32| {
            h.log.push(format!("a{p}"));
            if *p == 0 {
                Registry::dispatch(h, |h| &mut h.registry, &Source::A, &1)?;
            }
            Ok(())
        });

        dispatch(&mut host, Source::A, 0).unwrap();
        assert_eq!(host.log, vec!["a0"]);
    }
}
