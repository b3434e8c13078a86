//! Named, lazily constructed singletons.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use crate::error::{IdentityError, Result};

type Factory<T> = Box<dyn Fn() -> Result<Arc<T>> + Send + Sync>;

struct Slots<T: ?Sized> {
    factories: HashMap<String, Factory<T>>,
    loaded: HashMap<String, Arc<T>>,
}

/// Maps symbolic names to factories and memoizes what they build.
///
/// Built once at startup and passed to whoever needs it. The first `get`
/// for a name runs its factory under the registry lock, so concurrent
/// first callers never construct twice; later calls return the cached
/// instance. A factory that fails leaves nothing cached.
pub struct Registry<T: ?Sized> {
    kind: &'static str,
    slots: Mutex<Slots<T>>,
}

impl<T: ?Sized> Registry<T> {
    /// `kind` names what is registered (e.g. `"store"`) in error messages.
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            slots: Mutex::new(Slots {
                factories: HashMap::new(),
                loaded: HashMap::new(),
            }),
        }
    }

    /// Registers `factory` under `name`, replacing any previous factory
    /// and dropping an instance it had built.
    pub fn register<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Result<Arc<T>> + Send + Sync + 'static,
    {
        let name = name.into();
        let mut slots = self.slots.lock();
        slots.loaded.remove(&name);
        slots.factories.insert(name, Box::new(factory));
    }

    /// Returns the instance for `name`, constructing it on first use.
    pub fn get(&self, name: &str) -> Result<Arc<T>> {
        let mut slots = self.slots.lock();
        if let Some(v) = slots.loaded.get(name) {
            return Ok(Arc::clone(v));
        }
        let factory = slots.factories.get(name).ok_or_else(|| self.unknown(name))?;
        let value = factory()?;
        slots.loaded.insert(name.to_string(), Arc::clone(&value));
        info!(kind = self.kind, name, "registry instance constructed");
        Ok(value)
    }

    /// Returns the instance for `name` only if it was already built.
    pub fn get_if_loaded(&self, name: &str) -> Option<Arc<T>> {
        self.slots.lock().loaded.get(name).cloned()
    }

    /// Fails on the first name without a registered factory. Meant for
    /// startup, so a misconfigured name surfaces before the first request.
    pub fn validate<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> Result<()> {
        let slots = self.slots.lock();
        for name in names {
            if !slots.factories.contains_key(name) {
                return Err(self.unknown(name));
            }
        }
        Ok(())
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.slots.lock().factories.keys().cloned().collect();
        names.sort();
        names
    }

    fn unknown(&self, name: &str) -> IdentityError {
        IdentityError::UnknownName {
            kind: self.kind,
            name: name.to_string(),
        }
    }
}

impl<T: ?Sized> fmt::Debug for Registry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("kind", &self.kind)
            .field("names", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn constructs_once_and_caches() {
        let calls = Arc::new(AtomicUsize::new(0));
        let reg: Registry<String> = Registry::new("store");
        let c = Arc::clone(&calls);
        reg.register("main", move || {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new("built".to_string()))
        });

        assert!(reg.get_if_loaded("main").is_none());
        let a = reg.get("main").unwrap();
        let b = reg.get("main").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(reg.get_if_loaded("main").is_some());
    }

    #[test]
    fn unknown_name() {
        let reg: Registry<String> = Registry::new("model");
        let err = reg.get("ghost").unwrap_err();
        assert!(matches!(
            err,
            IdentityError::UnknownName { kind: "model", ref name } if name == "ghost"
        ));
        assert!(err.to_string().contains("no model registered"));
    }

    #[test]
    fn failures_are_not_cached() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let reg: Registry<String> = Registry::new("store");
        let a = Arc::clone(&attempts);
        reg.register("flaky", move || {
            if a.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(IdentityError::Config("not yet".into()))
            } else {
                Ok(Arc::new("ok".into()))
            }
        });
        assert!(reg.get("flaky").is_err());
        assert_eq!(reg.get("flaky").unwrap().as_str(), "ok");
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn validate_and_names() {
        let reg: Registry<dyn fmt::Debug + Send + Sync> = Registry::new("detector");
        reg.register("b", || Ok(Arc::new(1u8) as Arc<dyn fmt::Debug + Send + Sync>));
        reg.register("a", || Ok(Arc::new("x") as Arc<dyn fmt::Debug + Send + Sync>));
        assert_eq!(reg.names(), vec!["a", "b"]);
        assert!(reg.validate(["a", "b"]).is_ok());
        assert!(matches!(
            reg.validate(["a", "c"]),
            Err(IdentityError::UnknownName { ref name, .. }) if name == "c"
        ));
    }

    #[test]
    fn concurrent_first_callers_share_one_instance() {
        let calls = Arc::new(AtomicUsize::new(0));
        let reg: Arc<Registry<usize>> = Arc::new(Registry::new("store"));
        let c = Arc::clone(&calls);
        reg.register("s", move || {
            std::thread::sleep(std::time::Duration::from_millis(10));
            Ok(Arc::new(c.fetch_add(1, Ordering::SeqCst)))
        });

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let reg = Arc::clone(&reg);
                std::thread::spawn(move || reg.get("s").unwrap())
            })
            .collect();
        let got: Vec<Arc<usize>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(got.iter().all(|v| Arc::ptr_eq(v, &got[0])));
    }
}
