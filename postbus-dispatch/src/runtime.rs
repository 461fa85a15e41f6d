use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

/// Well-known keys of the [`BusRuntime`] property store.
pub mod properties {
    /// The handler executor, registered only if asynchronous invocation is enabled.
    pub const ASYNC_HANDLER_EXECUTOR: &str = "bus.handlers.async-executor";

    /// The unique identifier of the bus, a UUID string.
    pub const BUS_ID: &str = "bus.id";
}

type Property = Arc<dyn Any + Send + Sync>;

/// A shared store of named runtime properties.
///
/// A bus publishes its components here so that other parts of the application can look them up,
/// for instance the handler executor under [`properties::ASYNC_HANDLER_EXECUTOR`]. Clones share
/// the same store.
#[derive(Clone, Default)]
pub struct BusRuntime {
    properties: Arc<RwLock<BTreeMap<&'static str, Property>>>,
}

impl BusRuntime {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a value, replacing any previous value under the same key.
    pub fn add<T>(&self, key: &'static str, value: T) -> &Self
    where
        T: Any + Send + Sync,
    {
        self.add_arc(key, Arc::new(value))
    }

    /// Stores a shared value, replacing any previous value under the same key.
    pub fn add_arc<T>(&self, key: &'static str, value: Arc<T>) -> &Self
    where
        T: Any + Send + Sync,
    {
        self.properties.write().insert(key, value);
        self
    }

    /// Returns the value under `key` if it exists and is of type `T`.
    pub fn get<T>(&self, key: &str) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        let property = self.properties.read().get(key).cloned()?;
        property.downcast::<T>().ok()
    }

    /// Returns `true` if a value is stored under `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.properties.read().contains_key(key)
    }

    /// Returns all keys in sorted order.
    pub fn keys(&self) -> Vec<&'static str> {
        self.properties.read().keys().copied().collect()
    }
}

impl fmt::Debug for BusRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusRuntime")
            .field("keys", &self.keys())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_lookup() {
        let runtime = BusRuntime::new();
        runtime.add(properties::BUS_ID, "abc".to_owned()).add("count", 3usize);

        assert_eq!(
            runtime.get::<String>(properties::BUS_ID).as_deref(),
            Some(&"abc".to_owned())
        );
        assert_eq!(runtime.get::<usize>("count").as_deref(), Some(&3));
        assert!(runtime.get::<u32>("count").is_none());
        assert!(runtime.get::<usize>("missing").is_none());
        assert_eq!(runtime.keys(), vec![properties::BUS_ID, "count"]);
    }

    #[test]
    fn test_clones_share_properties() {
        let runtime = BusRuntime::new();
        let clone = runtime.clone();

        let shared = Arc::new(5u8);
        clone.add_arc("shared", shared.clone());

        assert!(runtime.contains("shared"));
        assert!(Arc::ptr_eq(&runtime.get::<u8>("shared").unwrap(), &shared));
    }
}
