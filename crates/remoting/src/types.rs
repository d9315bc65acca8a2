//! Known type names and hierarchy fallback

use remoting_proto::{names, TypeDescriptor};
use std::collections::HashSet;
use std::sync::RwLock;
use tracing::trace;

/// Set of type names this process understands.
///
/// Stands in for resolving types by name: a descriptor received from the
/// peer resolves to its first known name, walking from most-derived to the
/// root, and to the opaque object placeholder when none is known.
#[derive(Debug)]
pub struct TypeUniverse {
    known: RwLock<HashSet<String>>,
}

impl Default for TypeUniverse {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeUniverse {
    /// Create a universe knowing the built-in types
    pub fn new() -> Self {
        let mut known: HashSet<String> = names::PRIMITIVES.iter().map(|s| s.to_string()).collect();
        for name in [
            names::STRING,
            names::BUFFER,
            names::REMOTE_OBJECT,
            names::CALLBACK,
            names::EXCEPTION,
            names::DISPATCH_ERROR,
            names::ACCESS_DENIED,
        ] {
            known.insert(name.to_string());
        }

        Self {
            known: RwLock::new(known),
        }
    }

    /// Make a type name known
    pub fn register(&self, name: impl Into<String>) {
        let name = name.into();
        let mut known = self.known.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        known.insert(name);
    }

    /// Make every name of a chain known
    pub fn register_descriptor(&self, descriptor: &TypeDescriptor) {
        let mut known = self.known.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        for name in descriptor.names() {
            known.insert(name.clone());
        }
    }

    /// Whether a name is known, array names resolve through their element
    pub fn contains(&self, name: &str) -> bool {
        if let Some(element) = names::element_of(name) {
            return self.contains(element);
        }
        let known = self.known.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        known.contains(name)
    }

    /// First known name in the chain, else the opaque placeholder
    pub fn resolve(&self, descriptor: &TypeDescriptor) -> String {
        let resolved = descriptor
            .names()
            .iter()
            .find(|name| self.contains(name))
            .cloned()
            .unwrap_or_else(|| names::REMOTE_OBJECT.to_string());

        if resolved != descriptor.name() {
            trace!(wire = %descriptor.name(), resolved = %resolved, "Resolved type through fallback");
        }

        resolved
    }

    /// Number of known names
    pub fn len(&self) -> usize {
        self.known.read().map(|k| k.len()).unwrap_or_default()
    }

    /// Whether no names are known
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match() {
        let universe = TypeUniverse::new();
        universe.register("demo::Dog");

        let desc = TypeDescriptor::new(["demo::Dog", "demo::Animal"]);
        assert_eq!(universe.resolve(&desc), "demo::Dog");
    }

    #[test]
    fn test_ancestor_fallback() {
        let universe = TypeUniverse::new();
        universe.register("demo::Animal");

        let desc = TypeDescriptor::new(["demo::Dog", "demo::Animal"]);
        assert_eq!(universe.resolve(&desc), "demo::Animal");
    }

    #[test]
    fn test_placeholder_fallback() {
        let universe = TypeUniverse::new();
        let desc = TypeDescriptor::new(["demo::Dog", "demo::Animal"]);
        assert_eq!(universe.resolve(&desc), names::REMOTE_OBJECT);
        assert_eq!(universe.resolve(&TypeDescriptor::default()), names::REMOTE_OBJECT);
    }

    #[test]
    fn test_builtin_and_array_names() {
        let universe = TypeUniverse::new();
        assert!(universe.contains("i32"));
        assert!(universe.contains("[i32]"));
        assert!(universe.contains("[u8]"));
        assert!(!universe.contains("[demo::Point]"));

        universe.register_descriptor(&TypeDescriptor::new(["demo::Point"]));
        assert!(universe.contains("[[demo::Point]]"));
    }
}
