//! Services: named, immutable collections of methods.

use tern_wire::{MethodId, ServiceId};

use crate::method::MethodDescriptor;

/// A named collection of methods, identified on the wire by the hash of its
/// fully qualified name.
///
/// The method table is fixed once the service is handed to a server; there
/// is no registration after start-up. Method ids are hashes of the method
/// names, so a hash collision between two method names is detected here and
/// refused by panicking, since it would make one of the methods
/// unaddressable.
pub struct Service {
    id: ServiceId,
    name: &'static str,
    methods: Vec<MethodDescriptor>,
}

impl Service {
    /// Create an empty service. `name` should be fully qualified
    /// (`"package.Service"`); both endpoints must use the same string.
    pub fn new(name: &'static str) -> Service {
        Service {
            id: ServiceId::of(name),
            name,
            methods: Vec::new(),
        }
    }

    /// Add a method.
    ///
    /// # Panics
    ///
    /// Panics if the method's id collides with one already registered.
    pub fn with_method(mut self, method: MethodDescriptor) -> Service {
        if let Some(existing) = self.methods.iter().find(|m| m.id() == method.id()) {
            panic!(
                "method id collision in service {}: {:?} and {:?} both hash to {}",
                self.name,
                existing.name(),
                method.name(),
                method.id(),
            );
        }
        self.methods.push(method);
        self
    }

    pub fn id(&self) -> ServiceId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn method(&self, id: MethodId) -> Option<&MethodDescriptor> {
        self.methods.iter().find(|m| m.id() == id)
    }

    /// The registered methods, in registration order.
    pub fn methods(&self) -> impl Iterator<Item = &MethodDescriptor> {
        self.methods.iter()
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("methods", &self.methods.len())
            .finish()
    }
}
