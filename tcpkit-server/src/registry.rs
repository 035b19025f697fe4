//! # Server Registry
//!
//! Purpose: Name servers so unrelated parts of a program can reach the same
//! instance.
//!
//! The first registration of a name wins; later `get_or_insert_with` calls
//! return the existing server without running their constructor.

use std::sync::Arc;

use dashmap::DashMap;

use crate::server::Server;

/// Name used when the caller does not pick one.
pub const DEFAULT_SERVER_NAME: &str = "default";

/// Name-keyed registry of shared servers.
#[derive(Debug, Default)]
pub struct ServerRegistry {
    servers: DashMap<String, Arc<Server>>,
}

impl ServerRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        ServerRegistry::default()
    }

    /// Returns the server registered as `name`, building it if absent.
    pub fn get_or_insert_with<F>(&self, name: &str, build: F) -> Arc<Server>
    where
        F: FnOnce() -> Server,
    {
        if let Some(server) = self.servers.get(name) {
            return Arc::clone(server.value());
        }
        self.servers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(build()))
            .clone()
    }

    /// Registers `server` as `name`, returning the server it replaced.
    pub fn insert(&self, name: &str, server: Server) -> Option<Arc<Server>> {
        self.servers.insert(name.to_string(), Arc::new(server))
    }

    /// Server registered as `name`, if any.
    pub fn get(&self, name: &str) -> Option<Arc<Server>> {
        self.servers.get(name).map(|server| Arc::clone(server.value()))
    }

    /// Unregisters `name`. The server keeps running until closed.
    pub fn remove(&self, name: &str) -> Option<Arc<Server>> {
        self.servers.remove(name).map(|(_, server)| server)
    }

    /// Closes every registered server and empties the registry.
    pub fn close_all(&self) {
        for entry in self.servers.iter() {
            entry.value().close();
        }
        self.servers.clear();
    }

    /// Number of registered servers.
    pub fn len(&self) -> usize {
        self.servers.len()
    }

    /// Whether no server is registered.
    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}
