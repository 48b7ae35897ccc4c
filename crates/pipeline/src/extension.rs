use std::fmt;

use crate::resource::ResourceCache;
use crate::task::TaskSender;
use crate::time::UpdateTime;

/// Registry key for logic-thread extensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ExtensionKey {
    ResourceCache,
    Custom(&'static str),
}

impl fmt::Display for ExtensionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtensionKey::ResourceCache => f.write_str("resource-cache"),
            ExtensionKey::Custom(name) => f.write_str(name),
        }
    }
}

/// Subsystem attached to the logic thread and updated once per tick.
///
/// Extensions expose narrower capabilities through the `as_*` accessors so
/// callers never need runtime type identification.
pub trait Extension {
    fn key(&self) -> ExtensionKey;

    /// Called once when the extension is registered.
    fn initialize(&mut self, _tasks: &TaskSender) {}

    fn update(&mut self, time: &UpdateTime, woken: bool);

    /// Called once when the logic thread shuts down.
    fn invalidate(&mut self) {}

    fn as_resource_cache(&mut self) -> Option<&mut ResourceCache> {
        None
    }
}
