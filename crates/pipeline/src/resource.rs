use std::collections::BTreeMap;
use std::mem;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::extension::{Extension, ExtensionKey};
use crate::task::{AppTask, TaskSender};
use crate::time::UpdateTime;

pub type CompileCallback = Box<dyn FnOnce(bool) + Send>;
pub type LoadCallback = Box<dyn FnOnce(bool)>;

/// Builds GPU-side data for a named resource off the logic thread.
pub trait ResourceCompiler: Send + Sync {
    /// Must eventually call `done` exactly once, from any thread.
    fn compile(&self, name: &str, done: CompileCallback);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TemporaryFlags {
    /// Drop the entry entirely once it expires instead of keeping it unloaded.
    pub remove_on_clear: bool,
    /// Start compiling as soon as the entry is added.
    pub compile_when_added: bool,
}

pub struct TemporaryResource {
    name: String,
    timeout: u64,
    flags: TemporaryFlags,
    loaded: bool,
    requested: bool,
    failed: bool,
    users: usize,
    atime: u64,
    waiters: Vec<LoadCallback>,
}

impl TemporaryResource {
    fn new(name: String, timeout: Duration, flags: TemporaryFlags, now: u64) -> Self {
        Self {
            name,
            timeout: timeout.as_micros() as u64,
            flags,
            loaded: false,
            requested: false,
            failed: false,
            users: 0,
            atime: now,
            waiters: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn is_requested(&self) -> bool {
        self.requested
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    pub fn users(&self) -> usize {
        self.users
    }

    pub fn access_time(&self) -> u64 {
        self.atime
    }

    /// An unused loaded resource expires once its timeout has elapsed since
    /// the last access; a zero timeout expires it as soon as it is unused.
    fn is_deprecated(&self, now: u64) -> bool {
        if self.users > 0 || !self.loaded {
            return false;
        }
        self.timeout == 0 || self.atime.saturating_add(self.timeout) < now
    }

    fn clear(&mut self) {
        self.loaded = false;
        self.requested = false;
        self.failed = false;
    }
}

/// Logic-thread cache of temporary resources with a time-to-live.
pub struct ResourceCache {
    compiler: Arc<dyn ResourceCompiler>,
    tasks: Option<TaskSender>,
    temporaries: BTreeMap<String, TemporaryResource>,
    now: u64,
}

impl ResourceCache {
    pub fn new(compiler: Arc<dyn ResourceCompiler>) -> Self {
        Self {
            compiler,
            tasks: None,
            temporaries: BTreeMap::new(),
            now: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.temporaries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.temporaries.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&TemporaryResource> {
        self.temporaries.get(name)
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.temporaries.get(name).is_some_and(|res| res.loaded)
    }

    pub fn add_temporary(
        &mut self,
        name: impl Into<String>,
        timeout: Duration,
        flags: TemporaryFlags,
    ) -> bool {
        let name = name.into();
        if self.temporaries.contains_key(&name) {
            return false;
        }
        debug!(resource = %name, ?timeout, "temporary resource added");
        self.temporaries.insert(
            name.clone(),
            TemporaryResource::new(name.clone(), timeout, flags, self.now),
        );
        if flags.compile_when_added {
            self.compile(&name);
        }
        true
    }

    pub fn remove_temporary(&mut self, name: &str) -> bool {
        self.temporaries.remove(name).is_some()
    }

    /// Requests `name` to be loaded. Returns `false` when no load was queued:
    /// either the resource is unknown (`callback(false)`) or already loaded
    /// (`callback(true)`).
    pub fn load(&mut self, name: &str, callback: impl FnOnce(bool) + 'static) -> bool {
        let Some(res) = self.temporaries.get_mut(name) else {
            warn!(resource = name, "load of unknown temporary resource");
            callback(false);
            return false;
        };
        res.atime = self.now;
        if res.loaded {
            callback(true);
            return false;
        }
        if res.failed {
            res.failed = false;
            res.requested = false;
        }
        res.waiters.push(Box::new(callback));
        res.users += 1;
        true
    }

    /// Pins `name` so it is neither evicted nor left unloaded.
    pub fn acquire(&mut self, name: &str) -> bool {
        match self.temporaries.get_mut(name) {
            Some(res) => {
                res.users += 1;
                res.atime = self.now;
                true
            }
            None => false,
        }
    }

    pub fn release(&mut self, name: &str) -> bool {
        match self.temporaries.get_mut(name) {
            Some(res) => {
                res.users = res.users.saturating_sub(1);
                res.atime = self.now;
                true
            }
            None => false,
        }
    }

    pub fn update(&mut self, time: &UpdateTime) {
        self.now = time.global;
        let mut pending = Vec::new();
        let mut evicted = Vec::new();
        for (name, res) in self.temporaries.iter_mut() {
            if res.users > 0 && !res.requested {
                pending.push(name.clone());
            } else if res.is_deprecated(self.now) {
                trace!(resource = %name, "temporary resource expired");
                res.clear();
                if res.flags.remove_on_clear {
                    evicted.push(name.clone());
                }
            }
        }
        for name in evicted {
            self.temporaries.remove(&name);
        }
        for name in pending {
            self.compile(&name);
        }
    }

    /// Completion of an asynchronous compile, on the logic thread.
    pub fn handle_compiled(&mut self, name: &str, success: bool, now: u64) {
        let Some(res) = self.temporaries.get_mut(name) else {
            debug!(resource = name, "compiled resource no longer cached");
            return;
        };
        if !res.requested {
            return;
        }
        let waiters = mem::take(&mut res.waiters);
        res.users = res.users.saturating_sub(waiters.len());
        if success {
            res.loaded = true;
            res.atime = now;
        } else {
            res.failed = true;
            warn!(resource = name, "resource compile failed");
        }
        for waiter in waiters {
            waiter(success);
        }
    }

    fn compile(&mut self, name: &str) {
        let Some(res) = self.temporaries.get_mut(name) else {
            return;
        };
        let Some(tasks) = self.tasks.clone() else {
            warn!(resource = name, "resource cache is not attached to a logic thread");
            return;
        };
        res.requested = true;
        trace!(resource = name, "compiling temporary resource");
        let owned = name.to_string();
        self.compiler.compile(
            name,
            Box::new(move |success| {
                tasks.perform(AppTask::new("resource-compiled", move |ctx| {
                    let now = ctx.time().global;
                    if let Some(cache) = ctx.resource_cache_mut() {
                        cache.handle_compiled(&owned, success, now);
                    }
                    ctx.request_wakeup();
                }));
            }),
        );
    }
}

impl Extension for ResourceCache {
    fn key(&self) -> ExtensionKey {
        ExtensionKey::ResourceCache
    }

    fn initialize(&mut self, tasks: &TaskSender) {
        self.tasks = Some(tasks.clone());
    }

    fn update(&mut self, time: &UpdateTime, _woken: bool) {
        ResourceCache::update(self, time);
    }

    fn invalidate(&mut self) {
        for res in self.temporaries.values_mut() {
            for waiter in mem::take(&mut res.waiters) {
                waiter(false);
            }
        }
        self.temporaries.clear();
    }

    fn as_resource_cache(&mut self) -> Option<&mut ResourceCache> {
        Some(self)
    }
}
