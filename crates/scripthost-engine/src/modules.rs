//! Module bridge: locating, loading and caching imported modules
//!
//! Each engine owns one [`ModuleBridge`]. A module is executed at most once
//! per engine lifetime; later imports of the same resource return the cached
//! namespace.

use dashmap::DashMap;
use parking_lot::Mutex;
use scripthost_core::script::resource_id;
use scripthost_core::{Result, ScriptError, Value};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// A located module resource
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Resource {
    id: String,
    path: Option<PathBuf>,
}

impl Resource {
    /// Resource backed by a file; the id is the canonical path
    pub fn from_path(path: PathBuf) -> Self {
        Self {
            id: resource_id(&path),
            path: Some(path),
        }
    }

    /// Resource with an explicit id and no file behind it
    pub fn named<S: Into<String>>(id: S) -> Self {
        Self {
            id: id.into(),
            path: None,
        }
    }

    /// Canonical identity, used as cache key and frame resource
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Backing file, if any
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

/// Where an import statement came from
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportContext {
    importer: Option<String>,
}

impl ImportContext {
    /// Context for an import made by the resource `importer`
    pub fn new(importer: Option<&str>) -> Self {
        Self {
            importer: importer.map(str::to_owned),
        }
    }

    /// Resource id of the importing code, `None` for dynamic code
    pub fn importer(&self) -> Option<&str> {
        self.importer.as_deref()
    }
}

/// Finds and opens module sources
#[cfg_attr(test, mockall::automock)]
pub trait ResourceLocator: Send + Sync + fmt::Debug {
    /// Resolve an import name, relative to the importing resource if any
    fn locate(&self, name: &str, context: &ImportContext) -> Option<Resource>;

    /// Open the resource for reading
    fn read(&self, resource: &Resource) -> std::io::Result<Box<dyn Read + Send>>;
}

/// Locates modules on disk
///
/// Dotted names map to directories: `pkg.mod` becomes `pkg/mod.<ext>`.
/// Names are tried next to the importing file first, then in each root.
#[derive(Debug, Clone)]
pub struct FileSystemLocator {
    roots: Vec<PathBuf>,
    extension: String,
}

impl FileSystemLocator {
    /// Create a locator searching `roots` for files with `extension`
    pub fn new<I, P>(roots: I, extension: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            roots: roots.into_iter().map(Into::into).collect(),
            extension: extension.into(),
        }
    }

    fn relative_path(&self, name: &str) -> PathBuf {
        let suffix = format!(".{}", self.extension);
        if name.contains('/') || name.ends_with(&suffix) {
            return PathBuf::from(name);
        }
        let mut path: PathBuf = name.split('.').collect();
        path.set_extension(&self.extension);
        path
    }
}

impl ResourceLocator for FileSystemLocator {
    fn locate(&self, name: &str, context: &ImportContext) -> Option<Resource> {
        let relative = self.relative_path(name);

        if relative.is_absolute() {
            return relative.is_file().then(|| Resource::from_path(relative));
        }

        let sibling_dir = context
            .importer()
            .map(Path::new)
            .filter(|ctx| ctx.is_file())
            .and_then(Path::parent)
            .map(Path::to_path_buf);

        sibling_dir
            .into_iter()
            .chain(self.roots.iter().cloned())
            .map(|dir| dir.join(&relative))
            .find(|candidate| candidate.is_file())
            .map(Resource::from_path)
    }

    fn read(&self, resource: &Resource) -> std::io::Result<Box<dyn Read + Send>> {
        let path = resource.path().ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("resource {} has no backing file", resource.id()),
            )
        })?;
        Ok(Box::new(std::fs::File::open(path)?))
    }
}

/// Serves modules from memory, keyed by import name
#[derive(Debug, Clone, Default)]
pub struct MemoryLocator {
    modules: HashMap<String, String>,
}

impl MemoryLocator {
    /// Create an empty locator
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a module
    pub fn with_module(mut self, name: impl Into<String>, code: impl Into<String>) -> Self {
        self.modules.insert(name.into(), code.into());
        self
    }
}

impl ResourceLocator for MemoryLocator {
    fn locate(&self, name: &str, _context: &ImportContext) -> Option<Resource> {
        self.modules
            .contains_key(name)
            .then(|| Resource::named(format!("memory:{name}")))
    }

    fn read(&self, resource: &Resource) -> std::io::Result<Box<dyn Read + Send>> {
        let name = resource.id().trim_start_matches("memory:");
        let code = self.modules.get(name).cloned().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, resource.id().to_string())
        })?;
        Ok(Box::new(Cursor::new(code.into_bytes())))
    }
}

/// A module that finished loading
#[derive(Debug)]
pub struct LoadedModule {
    resource: Resource,
    namespace: Value,
}

impl LoadedModule {
    /// Resource the module was loaded from
    pub fn resource(&self) -> &Resource {
        &self.resource
    }

    /// Backend-specific namespace object
    pub fn namespace(&self) -> &Value {
        &self.namespace
    }
}

/// Module cache statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModuleCacheStats {
    /// Imports served from the cache
    pub hits: u64,
    /// Imports that had to load the module (including failed loads)
    pub misses: u64,
    /// Cached modules
    pub size: usize,
}

impl ModuleCacheStats {
    /// Calculate hit rate
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Per-engine module registry
pub struct ModuleBridge {
    locator: Arc<dyn ResourceLocator>,
    cache: DashMap<String, Arc<LoadedModule>>,
    loading: Mutex<HashSet<String>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ModuleBridge {
    /// Create a bridge over `locator`
    pub fn new(locator: Arc<dyn ResourceLocator>) -> Self {
        Self {
            locator,
            cache: DashMap::new(),
            loading: Mutex::new(HashSet::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Resolve an import, running `load` only on the first import of a resource
    ///
    /// `requesting` is the resource id of the importing code. Errors raised
    /// by `load` leave nothing in the cache, so a later import retries.
    pub fn resolve<F>(
        &self,
        name: &str,
        requesting: Option<&str>,
        load: F,
    ) -> Result<Arc<LoadedModule>>
    where
        F: FnOnce(&Resource, String) -> Result<Value>,
    {
        let resource = self
            .locator
            .locate(name, &ImportContext::new(requesting))
            .ok_or_else(|| ScriptError::module_not_found(name))?;

        if let Some(module) = self.cache.get(resource.id()) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            trace!(module = %resource.id(), "Module cache hit");
            return Ok(Arc::clone(module.value()));
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        if !self.loading.lock().insert(resource.id().to_string()) {
            return Err(ScriptError::execution(format!(
                "cyclic import of module '{}'",
                resource.id()
            )));
        }

        let loaded = self.read(&resource).and_then(|code| load(&resource, code));
        self.loading.lock().remove(resource.id());
        let namespace = loaded?;

        debug!(module = %resource.id(), import = name, "Module loaded");

        let module = Arc::new(LoadedModule {
            resource: resource.clone(),
            namespace,
        });
        self.cache.insert(resource.id().to_string(), Arc::clone(&module));
        Ok(module)
    }

    fn read(&self, resource: &Resource) -> Result<String> {
        let mut code = String::new();
        self.locator
            .read(resource)
            .and_then(|mut reader| reader.read_to_string(&mut code))
            .map_err(|e| ScriptError::Io {
                message: format!("Failed to read module {}: {e}", resource.id()),
            })?;
        Ok(code)
    }

    /// Cached module for a resource id
    pub fn get(&self, id: &str) -> Option<Arc<LoadedModule>> {
        self.cache.get(id).map(|m| Arc::clone(m.value()))
    }

    /// Whether a resource id has been loaded
    pub fn is_loaded(&self, id: &str) -> bool {
        self.cache.contains_key(id)
    }

    /// Drop every cached module
    pub fn clear(&self) {
        let count = self.cache.len();
        self.cache.clear();
        if count > 0 {
            debug!(count, "Module cache cleared");
        }
    }

    /// Cache statistics
    pub fn stats(&self) -> ModuleCacheStats {
        ModuleCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            size: self.cache.len(),
        }
    }
}

impl fmt::Debug for ModuleBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleBridge")
            .field("locator", &self.locator)
            .field("stats", &self.stats())
            .finish()
    }
}
