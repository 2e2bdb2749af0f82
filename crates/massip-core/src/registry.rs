use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::{definition_files, ConfigError, ConfigResult};
use crate::error::{Error, Result};
use crate::plugin::{CommandPlugin, EchoPlugin, Plugin};

/// A definition excluded from the active set, with the reason.
#[derive(Debug)]
pub struct Rejection {
    pub path: PathBuf,
    pub error: ConfigError,
}

/// Plugins available by name. Later registrations replace earlier ones with
/// the same name; every replacement is logged and recorded.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: BTreeMap<String, Arc<dyn Plugin>>,
    rejected: Vec<Rejection>,
    collisions: Vec<String>,
}

impl PluginRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_builtin(Arc::new(EchoPlugin::new()));
        registry
    }

    /// Built-in plugins plus every valid manifest in `dir`, in file-name order.
    pub fn discover(dir: &Path) -> Self {
        let mut registry = Self::with_builtins();
        registry.load_dir(dir);
        registry
    }

    pub fn load_dir(&mut self, dir: &Path) {
        let files = match definition_files(dir) {
            Ok(files) => files,
            Err(error) => {
                self.reject(dir.to_path_buf(), error);
                return;
            }
        };

        for path in files {
            match CommandPlugin::load(&path) {
                Ok(plugin) => {
                    tracing::debug!(
                        plugin = plugin.name(),
                        path = %path.display(),
                        "loaded plugin manifest"
                    );
                    if let Err(error) = self.register(Arc::new(plugin)) {
                        self.reject(path, error);
                    }
                }
                Err(error) => self.reject(path, error),
            }
        }
    }

    fn register_builtin(&mut self, plugin: Arc<dyn Plugin>) {
        self.plugins.insert(plugin.name().to_string(), plugin);
    }

    fn reject(&mut self, path: PathBuf, error: ConfigError) {
        tracing::warn!(path = %path.display(), %error, "rejected plugin definition");
        self.rejected.push(Rejection { path, error });
    }

    /// Admit a plugin after checking its name.
    pub fn register(&mut self, plugin: Arc<dyn Plugin>) -> ConfigResult<()> {
        let name = plugin.name();
        if name.is_empty() || name.chars().any(char::is_whitespace) {
            return Err(ConfigError::invalid(
                name,
                "plugin names must be non-empty and free of whitespace",
            ));
        }

        let name = name.to_string();
        if self.plugins.insert(name.clone(), plugin).is_some() {
            tracing::warn!(plugin = %name, "plugin name collision, later definition wins");
            self.collisions.push(name);
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        self.plugins.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.plugins.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.plugins.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Plugin>> {
        self.plugins.values()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub fn rejected(&self) -> &[Rejection] {
        &self.rejected
    }

    /// Names that were registered more than once.
    pub fn collisions(&self) -> &[String] {
        &self.collisions
    }

    /// Resolve `names` into an ordered selection. Duplicate names keep their
    /// first position.
    pub fn select<S: AsRef<str>>(&self, names: &[S]) -> Result<PluginSelection> {
        let mut plugins: Vec<Arc<dyn Plugin>> = Vec::with_capacity(names.len());

        for name in names {
            let name = name.as_ref();
            if plugins.iter().any(|p| p.name() == name) {
                tracing::warn!(plugin = name, "plugin selected twice, ignoring repeat");
                continue;
            }
            let plugin = self
                .get(name)
                .ok_or_else(|| Error::UnknownPlugin(name.to_string()))?;
            plugins.push(plugin);
        }

        if plugins.is_empty() {
            return Err(Error::EmptySelection);
        }
        Ok(PluginSelection { plugins })
    }
}

/// Plugins chosen for a batch, in the order their columns are appended.
#[derive(Clone)]
pub struct PluginSelection {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl PluginSelection {
    pub fn new(plugins: Vec<Arc<dyn Plugin>>) -> Self {
        Self { plugins }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Plugin>> {
        self.plugins.iter()
    }

    pub fn names(&self) -> Vec<&str> {
        self.plugins.iter().map(|p| p.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}
