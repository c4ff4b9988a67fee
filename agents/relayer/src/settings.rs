use fusion_base::settings::{LoadableFromSettings, Settings, SettingsError};

/// Relayer-specific settings. Currently the shared [`Settings`] carry
/// everything the relayer needs; this wrapper is the place agent-only knobs
/// land without touching the shared surface.
#[derive(Debug, Clone)]
pub struct RelayerSettings {
    base: Settings,
}

impl AsRef<Settings> for RelayerSettings {
    fn as_ref(&self) -> &Settings {
        &self.base
    }
}

impl LoadableFromSettings for RelayerSettings {
    fn load() -> Result<Self, SettingsError> {
        Ok(Self {
            base: Settings::load()?,
        })
    }
}

impl RelayerSettings {
    /// Wrap already-validated settings; used by tests and embedders.
    pub fn from_base(base: Settings) -> Self {
        Self { base }
    }
}
