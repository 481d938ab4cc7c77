// -- std imports
use std::fs;
use std::sync::OnceLock;

// -- crate imports (conditional)
#[cfg(not(debug_assertions))]
#[allow(unused_imports)]
use anyhow::Context;

// -- crate imports
use anyhow::Result;
use tracing::{info, warn};

/// Global singleton instance of [`Conf`].
static CONF: OnceLock<Conf> = OnceLock::new();

/// Returns the path to the configuration file.
///
/// In debug builds this is `./config.yml` in the current working
/// directory. In release builds this uses the XDG base directory and
/// resolves to a path like `~/.config/bluetooth-tui/config.yml`.
///
/// # Errors
/// - [`anyhow::Error`] if the config file path cannot be determined
///   (release builds only).
pub fn conf_filepath() -> Result<String> {
    #[cfg(debug_assertions)]
    {
        Ok("./config.yml".into())
    }

    #[cfg(not(debug_assertions))]
    {
        xdg::BaseDirectories::with_prefix("bluetooth-tui")
            .get_config_file("config.yml")
            .map(|path| path.to_string_lossy().to_string())
            .context("Could not determine config file path")
    }
}

/// Application configuration.
///
/// This type is deserialized from a YAML config file and also provides
/// built-in defaults.
#[derive(Debug, PartialEq, Eq, Clone, serde::Deserialize)]
#[serde(default)]
pub struct Conf {
    /// Directory completed received files are moved into.
    ///
    /// Default: unset, which resolves to `~/bluetooth-tui`.
    pub receive_dir: Option<String>,

    /// Object path of the adapter to select at startup.
    ///
    /// Default: unset, which selects the adapter with the smallest
    /// path.
    pub adapter: Option<String>,

    /// D-Bus related configuration.
    pub dbus: DBusConf,
}

/// D-Bus related configuration.
///
/// This struct is part of the main [`Conf`] struct.
#[derive(Debug, PartialEq, Eq, Clone, serde::Deserialize)]
#[serde(default)]
pub struct DBusConf {
    /// Bus name of the Bluetooth management service.
    ///
    /// Default: "org.bluez".
    pub service: String,

    /// Bus name of the file-transfer service.
    ///
    /// Default: "org.bluez.obex".
    pub obex_service: String,
}

impl Default for Conf {
    fn default() -> Self {
        Self {
            receive_dir: None,
            adapter: None,
            dbus: DBusConf::default(),
        }
    }
}

impl Default for DBusConf {
    fn default() -> Self {
        Self {
            service: "org.bluez".to_string(),
            obex_service: "org.bluez.obex".to_string(),
        }
    }
}

impl Conf {
    /// Loads the configuration from [`conf_filepath`] into the global
    /// instance.
    ///
    /// If the path cannot be determined or the file cannot be read or
    /// parsed, falls back to [`Conf::instance`], which uses the
    /// default configuration.
    pub fn load() -> &'static Self {
        match conf_filepath() {
            Ok(p) => Self::from_file(&p),
            Err(e) => {
                warn!(
                    "Could not determine config file path: {}. Falling back to defaults.",
                    e
                );
                Self::instance()
            }
        }
    }

    /// Initializes the global configuration from the YAML file at
    /// `path`.
    ///
    /// If the configuration is already initialized, the existing
    /// instance is returned and the file is ignored. On any read or
    /// parse error, falls back to [`Conf::default`].
    pub fn from_file(path: &str) -> &'static Self {
        if let Some(conf) = CONF.get() {
            warn!(
                "Conf::from_file({}) called, but configuration is already initialized. Using \
                    existing configuration and ignoring the file.",
                path
            );
            return conf;
        }

        CONF.get_or_init(|| {
            fs::read_to_string(path)
                .map_err(|e| {
                    warn!(
                        "Could not read config file '{}': {}. Falling back to defaults.",
                        path, e
                    );
                })
                .and_then(|contents| {
                    serde_yaml::from_str::<Conf>(&contents).map_err(|e| {
                        warn!(
                            "Could not parse config file '{}': {}. Falling back to defaults.",
                            path, e
                        );
                    })
                })
                .map(|conf| {
                    info!("Successfully loaded configuration from '{}'.", path);
                    conf
                })
                .unwrap_or_else(|_| Conf::default())
        })
    }

    /// Returns the global configuration instance.
    ///
    /// If the configuration has not been loaded yet, this initializes
    /// it with [`Conf::default`].
    pub fn instance() -> &'static Self {
        CONF.get_or_init(Conf::default)
    }
}
