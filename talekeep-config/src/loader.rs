use std::path::Path;

use thiserror::Error;

use crate::models::Config;

#[derive(Error, Debug)]
pub enum ConfigLoadError {
    #[error("failed to read configuration: {0}")]
    Read(#[from] config::ConfigError),

    #[error("configuration file not found: {0}")]
    FileMissing(String),
}

/// Load configuration from defaults, an optional TOML file, and `TALEKEEP_*`
/// environment variables (double underscore separates sections, e.g.
/// `TALEKEEP_QUEUE__WORKERS=4`).
pub fn load(file: Option<&Path>) -> Result<Config, ConfigLoadError> {
    let mut builder = config::Config::builder();

    if let Some(path) = file {
        if !path.exists() {
            return Err(ConfigLoadError::FileMissing(path.display().to_string()));
        }
        builder = builder.add_source(config::File::from(path));
    }

    let settings = builder
        .add_source(
            config::Environment::with_prefix("TALEKEEP")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let cfg: Config = settings.try_deserialize()?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::models::DatabaseBackend;

    #[test]
    fn defaults_apply_without_file() {
        let cfg = load(None).expect("defaults load");
        assert_eq!(cfg.queue.workers, 2);
        assert_eq!(cfg.event_hub.client_buffer, 100);
        assert_eq!(cfg.cache.library_size_ttl_secs, 60);
        assert_eq!(cfg.database.backend, DatabaseBackend::Sqlite);
    }

    #[test]
    fn file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            "[queue]\nworkers = 6\n\n[database]\nbackend = \"sled\"\n"
        )
        .unwrap();
        let cfg = load(Some(file.path())).expect("file load");
        assert_eq!(cfg.queue.workers, 6);
        assert_eq!(cfg.database.backend, DatabaseBackend::Sled);
        // Untouched sections keep defaults.
        assert_eq!(cfg.event_hub.heartbeat_interval_secs, 15);
    }

    #[test]
    fn missing_file_is_an_error() {
        let err = load(Some(Path::new("/nonexistent/talekeep.toml"))).unwrap_err();
        assert!(matches!(err, ConfigLoadError::FileMissing(_)));
    }
}
