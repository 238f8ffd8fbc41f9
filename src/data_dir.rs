use std::path::{Path, PathBuf};

/// Manages the `.bagula/` directory layout.
///
/// The database and the config file live under a single data directory
/// (default `.bagula/`). This struct provides accessors for each well-known
/// path and handles initialization.
#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    /// Create a new DataDir referencing the given root path.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The root directory (e.g. `.bagula/`).
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path to the SQLite database.
    pub fn db(&self) -> PathBuf {
        self.root.join("bagula.db")
    }

    /// Path to the config file (e.g. `.bagula/config.toml`).
    pub fn config(&self) -> PathBuf {
        self.root.join("config.toml")
    }

    /// Default content written to `config.toml` when initializing a new data directory.
    const DEFAULT_CONFIG: &str = "\
# Bagula platform configuration
# Every key is optional; omitted keys use built-in defaults.

[server]
bind = \"127.0.0.1\"
port = 8000
request_timeout_ms = 10000

[queue]
workers = 4
capacity = 1024

[auth]
min_key_length = 10

[logging]
level = \"bagula=info\"
format = \"pretty\"
";

    /// Initialize the directory and write a default config.toml if one
    /// doesn't already exist.
    /// Returns Ok(true) if the root was created, Ok(false) if it already existed.
    pub fn init(&self) -> std::io::Result<bool> {
        let created = !self.root.exists();
        std::fs::create_dir_all(&self.root)?;

        let config_path = self.config();
        if !config_path.exists() {
            std::fs::write(&config_path, Self::DEFAULT_CONFIG)?;
        }

        Ok(created)
    }

    /// Resolve the database path: an explicit override wins, otherwise `db()`.
    pub fn resolve_db(&self, configured: Option<&Path>) -> PathBuf {
        match configured {
            Some(p) => p.to_path_buf(),
            None => self.db(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PlatformConfig;

    #[test]
    fn test_data_dir_paths() {
        let dd = DataDir::new("/tmp/x/.bagula");
        assert_eq!(dd.root(), Path::new("/tmp/x/.bagula"));
        assert_eq!(dd.db(), PathBuf::from("/tmp/x/.bagula/bagula.db"));
        assert_eq!(dd.config(), PathBuf::from("/tmp/x/.bagula/config.toml"));
    }

    #[test]
    fn test_init_creates_root_and_parsable_config() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join(".bagula");
        let dd = DataDir::new(&root);

        assert!(!root.exists());
        let created = dd.init().unwrap();
        assert!(created);
        assert!(root.exists());
        assert!(dd.config().exists());

        let cfg = PlatformConfig::load(&dd.config()).unwrap();
        assert_eq!(cfg.server.port, 8000);
        assert_eq!(cfg.queue.workers, 4);
    }

    #[test]
    fn test_init_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let dd = DataDir::new(tmp.path().join(".bagula"));

        assert!(dd.init().unwrap());
        assert!(!dd.init().unwrap());
    }

    #[test]
    fn test_init_does_not_overwrite_existing_config() {
        let tmp = tempfile::tempdir().unwrap();
        let dd = DataDir::new(tmp.path().join(".bagula"));
        dd.init().unwrap();

        let custom = "[server]\nport = 9999\n";
        std::fs::write(dd.config(), custom).unwrap();

        dd.init().unwrap();
        let contents = std::fs::read_to_string(dd.config()).unwrap();
        assert_eq!(contents, custom);
    }

    #[test]
    fn test_resolve_db_prefers_override() {
        let dd = DataDir::new("/data/.bagula");
        assert_eq!(dd.resolve_db(None), PathBuf::from("/data/.bagula/bagula.db"));
        assert_eq!(
            dd.resolve_db(Some(Path::new("/var/lib/bagula.db"))),
            PathBuf::from("/var/lib/bagula.db")
        );
    }
}
