//! Process-wide environment for the embedded core
//!
//! The core locates its data assets (geo databases, certificates) through
//! environment variables and a file-reader hook. [`init_environment`] wires
//! both: the asset directory is exported under the core's asset and cert
//! variables, and [`open_asset`] serves reads from inside that directory,
//! falling back to the platform's asset bundle for files shipped inside the
//! application package instead of on disk.

use once_cell::sync::Lazy;
use std::fs::File;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::{debug, warn};

/// Asset directory variable consumed by the core.
pub const ENV_ASSET_DIR: &str = "core.location.asset";

/// Certificate directory variable; served from the same asset directory.
pub const ENV_CERT_DIR: &str = "core.location.cert";

/// XUDP base key variable consumed by the core's transports.
pub const ENV_XUDP_BASEKEY: &str = "core.xudp.basekey";

/// Longest path accepted by the file-reader hook.
const MAX_PATH_LEN: usize = 256;

/// Environment errors
#[derive(Debug, Error)]
pub enum EnvError {
    #[error("path too long")]
    PathTooLong,

    #[error("path escapes the asset directory: {0}")]
    PathEscape(String),

    #[error("environment not initialized")]
    NotInitialized,

    #[error("asset not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Platform asset-bundle port: opens a file by bare name out of the
/// application package (APK assets, app bundle resources) when it is absent
/// from the asset directory on disk.
pub trait AssetBundle: Send + Sync {
    fn open(&self, name: &str) -> std::io::Result<Box<dyn Read + Send>>;
}

static ASSET_DIR: Lazy<RwLock<Option<PathBuf>>> = Lazy::new(|| RwLock::new(None));
static BUNDLE: Lazy<RwLock<Option<Arc<dyn AssetBundle>>>> = Lazy::new(|| RwLock::new(None));

/// Export the asset directory and XUDP key to the core and arm the
/// file-reader hook. Safe to call again when the host moves its asset dir.
pub fn init_environment(asset_dir: impl Into<PathBuf>, xudp_key: &str) {
    let asset_dir = asset_dir.into();
    std::env::set_var(ENV_ASSET_DIR, &asset_dir);
    std::env::set_var(ENV_CERT_DIR, &asset_dir);
    std::env::set_var(ENV_XUDP_BASEKEY, xudp_key);

    let mut dir = ASSET_DIR
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    debug!(asset_dir = %asset_dir.display(), "environment initialized");
    *dir = Some(asset_dir);
}

/// Register the platform asset bundle used as the filesystem fallback.
pub fn set_asset_bundle(bundle: Arc<dyn AssetBundle>) {
    let mut slot = BUNDLE
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    *slot = Some(bundle);
}

/// File-reader hook handed to the core.
///
/// Resolves `path` relative to the asset directory, refusing anything that
/// escapes it after lexical cleaning; a file missing from the filesystem is
/// looked up in the registered asset bundle by bare name.
pub fn open_asset(path: &str) -> Result<Box<dyn Read + Send>, EnvError> {
    if path.len() > MAX_PATH_LEN {
        return Err(EnvError::PathTooLong);
    }

    let dir = ASSET_DIR
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone()
        .ok_or(EnvError::NotInitialized)?;

    let clean = clean_path(Path::new(path)).ok_or_else(|| EnvError::PathEscape(path.to_string()))?;
    let full = dir.join(&clean);

    if full.is_file() {
        return Ok(Box::new(File::open(&full)?));
    }

    let name = clean
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| EnvError::NotFound(path.to_string()))?;
    let bundle = BUNDLE
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone();
    match bundle {
        Some(bundle) => bundle.open(name).map_err(|err| {
            warn!(%err, name, "asset bundle lookup failed");
            EnvError::NotFound(path.to_string())
        }),
        None => Err(EnvError::NotFound(path.to_string())),
    }
}

/// Lexically normalize `path`, rejecting absolute paths and any traversal
/// that would climb out of the asset directory.
fn clean_path(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    let mut depth = 0usize;
    for component in path.components() {
        match component {
            Component::Normal(part) => {
                out.push(part);
                depth += 1;
            }
            Component::CurDir => {}
            Component::ParentDir => {
                if depth == 0 {
                    return None;
                }
                out.pop();
                depth -= 1;
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    if out.as_os_str().is_empty() {
        None
    } else {
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Mutex;

    // the hook state is process-wide; serialize tests that touch it
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    struct MapBundle(std::collections::HashMap<String, Vec<u8>>);

    impl AssetBundle for MapBundle {
        fn open(&self, name: &str) -> std::io::Result<Box<dyn Read + Send>> {
            match self.0.get(name) {
                Some(data) => Ok(Box::new(std::io::Cursor::new(data.clone()))),
                None => Err(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    name.to_string(),
                )),
            }
        }
    }

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "tunnel-bridge-env-{tag}-{}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn read_all(mut reader: Box<dyn Read + Send>) -> Vec<u8> {
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).unwrap();
        buf
    }

    #[test]
    fn clean_path_rejects_escapes() {
        assert!(clean_path(Path::new("../secret")).is_none());
        assert!(clean_path(Path::new("a/../../secret")).is_none());
        assert!(clean_path(Path::new("/etc/passwd")).is_none());
        assert!(clean_path(Path::new("")).is_none());
        assert_eq!(
            clean_path(Path::new("geo/./site.dat")).unwrap(),
            PathBuf::from("geo/site.dat")
        );
        assert_eq!(
            clean_path(Path::new("a/b/../c.dat")).unwrap(),
            PathBuf::from("a/c.dat")
        );
    }

    #[test]
    fn open_asset_reads_from_the_asset_dir() {
        let _guard = ENV_LOCK.lock().unwrap();
        let dir = scratch_dir("read");
        std::fs::File::create(dir.join("geosite.dat"))
            .unwrap()
            .write_all(b"geodata")
            .unwrap();
        init_environment(&dir, "key");

        let data = read_all(open_asset("geosite.dat").unwrap());
        assert_eq!(data, b"geodata");
        assert_eq!(std::env::var(ENV_ASSET_DIR).unwrap(), dir.display().to_string());
        assert_eq!(std::env::var(ENV_CERT_DIR).unwrap(), dir.display().to_string());
        assert_eq!(std::env::var(ENV_XUDP_BASEKEY).unwrap(), "key");
    }

    #[test]
    fn open_asset_refuses_traversal() {
        let _guard = ENV_LOCK.lock().unwrap();
        init_environment(scratch_dir("traversal"), "key");

        assert!(matches!(
            open_asset("../../etc/passwd"),
            Err(EnvError::PathEscape(_))
        ));
        assert!(matches!(
            open_asset("/etc/passwd"),
            Err(EnvError::PathEscape(_))
        ));
        let long = "a/".repeat(200);
        assert!(matches!(open_asset(&long), Err(EnvError::PathTooLong)));
    }

    #[test]
    fn open_asset_falls_back_to_the_bundle() {
        let _guard = ENV_LOCK.lock().unwrap();
        init_environment(scratch_dir("bundle"), "key");

        let mut files = std::collections::HashMap::new();
        files.insert("geoip.dat".to_string(), b"bundled".to_vec());
        set_asset_bundle(Arc::new(MapBundle(files)));

        // absent from the filesystem, present in the bundle (by bare name)
        let data = read_all(open_asset("sub/geoip.dat").unwrap());
        assert_eq!(data, b"bundled");

        assert!(matches!(
            open_asset("missing.dat"),
            Err(EnvError::NotFound(_))
        ));
    }
}
