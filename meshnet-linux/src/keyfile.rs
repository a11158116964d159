//! On-disk WireGuard private key. One file, base64 text, mode 0600.

use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::sync::Mutex;

use meshnet_core::{Keypair, ProgrammerError};
use tracing::info;

pub struct KeyFile {
    path: PathBuf,
    // Serializes load-or-create so two callers never both generate a key.
    lock: Mutex<()>,
}

impl KeyFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Read the stored key, generating and persisting a new one if the file
    /// does not exist yet.
    pub fn load_or_create(&self) -> Result<Keypair, ProgrammerError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        match fs::read_to_string(&self.path) {
            Ok(text) => {
                Keypair::from_private_base64(&text).map_err(|source| ProgrammerError::StoredKey {
                    path: self.path.clone(),
                    source,
                })
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let keypair = Keypair::generate();
                self.write(&keypair)
                    .map_err(|source| ProgrammerError::KeySave {
                        path: self.path.clone(),
                        source,
                    })?;
                info!(
                    path = %self.path.display(),
                    public_key = %keypair.public_key(),
                    "generated new WireGuard key"
                );
                Ok(keypair)
            }
            Err(source) => Err(ProgrammerError::KeyLoad {
                path: self.path.clone(),
                source,
            }),
        }
    }

    fn write(&self, keypair: &Keypair) -> io::Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        // Write next to the target and rename so a crash never leaves a
        // truncated key behind.
        let tmp = self.path.with_extension("tmp");
        let mut f = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&tmp)?;
        f.write_all(keypair.private_base64().as_bytes())?;
        f.sync_all()?;
        fs::rename(&tmp, &self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn generated_key_is_reloaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state/clusternet.key");

        let first = KeyFile::new(&path).load_or_create().unwrap();
        let second = KeyFile::new(&path).load_or_create().unwrap();
        assert_eq!(first.public_key(), second.public_key());

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn existing_key_is_used() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clusternet.key");
        let kp = Keypair::generate();
        fs::write(&path, format!("{}\n", kp.private_base64())).unwrap();

        let loaded = KeyFile::new(&path).load_or_create().unwrap();
        assert_eq!(loaded.public_key(), kp.public_key());
    }

    #[test]
    fn garbage_key_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clusternet.key");
        fs::write(&path, "hunter2").unwrap();

        let err = KeyFile::new(&path).load_or_create().unwrap_err();
        assert!(matches!(err, ProgrammerError::StoredKey { .. }));
        // The bad file is left alone for an operator to inspect.
        assert_eq!(fs::read_to_string(&path).unwrap(), "hunter2");
    }

    #[test]
    fn unreadable_path_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the key file should be.
        let path = dir.path().join("clusternet.key");
        fs::create_dir(&path).unwrap();

        let err = KeyFile::new(&path).load_or_create().unwrap_err();
        assert!(matches!(err, ProgrammerError::KeyLoad { .. }));
    }
}
