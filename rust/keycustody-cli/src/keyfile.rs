use crate::error::{CliError, Result};
use log::{debug, warn};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

/// Raw key bytes stored in a file, nothing else.
#[derive(Debug, Clone)]
pub struct KeyFile {
    path: PathBuf,
}

impl KeyFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the key bytes into a buffer that is zeroized on drop.
    ///
    /// At most `expected + 1` bytes are read so an oversized file is noticed
    /// without reading all of it. The length is checked by the caller.
    pub fn read(&self, expected: usize) -> Result<Zeroizing<Vec<u8>>> {
        let file = File::open(&self.path).map_err(CliError::io("open key file", &self.path))?;
        let mut bytes = Zeroizing::new(Vec::with_capacity(expected + 1));
        file.take(expected as u64 + 1)
            .read_to_end(&mut bytes)
            .map_err(CliError::io("read key file", &self.path))?;
        debug!("Read {} key bytes from {}", bytes.len(), self.path.display());
        Ok(bytes)
    }

    /// Writes `key` to a new file.
    ///
    /// An existing file is only replaced when `overwrite` is set. On unix the
    /// file is created with mode 0600. A file this call created is removed
    /// again if writing fails.
    pub fn write(&self, key: &[u8], overwrite: bool) -> Result<()> {
        let mut options = OpenOptions::new();
        options.write(true);
        if overwrite {
            options.create(true).truncate(true);
        } else {
            options.create_new(true);
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut file = options
            .open(&self.path)
            .map_err(CliError::io("create key file", &self.path))?;
        if let Err(e) = file.write_all(key).and_then(|()| file.sync_all()) {
            drop(file);
            if let Err(rm) = fs::remove_file(&self.path) {
                warn!("Could not remove partial key file {}: {}", self.path.display(), rm);
            }
            return Err(CliError::io("write key file", &self.path)(e));
        }
        debug!("Wrote {} key bytes to {}", key.len(), self.path.display());
        Ok(())
    }
}
