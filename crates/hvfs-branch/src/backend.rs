//! Where operators put their results

use crate::error::{BranchError, BranchResult};

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Durable sink for operator output and ack tables
pub trait BranchBackend: Send + Sync {
    /// Append `data` to the output named `target`
    fn append_output(&self, target: &str, data: &[u8]) -> BranchResult<()>;

    /// Replace the stored ack table of `branch`
    fn store_ack_table(&self, branch: &str, table: &[u8]) -> BranchResult<()>;

    /// Stored ack table of `branch`, if any
    fn load_ack_table(&self, branch: &str) -> BranchResult<Option<Vec<u8>>>;
}

/// Backend writing plain files under a base directory
///
/// Output targets are resolved relative to the base, so `/logs/x` and
/// `logs/x` name the same file; targets may not leave the base. Ack tables
/// live in `<branch>.acks` directly under the base.
#[derive(Debug, Clone)]
pub struct FsBackend {
    base: PathBuf,
}

impl FsBackend {
    pub fn new(base: impl AsRef<Path>) -> Self {
        Self {
            base: base.as_ref().to_path_buf(),
        }
    }

    pub fn output_path(&self, target: &str) -> BranchResult<PathBuf> {
        Ok(self.base.join(relative_path(target)?))
    }

    fn ack_path(&self, branch: &str) -> BranchResult<PathBuf> {
        let name = relative_path(branch)?;
        if name.components().count() != 1 {
            return Err(BranchError::InvalidConfig(format!(
                "branch name {branch:?} is not a plain file name"
            )));
        }
        Ok(self.base.join(format!("{}.acks", name.display())))
    }
}

/// Turn an output name into a path that stays below the base directory
///
/// Leading slashes are dropped; `..`, drive prefixes and empty names are
/// rejected.
pub fn relative_path(name: &str) -> BranchResult<PathBuf> {
    let invalid = || BranchError::InvalidConfig(format!("name {name:?} escapes the base"));
    let mut path = PathBuf::new();
    for component in Path::new(name.trim_start_matches('/')).components() {
        match component {
            Component::Normal(part) => path.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(invalid());
            }
        }
    }
    if path.as_os_str().is_empty() {
        return Err(invalid());
    }
    Ok(path)
}

impl BranchBackend for FsBackend {
    fn append_output(&self, target: &str, data: &[u8]) -> BranchResult<()> {
        let path = self.output_path(target)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(data)?;
        debug!("appended {} bytes to {:?}", data.len(), path);
        Ok(())
    }

    fn store_ack_table(&self, branch: &str, table: &[u8]) -> BranchResult<()> {
        fs::create_dir_all(&self.base)?;
        let path = self.ack_path(branch)?;
        let staging = path.with_extension("acks.tmp");
        {
            let mut file = File::create(&staging)?;
            file.write_all(table)?;
            file.sync_all()?;
        }
        fs::rename(&staging, &path)?;
        debug!("stored {} byte ack table for {}", table.len(), branch);
        Ok(())
    }

    fn load_ack_table(&self, branch: &str) -> BranchResult<Option<Vec<u8>>> {
        let mut file = match File::open(self.ack_path(branch)?) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut table = Vec::new();
        file.read_to_end(&mut table)?;
        Ok(Some(table))
    }
}
