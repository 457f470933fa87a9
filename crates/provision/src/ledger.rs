//! Resource ledger
//!
//! Keeps the set of resource tags that are allocated and not yet destroyed,
//! and mirrors it into a plain-text file (one tag per line) so that a
//! cleanup pass can reclaim cloud resources leaked by a crashed run.
//!
//! Every mutation takes an exclusive `flock` on a sidecar `<file>.lock`,
//! re-reads the file so that tags written by other processes are kept, and
//! rewrites it. The new content is written to a temporary file next to the
//! target and renamed over it, so a reader never observes a partially
//! written ledger.

use nix::fcntl::{Flock, FlockArg};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::fs::{File, OpenOptions, Permissions};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tracing::{debug, info};

use testbed_common::{Error, ProvisionerPolicy, Result};

/// Ledgers backed by the same file share one lock and one tag set
static OPEN_LEDGERS: Lazy<Mutex<HashMap<PathBuf, Weak<Mutex<LedgerState>>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Ledger files stay readable by out-of-band cleanup tooling
const LEDGER_MODE: u32 = 0o644;

#[derive(Debug)]
struct LedgerState {
    path: Option<PathBuf>,
    tags: BTreeSet<String>,
}

/// Crash-safe record of allocated resource tags
///
/// Cloning yields another handle to the same ledger.
#[derive(Debug, Clone)]
pub struct ResourceLedger {
    state: Arc<Mutex<LedgerState>>,
}

impl ResourceLedger {
    /// Ledger without a backing file, used for duplicate detection only
    pub fn in_memory() -> Self {
        Self {
            state: Arc::new(Mutex::new(LedgerState {
                path: None,
                tags: BTreeSet::new(),
            })),
        }
    }

    /// Open the ledger backed by `path`
    ///
    /// Tags already recorded in the file (left behind by a run that did not
    /// clean up) are kept, as the resources behind them may still exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let key = absolute(path.as_ref())?;

        let mut open = OPEN_LEDGERS.lock();
        if let Some(state) = open.get(&key).and_then(Weak::upgrade) {
            return Ok(Self { state });
        }

        let tags = if key.exists() {
            Self::read_file(&key)?
        } else {
            BTreeSet::new()
        };
        if !tags.is_empty() {
            info!(
                path = %key.display(),
                leaked = tags.len(),
                "resource ledger holds tags from a previous run"
            );
        }

        let state = Arc::new(Mutex::new(LedgerState {
            path: Some(key.clone()),
            tags,
        }));
        open.retain(|_, weak| weak.strong_count() > 0);
        open.insert(key, Arc::downgrade(&state));
        Ok(Self { state })
    }

    /// Ledger configured by the policy's `resource_list_file`
    pub fn from_policy(policy: &ProvisionerPolicy) -> Result<Self> {
        match &policy.resource_list_file {
            Some(path) => Self::open(path),
            None => Ok(Self::in_memory()),
        }
    }

    /// Record a newly allocated tag
    ///
    /// Fails with [`Error::DuplicateTag`] if the tag is already recorded.
    pub fn allocate(&self, tag: &str) -> Result<()> {
        self.state.lock().update(|tags| {
            if !tags.insert(tag.to_string()) {
                return Err(Error::DuplicateTag(tag.to_string()));
            }
            Ok(())
        })?;

        debug!(tag, "resource allocated");
        Ok(())
    }

    /// Forget a tag whose resources were destroyed
    ///
    /// Removing a tag that is not recorded is not an error.
    pub fn deallocate(&self, tag: &str) -> Result<()> {
        let removed = self.state.lock().update(|tags| Ok(tags.remove(tag)))?;
        if removed {
            debug!(tag, "resource released");
        }
        Ok(())
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.state.lock().tags.contains(tag)
    }

    /// Currently allocated tags, sorted
    pub fn tags(&self) -> Vec<String> {
        self.state.lock().tags.iter().cloned().collect()
    }

    pub fn path(&self) -> Option<PathBuf> {
        self.state.lock().path.clone()
    }

    /// Parse a ledger file
    pub fn read_file(path: impl AsRef<Path>) -> Result<BTreeSet<String>> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Ok(content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }
}

impl LedgerState {
    /// Apply `mutate` to the recorded tags and persist the result
    ///
    /// For file-backed ledgers the file is re-read under the lock first and
    /// replaces the in-memory set. Nothing changes if `mutate` or the write
    /// fails.
    fn update<T>(
        &mut self,
        mutate: impl FnOnce(&mut BTreeSet<String>) -> Result<T>,
    ) -> Result<T> {
        let Some(path) = self.path.clone() else {
            return mutate(&mut self.tags);
        };

        let _lock = lock(&path)?;
        let mut tags = if path.exists() {
            ResourceLedger::read_file(&path)?
        } else {
            self.tags.clone()
        };
        let out = mutate(&mut tags)?;
        write(&path, &tags)?;
        self.tags = tags;
        Ok(out)
    }
}

fn persistence(path: &Path) -> impl Fn(std::io::Error) -> Error + '_ {
    move |source| Error::Persistence {
        path: path.to_path_buf(),
        source,
    }
}

/// Exclusive advisory lock on `<path>.lock`, released on drop
fn lock(path: &Path) -> Result<Flock<File>> {
    let mut name = path.as_os_str().to_owned();
    name.push(".lock");
    let lock_path = PathBuf::from(name);

    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&lock_path)
        .map_err(persistence(&lock_path))?;
    Flock::lock(file, FlockArg::LockExclusive)
        .map_err(|(_, errno)| persistence(&lock_path)(std::io::Error::from(errno)))
}

fn write(path: &Path, tags: &BTreeSet<String>) -> Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let mut file = tempfile::NamedTempFile::new_in(dir).map_err(persistence(path))?;
    for tag in tags {
        writeln!(file, "{}", tag).map_err(persistence(path))?;
    }
    file.as_file()
        .set_permissions(Permissions::from_mode(LEDGER_MODE))
        .map_err(persistence(path))?;
    file.as_file().sync_all().map_err(persistence(path))?;
    file.persist(path).map_err(|e| persistence(path)(e.error))?;
    Ok(())
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}
