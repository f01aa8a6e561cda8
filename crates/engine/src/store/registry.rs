//! Process-wide registry of open file-backed stores
//!
//! Opening a directory that is already open returns the live instance, so two
//! handles never map the same store file. Entries are weak: dropping the last
//! handle closes the store and removes its entry.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Weak;

use super::AsyncContainers;

/// Open stores by canonical data directory
pub static OPEN_STORES: Lazy<Mutex<HashMap<PathBuf, Weak<AsyncContainers>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));
