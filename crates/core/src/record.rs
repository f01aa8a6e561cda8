//! Records stored against keys, and the options that govern how they are written

use std::ops::BitOr;

/// Sentinel value id meaning "no value chain".
pub const ID_UNDEFINED: u64 = u64::MAX;

/// Sentinel version meaning "no version supplied".
pub const VERSION_UNDEFINED: u64 = u64::MAX;

/// Version assigned to a record on its first insert.
pub const VERSION_INITIAL: u64 = 1;

/// End-of-life value for records that never expire.
pub const EOL_NEVER: u64 = 0;

/// Metadata stored for one key: the value id, its end-of-life and its version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Record {
    /// First block of the value chain, or `ID_UNDEFINED`
    pub id: u64,
    /// Unix seconds after which the record is expired, 0 = never
    pub eol: u64,
    /// Monotonic per-key version
    pub version: u64,
}

impl Record {
    /// Create a record
    pub fn new(id: u64, eol: u64, version: u64) -> Self {
        Self { id, eol, version }
    }

    /// Whether the record points at a value chain
    pub fn has_value(&self) -> bool {
        self.id != ID_UNDEFINED
    }

    /// Whether the record is expired at `now` (unix seconds)
    pub fn is_expired(&self, now: u64) -> bool {
        self.eol != EOL_NEVER && self.eol < now
    }
}

/// Option flags for a single put.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct RecordOptions(u8);

impl RecordOptions {
    /// No options
    pub const NONE: RecordOptions = RecordOptions(0);
    /// Fail with an option mismatch if a live record exists
    pub const ONLY_INSERT: RecordOptions = RecordOptions(0b01);
    /// Skip the version check and store the caller's version when supplied
    pub const OVERRIDE_VERSION: RecordOptions = RecordOptions(0b10);

    /// Whether every flag of `other` is set
    pub fn contains(self, other: RecordOptions) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether no flag is set
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for RecordOptions {
    type Output = RecordOptions;

    fn bitor(self, rhs: RecordOptions) -> RecordOptions {
        RecordOptions(self.0 | rhs.0)
    }
}

/// Parameters of a put.
///
/// ```
/// use tessera_core::{PutOptions, RecordOptions};
///
/// let opts = PutOptions::new().with_version(3).with_ttl(60);
/// assert_eq!(opts.version, Some(3));
/// assert!(!opts.options.contains(RecordOptions::ONLY_INSERT));
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PutOptions {
    /// Expected stored version (or, with `OVERRIDE_VERSION`, the version to store)
    pub version: Option<u64>,
    /// Absolute end-of-life in unix seconds, 0 = never
    pub eol: u64,
    /// Relative time-to-live in seconds; takes precedence over `eol`
    pub ttl: Option<u64>,
    /// Record option flags
    pub options: RecordOptions,
}

impl PutOptions {
    /// Unconditional put that never expires
    pub fn new() -> Self {
        Self::default()
    }

    /// Expect (or with `OVERRIDE_VERSION`, store) this version
    pub fn with_version(mut self, version: u64) -> Self {
        self.version = Some(version);
        self
    }

    /// Expire at an absolute unix second
    pub fn with_eol(mut self, eol: u64) -> Self {
        self.eol = eol;
        self
    }

    /// Expire `ttl` seconds after the put executes
    pub fn with_ttl(mut self, ttl: u64) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Fail if a live record already exists
    pub fn only_insert(mut self) -> Self {
        self.options = self.options | RecordOptions::ONLY_INSERT;
        self
    }

    /// Skip the version check
    pub fn override_version(mut self) -> Self {
        self.options = self.options | RecordOptions::OVERRIDE_VERSION;
        self
    }

    /// Resolve the end-of-life at `now`, clamped by a container's `max_ttl`.
    pub fn resolve_eol(&self, now: u64, max_ttl: u64) -> u64 {
        let requested = match self.ttl {
            Some(ttl) => now.saturating_add(ttl),
            None => self.eol,
        };
        if max_ttl == 0 {
            return requested;
        }
        let limit = now.saturating_add(max_ttl);
        if requested == EOL_NEVER || requested > limit {
            limit
        } else {
            requested
        }
    }
}
