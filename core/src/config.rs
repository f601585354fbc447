//! Open modes, tuning flags and per-store configuration.
//!
//! Configuration is fixed once a store is opened: the option structs are
//! consumed by `open`, and the store setters refuse changes afterwards.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::sync::Arc;

use crate::btree::Comparator;
use crate::error::{CaskError, Result};
use crate::storage::Codec;

/// Default bucket count of hash and table stores.
pub const HASH_DEFAULT_BUCKETS: u64 = 131_071;
/// Largest bucket count a hash or table store allocates.
pub const MAX_BUCKETS: u64 = 1 << 24;
/// Default bucket count recorded for ordered stores.
pub const BTREE_DEFAULT_BUCKETS: u64 = 32_749;
/// Default maximum records per leaf of an ordered store.
pub const BTREE_DEFAULT_LEAF_MEMBERS: u32 = 128;
/// Default maximum keys per internal node of an ordered store.
pub const BTREE_DEFAULT_INTERNAL_MEMBERS: u32 = 256;
/// Smallest node fan-out the tree accepts.
pub const BTREE_MIN_MEMBERS: u32 = 4;

const MAX_ALIGNMENT_POWER: u8 = 16;
const MAX_FREE_POOL_POWER: u8 = 20;
const DEFAULT_XMSIZE: u64 = 64 * 1024 * 1024;

/// Flags passed to `open`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpenMode(u32);

impl OpenMode {
    pub const READER: OpenMode = OpenMode(1 << 0);
    pub const WRITER: OpenMode = OpenMode(1 << 1);
    /// Create the file if it does not exist.
    pub const CREATE: OpenMode = OpenMode(1 << 2);
    /// Discard existing contents.
    pub const TRUNCATE: OpenMode = OpenMode(1 << 3);
    /// Skip advisory file locking.
    pub const NO_LOCK: OpenMode = OpenMode(1 << 4);
    /// Fail instead of waiting when the file lock is held elsewhere.
    pub const LOCK_NB: OpenMode = OpenMode(1 << 5);
    /// Sync the file after every write.
    pub const TSYNC: OpenMode = OpenMode(1 << 6);

    const ALL: u32 = (1 << 7) - 1;

    pub const fn empty() -> Self {
        OpenMode(0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Build from raw bits, ignoring unknown ones.
    pub const fn from_bits_truncate(bits: u32) -> Self {
        OpenMode(bits & Self::ALL)
    }

    pub const fn contains(self, other: OpenMode) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_writer(self) -> bool {
        self.contains(Self::WRITER)
    }
}

impl Default for OpenMode {
    fn default() -> Self {
        OpenMode::READER
    }
}

impl BitOr for OpenMode {
    type Output = OpenMode;

    fn bitor(self, rhs: OpenMode) -> OpenMode {
        OpenMode(self.0 | rhs.0)
    }
}

impl BitOrAssign for OpenMode {
    fn bitor_assign(&mut self, rhs: OpenMode) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for OpenMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(OpenMode, &str); 7] = [
            (OpenMode::READER, "READER"),
            (OpenMode::WRITER, "WRITER"),
            (OpenMode::CREATE, "CREATE"),
            (OpenMode::TRUNCATE, "TRUNCATE"),
            (OpenMode::NO_LOCK, "NO_LOCK"),
            (OpenMode::LOCK_NB, "LOCK_NB"),
            (OpenMode::TSYNC, "TSYNC"),
        ];
        let names: Vec<&str> = NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "OpenMode({})", names.join(" | "))
    }
}

/// Storage tuning flags recorded in the file header at creation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct TuneOpts(u8);

impl TuneOpts {
    /// Allow the file to grow beyond 2 GiB.
    pub const LARGE: TuneOpts = TuneOpts(1 << 0);
    pub const DEFLATE: TuneOpts = TuneOpts(1 << 1);
    pub const BZIP: TuneOpts = TuneOpts(1 << 2);
    /// Compress with the caller's own codec.
    pub const CUSTOM_CODEC: TuneOpts = TuneOpts(1 << 3);

    const ALL: u8 = (1 << 4) - 1;
    const COMPRESSION: u8 = Self::DEFLATE.0 | Self::BZIP.0 | Self::CUSTOM_CODEC.0;

    pub const fn empty() -> Self {
        TuneOpts(0)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn from_bits_truncate(bits: u8) -> Self {
        TuneOpts(bits & Self::ALL)
    }

    pub const fn contains(self, other: TuneOpts) -> bool {
        self.0 & other.0 == other.0
    }

    /// True if any compression flag is set.
    pub const fn compressed(self) -> bool {
        self.0 & Self::COMPRESSION != 0
    }
}

impl BitOr for TuneOpts {
    type Output = TuneOpts;

    fn bitor(self, rhs: TuneOpts) -> TuneOpts {
        TuneOpts(self.0 | rhs.0)
    }
}

/// Settings shared by every store kind.
#[derive(Clone)]
pub struct StorageOptions {
    /// Frames are padded to a multiple of `2^alignment_power` bytes.
    pub alignment_power: u8,
    /// Free block pool size as a power of two. Recorded in the header.
    pub free_pool_power: u8,
    pub opts: TuneOpts,
    /// Extra mapped memory hint in bytes. Advisory.
    pub xmsize: u64,
    /// Compact the file automatically once this many frames are obsolete.
    /// Zero disables automatic defragmentation.
    pub dfunit: u32,
    /// Make `tranbegin` wait for a running transaction instead of failing.
    pub mutex: bool,
    /// Codec used when a compression flag is set.
    pub codec: Option<Arc<dyn Codec>>,
}

impl StorageOptions {
    fn with_powers(alignment_power: u8, free_pool_power: u8) -> Self {
        Self {
            alignment_power,
            free_pool_power,
            opts: TuneOpts::empty(),
            xmsize: DEFAULT_XMSIZE,
            dfunit: 0,
            mutex: false,
            codec: None,
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.alignment_power > MAX_ALIGNMENT_POWER {
            return Err(CaskError::Config(format!(
                "alignment power {} exceeds {}",
                self.alignment_power, MAX_ALIGNMENT_POWER
            )));
        }
        if self.free_pool_power > MAX_FREE_POOL_POWER {
            return Err(CaskError::Config(format!(
                "free block pool power {} exceeds {}",
                self.free_pool_power, MAX_FREE_POOL_POWER
            )));
        }
        if self.opts.compressed() && self.codec.is_none() {
            return Err(CaskError::Config(
                "compression option requires a codec".into(),
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for StorageOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageOptions")
            .field("alignment_power", &self.alignment_power)
            .field("free_pool_power", &self.free_pool_power)
            .field("opts", &self.opts)
            .field("xmsize", &self.xmsize)
            .field("dfunit", &self.dfunit)
            .field("mutex", &self.mutex)
            .field("codec", &self.codec.as_ref().map(|c| c.name().to_string()))
            .finish()
    }
}

/// Hash store configuration.
#[derive(Clone, Debug)]
pub struct HashOptions {
    pub storage: StorageOptions,
    pub bucket_count: u64,
    /// Record cache size. Advisory: the whole image lives in memory.
    pub record_cache: usize,
}

impl Default for HashOptions {
    fn default() -> Self {
        Self {
            storage: StorageOptions::with_powers(4, 10),
            bucket_count: HASH_DEFAULT_BUCKETS,
            record_cache: 0,
        }
    }
}

impl HashOptions {
    pub fn with_bucket_count(mut self, bucket_count: u64) -> Self {
        self.bucket_count = bucket_count;
        self
    }

    pub fn with_codec(mut self, opts: TuneOpts, codec: Arc<dyn Codec>) -> Self {
        self.storage.opts = opts;
        self.storage.codec = Some(codec);
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        check_bucket_count(self.bucket_count)?;
        self.storage.validate()
    }
}

/// Ordered store configuration.
#[derive(Clone)]
pub struct BTreeOptions {
    pub storage: StorageOptions,
    pub leaf_members: u32,
    pub internal_members: u32,
    /// Recorded in the header only; the tree does not hash.
    pub bucket_count: u64,
    pub leaf_cache: usize,
    pub node_cache: usize,
    /// Key order. `None` means lexical, or the builtin recorded in an
    /// existing file.
    pub comparator: Option<Arc<dyn Comparator>>,
}

impl Default for BTreeOptions {
    fn default() -> Self {
        Self {
            storage: StorageOptions::with_powers(8, 10),
            leaf_members: BTREE_DEFAULT_LEAF_MEMBERS,
            internal_members: BTREE_DEFAULT_INTERNAL_MEMBERS,
            bucket_count: BTREE_DEFAULT_BUCKETS,
            leaf_cache: 1024,
            node_cache: 512,
            comparator: None,
        }
    }
}

impl fmt::Debug for BTreeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BTreeOptions")
            .field("storage", &self.storage)
            .field("leaf_members", &self.leaf_members)
            .field("internal_members", &self.internal_members)
            .field("bucket_count", &self.bucket_count)
            .field("leaf_cache", &self.leaf_cache)
            .field("node_cache", &self.node_cache)
            .field("comparator", &self.comparator.as_ref().map(|c| c.name()))
            .finish()
    }
}

impl BTreeOptions {
    pub fn with_comparator(mut self, comparator: Arc<dyn Comparator>) -> Self {
        self.comparator = Some(comparator);
        self
    }

    pub fn with_members(mut self, leaf_members: u32, internal_members: u32) -> Self {
        self.leaf_members = leaf_members;
        self.internal_members = internal_members;
        self
    }

    pub fn with_codec(mut self, opts: TuneOpts, codec: Arc<dyn Codec>) -> Self {
        self.storage.opts = opts;
        self.storage.codec = Some(codec);
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.leaf_members < BTREE_MIN_MEMBERS || self.internal_members < BTREE_MIN_MEMBERS {
            return Err(CaskError::Config(format!(
                "node members must be at least {BTREE_MIN_MEMBERS}"
            )));
        }
        self.storage.validate()
    }
}

/// Table store configuration.
#[derive(Clone, Debug)]
pub struct TableOptions {
    pub storage: StorageOptions,
    pub bucket_count: u64,
    pub record_cache: usize,
    /// Leaf and node cache sizes of the index trees. Advisory.
    pub leaf_cache: usize,
    pub node_cache: usize,
}

impl Default for TableOptions {
    fn default() -> Self {
        Self {
            storage: StorageOptions::with_powers(4, 10),
            bucket_count: HASH_DEFAULT_BUCKETS,
            record_cache: 0,
            leaf_cache: 4096,
            node_cache: 512,
        }
    }
}

impl TableOptions {
    pub fn with_bucket_count(mut self, bucket_count: u64) -> Self {
        self.bucket_count = bucket_count;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        check_bucket_count(self.bucket_count)?;
        self.storage.validate()
    }
}

/// Tuning passed to `tune` before open and `optimize` on a live store.
///
/// `None` keeps the current value. A zero `bucket_count` picks a value from
/// the record count when optimizing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Tuning {
    pub bucket_count: u64,
    pub alignment_power: Option<u8>,
    pub free_pool_power: Option<u8>,
    pub opts: Option<TuneOpts>,
    /// Ordered stores only.
    pub leaf_members: Option<u32>,
    /// Ordered stores only.
    pub internal_members: Option<u32>,
}

impl Tuning {
    pub fn buckets(bucket_count: u64) -> Self {
        Self {
            bucket_count,
            ..Self::default()
        }
    }

    pub(crate) fn apply_storage(&self, storage: &mut StorageOptions) {
        if let Some(apow) = self.alignment_power {
            storage.alignment_power = apow;
        }
        if let Some(fpow) = self.free_pool_power {
            storage.free_pool_power = fpow;
        }
        if let Some(opts) = self.opts {
            storage.opts = opts;
        }
    }

    /// Bucket count for a rebuild of a store holding `records` records.
    /// A derived count is clamped to `MAX_BUCKETS`; an explicit one above
    /// it is refused.
    pub(crate) fn rebuild_buckets(&self, records: u64, current: u64) -> Result<u64> {
        match self.bucket_count {
            0 if records == 0 => Ok(current),
            0 => Ok(records
                .saturating_mul(2)
                .saturating_add(1)
                .clamp(HASH_MIN_REBUILD_BUCKETS, MAX_BUCKETS)),
            n => check_bucket_count(n),
        }
    }
}

const HASH_MIN_REBUILD_BUCKETS: u64 = 1021;

/// Accept a bucket count between 1 and `MAX_BUCKETS`.
pub(crate) fn check_bucket_count(bucket_count: u64) -> Result<u64> {
    if bucket_count == 0 {
        return Err(CaskError::Config("bucket count must be positive".into()));
    }
    if bucket_count > MAX_BUCKETS {
        return Err(CaskError::Config(format!(
            "bucket count {bucket_count} exceeds {MAX_BUCKETS}"
        )));
    }
    Ok(bucket_count)
}
