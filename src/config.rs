//! Policy knobs shared across reclamation schemes, and the
//! `Config`/`ConfigBuilder` pattern each scheme exposes its own flavor of.

const DEFAULT_INIT_CACHE: usize = 128;
const DEFAULT_MIN_REQUIRED_RECORDS: u32 = 0;

cfg_if::cfg_if! {
    if #[cfg(feature = "maximum-reclamation-freq")] {
        // useful for finding reclamation bugs under test: every single retire
        // attempts a scan instead of batching up to the usual threshold
        const DEFAULT_SCAN_THRESHOLD: u32 = 1;
    } else {
        const DEFAULT_SCAN_THRESHOLD: u32 = 128;
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// ScanStrategy
////////////////////////////////////////////////////////////////////////////////////////////////////

/// When a thread should scan for reclaimable records.
///
/// `OpsCount` is the strategy the teacher repo implements (count guard
/// acquisitions/releases against a threshold); `Fraser` and `Debra` are the
/// two classic epoch-scheme variants layered on top of it by
/// [`crate::schemes::ebr`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStrategy {
    /// Scan after every `scan_threshold` retire operations.
    OpsCount,
    /// Fraser-style: attempt to advance the global epoch, and scan, on
    /// every retire.
    Fraser,
    /// DEBRA-style: only attempt to advance the epoch when the calling
    /// thread is not itself active in a critical section, trading
    /// reclamation promptness for fewer wasted attempts.
    Debra,
}

impl Default for ScanStrategy {
    #[inline]
    fn default() -> Self {
        ScanStrategy::OpsCount
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// AbandonStrategy
////////////////////////////////////////////////////////////////////////////////////////////////////

/// What a thread does with its retire list when its [`crate::registry`]
/// slot is torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbandonStrategy {
    /// Move the thread's retired records straight onto the global
    /// abandoned-bag list, to be adopted by some other live thread.
    Abandon,
    /// Reclaim whatever can be reclaimed immediately and abandon only the
    /// remainder.
    ReclaimThenAbandon,
}

impl Default for AbandonStrategy {
    #[inline]
    fn default() -> Self {
        AbandonStrategy::ReclaimThenAbandon
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// RegionExtension
////////////////////////////////////////////////////////////////////////////////////////////////////

/// How aggressively a thread extends its protected region across nested
/// guards. Relevant to [`crate::schemes::ebr`] only; the hazard-based
/// schemes protect per-guard and ignore this policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionExtension {
    /// Every guard pins and unpins the epoch independently.
    Eager,
    /// Nested guards on the same thread share a single pin, released only
    /// when the outermost region guard drops.
    Lazy,
}

impl Default for RegionExtension {
    #[inline]
    fn default() -> Self {
        RegionExtension::Lazy
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Config
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Runtime configuration parameters shared by all three reclamation
/// schemes.
#[derive(Copy, Clone, Debug)]
pub struct Config {
    init_cache: usize,
    min_required_records: u32,
    scan_threshold: u32,
    scan_strategy: ScanStrategy,
    abandon_strategy: AbandonStrategy,
    region_extension: RegionExtension,
    max_slots: Option<usize>,
}

/********** impl Default **************************************************************************/

impl Default for Config {
    #[inline]
    fn default() -> Self {
        ConfigBuilder::new().build()
    }
}

/********** impl inherent *************************************************************************/

impl Config {
    /// Returns the initial cache size for newly spawned threads.
    #[inline]
    pub fn init_cache(&self) -> usize {
        self.init_cache
    }

    /// Returns the minimum amount of retired records that is required,
    /// before an attempt at reclaiming records is initiated.
    #[inline]
    pub fn min_required_records(&self) -> u32 {
        self.min_required_records
    }

    /// Returns the scan threshold.
    ///
    /// Every retired record counts towards this threshold (see
    /// [`scan_strategy`](Self::scan_strategy) for how that count is acted
    /// on). Once it is reached, an attempt is made to reclaim records.
    #[inline]
    pub fn scan_threshold(&self) -> u32 {
        self.scan_threshold
    }

    /// Returns the configured scan strategy.
    #[inline]
    pub fn scan_strategy(&self) -> ScanStrategy {
        self.scan_strategy
    }

    /// Returns the configured abandon strategy.
    #[inline]
    pub fn abandon_strategy(&self) -> AbandonStrategy {
        self.abandon_strategy
    }

    /// Returns the configured region extension policy.
    #[inline]
    pub fn region_extension(&self) -> RegionExtension {
        self.region_extension
    }

    /// Returns the configured cap on total slots a hazard-based registry
    /// ([`crate::schemes::Hp`] / [`crate::schemes::He`]) may allocate.
    ///
    /// `None` (the default) is `dynamic_strategy`: the registry grows by a
    /// fresh node whenever every existing slot is claimed. `Some(k)` is
    /// `static_strategy`: once `k` slots have been allocated in total, a
    /// thread that finds none free must use `try_guard` instead of `guard`.
    #[inline]
    pub fn max_slots(&self) -> Option<usize> {
        self.max_slots
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// ConfigBuilder
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A builder type for gradually initializing a [`Config`].
///
/// This is mainly useful for keeping stability, in case the internal
/// structure of the [`Config`] type changes in the future, e.g. because
/// further parameters are added.
#[derive(Copy, Clone, Debug, Default)]
pub struct ConfigBuilder {
    init_cache: Option<usize>,
    min_required_records: Option<u32>,
    scan_threshold: Option<u32>,
    scan_strategy: Option<ScanStrategy>,
    abandon_strategy: Option<AbandonStrategy>,
    region_extension: Option<RegionExtension>,
    max_slots: Option<usize>,
}

impl ConfigBuilder {
    /// Creates a new [`ConfigBuilder`] with default values.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the initial size of the cache for retired records of each newly
    /// created thread.
    ///
    /// If this is set to e.g. 0, retiring the first record will require the
    /// allocation of memory by the internally used data structure.
    #[inline]
    pub fn init_cache(mut self, init_cache: usize) -> Self {
        self.init_cache = Some(init_cache);
        self
    }

    /// Sets the minimum amount of records that must have been retired by a
    /// thread, before the thread may attempt to reclaim any memory.
    #[inline]
    pub fn min_required_records(mut self, min_required_records: u32) -> Self {
        self.min_required_records = Some(min_required_records);
        self
    }

    /// Sets the scan threshold.
    ///
    /// # Panics
    ///
    /// [`build`](Self::build) panics if this is set to 0.
    #[inline]
    pub fn scan_threshold(mut self, scan_threshold: u32) -> Self {
        self.scan_threshold = Some(scan_threshold);
        self
    }

    /// Sets the scan strategy.
    #[inline]
    pub fn scan_strategy(mut self, scan_strategy: ScanStrategy) -> Self {
        self.scan_strategy = Some(scan_strategy);
        self
    }

    /// Sets the abandon strategy.
    #[inline]
    pub fn abandon_strategy(mut self, abandon_strategy: AbandonStrategy) -> Self {
        self.abandon_strategy = Some(abandon_strategy);
        self
    }

    /// Sets the region extension policy.
    #[inline]
    pub fn region_extension(mut self, region_extension: RegionExtension) -> Self {
        self.region_extension = Some(region_extension);
        self
    }

    /// Bounds the total number of slots a hazard-based registry may
    /// allocate, switching it from `dynamic_strategy` to `static_strategy`.
    ///
    /// Once the cap is reached, [`Hp::guard`](crate::schemes::Hp::guard) and
    /// [`He::guard`](crate::schemes::He::guard) panic if no existing slot can
    /// be reused; callers that want to handle exhaustion should use
    /// `try_guard` instead.
    #[inline]
    pub fn max_slots(mut self, max_slots: usize) -> Self {
        self.max_slots = Some(max_slots);
        self
    }

    /// Consumes the [`ConfigBuilder`] and returns an initialized [`Config`].
    ///
    /// Unspecified parameters are initialized with their default values.
    ///
    /// # Panics
    ///
    /// Panics if an explicit `scan_threshold` of 0 was set.
    #[inline]
    pub fn build(self) -> Config {
        let scan_threshold = self.scan_threshold.unwrap_or(DEFAULT_SCAN_THRESHOLD);
        assert!(scan_threshold > 0, "scan threshold must be greater than 0");
        Config {
            init_cache: self.init_cache.unwrap_or(DEFAULT_INIT_CACHE),
            min_required_records: self.min_required_records.unwrap_or(DEFAULT_MIN_REQUIRED_RECORDS),
            scan_threshold,
            scan_strategy: self.scan_strategy.unwrap_or_default(),
            abandon_strategy: self.abandon_strategy.unwrap_or_default(),
            region_extension: self.region_extension.unwrap_or_default(),
            max_slots: self.max_slots,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.init_cache(), DEFAULT_INIT_CACHE);
        assert_eq!(config.scan_threshold(), DEFAULT_SCAN_THRESHOLD);
        assert_eq!(config.scan_strategy(), ScanStrategy::OpsCount);
        assert_eq!(config.max_slots(), None);
    }

    #[test]
    fn max_slots_can_be_set() {
        let config = ConfigBuilder::new().max_slots(16).build();
        assert_eq!(config.max_slots(), Some(16));
    }

    #[test]
    #[should_panic]
    fn zero_scan_threshold_panics() {
        ConfigBuilder::new().scan_threshold(0).build();
    }

    #[test]
    fn builder_overrides() {
        let config = ConfigBuilder::new()
            .init_cache(4)
            .scan_threshold(16)
            .scan_strategy(ScanStrategy::Debra)
            .abandon_strategy(AbandonStrategy::Abandon)
            .region_extension(RegionExtension::Eager)
            .build();
        assert_eq!(config.init_cache(), 4);
        assert_eq!(config.scan_threshold(), 16);
        assert_eq!(config.scan_strategy(), ScanStrategy::Debra);
        assert_eq!(config.abandon_strategy(), AbandonStrategy::Abandon);
        assert_eq!(config.region_extension(), RegionExtension::Eager);
    }
}
