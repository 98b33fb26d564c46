//! Translated functions, their index and deferred reclamation.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{fence, AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use crate::context::EntryPoint;
use crate::error::JitResult;
use crate::guest::GUEST_PAGE_SIZE;
use crate::memory::JitCode;
use crate::table::{AddressTable, AddressTableLevel};

pub struct TranslatedFunction {
    pub guest_address: u64,
    /// Guest bytes covered, counted from `guest_address`.
    pub guest_size: u64,
    pub instructions: usize,
    code: JitCode,
}

impl TranslatedFunction {
    pub fn new(guest_address: u64, guest_size: u64, instructions: usize, code: JitCode) -> Self {
        Self {
            guest_address,
            guest_size,
            instructions,
            code,
        }
    }

    pub fn host_address(&self) -> usize {
        self.code.as_ptr() as usize
    }

    pub fn host_size(&self) -> usize {
        self.code.len()
    }

    pub fn footprint(&self) -> usize {
        self.code.footprint()
    }

    pub fn entry(&self) -> EntryPoint {
        unsafe { std::mem::transmute::<*const u8, EntryPoint>(self.code.as_ptr()) }
    }

    pub fn overlaps(&self, address: u64, size: u64) -> bool {
        let end = self.guest_address.saturating_add(self.guest_size);
        self.guest_address < address.saturating_add(size) && address < end
    }

    fn pages(&self) -> impl Iterator<Item = u64> {
        let first = self.guest_address / GUEST_PAGE_SIZE;
        let last = self.guest_address.saturating_add(self.guest_size.max(1) - 1) / GUEST_PAGE_SIZE;
        first..=last
    }
}

impl std::fmt::Debug for TranslatedFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranslatedFunction")
            .field("guest_address", &format_args!("{:#x}", self.guest_address))
            .field("guest_size", &self.guest_size)
            .field("code", &self.code)
            .finish()
    }
}

const IDLE: u64 = u64::MAX;

/// Quiescent-state reclamation of retired translations.
///
/// Dispatch loops pin the global epoch before every table lookup. An item
/// retired at epoch `e` is released once no participant is pinned at or
/// below `e`.
pub struct Reclaimer {
    epoch: AtomicU64,
    participants: Mutex<Vec<Weak<AtomicU64>>>,
    retired: Mutex<Vec<(u64, Arc<TranslatedFunction>)>>,
}

pub struct Participant {
    slot: Arc<AtomicU64>,
}

impl Participant {
    pub fn pin(&self, reclaimer: &Reclaimer) {
        self.slot
            .store(reclaimer.epoch.load(Ordering::SeqCst), Ordering::SeqCst);
        fence(Ordering::SeqCst);
    }

    pub fn unpin(&self) {
        self.slot.store(IDLE, Ordering::SeqCst);
    }
}

impl Drop for Participant {
    fn drop(&mut self) {
        self.unpin();
    }
}

impl Default for Reclaimer {
    fn default() -> Self {
        Self::new()
    }
}

impl Reclaimer {
    pub fn new() -> Self {
        Self {
            epoch: AtomicU64::new(0),
            participants: Mutex::new(vec![]),
            retired: Mutex::new(vec![]),
        }
    }

    pub fn register(&self) -> Participant {
        let slot = Arc::new(AtomicU64::new(IDLE));
        if let Ok(mut participants) = self.participants.lock() {
            participants.push(Arc::downgrade(&slot));
        }
        Participant { slot }
    }

    pub fn retire(&self, function: Arc<TranslatedFunction>) {
        let tag = self.epoch.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut retired) = self.retired.lock() {
            retired.push((tag, function));
        }
        self.collect();
    }

    fn oldest_pinned(&self) -> u64 {
        let Ok(mut participants) = self.participants.lock() else {
            return 0;
        };
        participants.retain(|p| p.strong_count() > 0);
        participants
            .iter()
            .filter_map(Weak::upgrade)
            .map(|slot| slot.load(Ordering::SeqCst))
            .min()
            .unwrap_or(IDLE)
    }

    /// Releases every retired item no participant can still be running.
    /// Returns how many were released.
    pub fn collect(&self) -> usize {
        let oldest = self.oldest_pinned();
        let released = {
            let Ok(mut retired) = self.retired.lock() else {
                return 0;
            };
            let (free, keep) = std::mem::take(&mut *retired)
                .into_iter()
                .partition::<Vec<_>, _>(|(tag, _)| *tag < oldest);
            *retired = keep;
            free
        };
        released.len()
    }

    pub fn pending(&self) -> usize {
        self.retired.lock().map(|r| r.len()).unwrap_or(0)
    }
}

/// Index of installed translations by guest address.
pub struct TranslationCache {
    table: AddressTable,
    functions: RwLock<BTreeMap<u64, Arc<TranslatedFunction>>>,
    pages: RwLock<HashMap<u64, usize>>,
    max_span: u64,
    reclaimer: Reclaimer,
    in_flight: Mutex<Vec<Arc<InFlight>>>,
}

/// Guest range read by a translation that has not been published yet.
struct InFlight {
    start: u64,
    end: u64,
    stale: AtomicBool,
}

impl InFlight {
    fn overlaps(&self, start: u64, end: u64) -> bool {
        self.start < end && start < self.end
    }
}

/// Registration of a translation in progress. Invalidations that touch its
/// guest window while it is held make [`TranslationCache::publish`] refuse
/// the result.
pub struct PendingTranslation<'a> {
    cache: &'a TranslationCache,
    range: Arc<InFlight>,
}

impl PendingTranslation<'_> {
    pub fn is_stale(&self) -> bool {
        self.range.stale.load(Ordering::Acquire)
    }
}

impl Drop for PendingTranslation<'_> {
    fn drop(&mut self) {
        let mut in_flight = self
            .cache
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        in_flight.retain(|range| !Arc::ptr_eq(range, &self.range));
    }
}

impl TranslationCache {
    /// `max_span` bounds the guest size of any function that will be
    /// inserted.
    pub fn new(levels: &'static [AddressTableLevel], max_span: u64) -> Self {
        Self {
            table: AddressTable::new(levels),
            functions: RwLock::new(BTreeMap::new()),
            pages: RwLock::new(HashMap::new()),
            max_span,
            reclaimer: Reclaimer::new(),
            in_flight: Mutex::new(vec![]),
        }
    }

    pub fn table(&self) -> &AddressTable {
        &self.table
    }

    pub fn reclaimer(&self) -> &Reclaimer {
        &self.reclaimer
    }

    pub fn lookup(&self, address: u64) -> Option<EntryPoint> {
        self.table
            .lookup(address)
            .map(|entry| unsafe { std::mem::transmute::<usize, EntryPoint>(entry) })
    }

    pub fn get(&self, address: u64) -> Option<Arc<TranslatedFunction>> {
        self.functions.read().ok()?.get(&address).cloned()
    }

    pub fn len(&self) -> usize {
        self.functions.read().map(|f| f.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Publishes a finished translation. A translation already present for
    /// the same address is replaced and retired.
    pub fn insert(&self, function: TranslatedFunction) -> JitResult<Arc<TranslatedFunction>> {
        let mut functions = self
            .functions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        self.install(&mut functions, function)
    }

    /// Registers a translation about to read the guest code at `address`.
    /// Its window spans `max_span` bytes.
    pub fn begin(&self, address: u64) -> PendingTranslation<'_> {
        let range = Arc::new(InFlight {
            start: address,
            end: address.saturating_add(self.max_span),
            stale: AtomicBool::new(false),
        });
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(Arc::clone(&range));
        PendingTranslation { cache: self, range }
    }

    /// Publishes a translation started with [`Self::begin`]. Returns `None`,
    /// dropping the code, if its guest window was invalidated meanwhile.
    pub fn publish(
        &self,
        function: TranslatedFunction,
        pending: PendingTranslation<'_>,
    ) -> JitResult<Option<Arc<TranslatedFunction>>> {
        // Invalidations mark in-flight ranges under this lock.
        let mut functions = self
            .functions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if pending.is_stale() {
            log::debug!(
                "guest code at {:#x} changed during translation",
                function.guest_address
            );
            return Ok(None);
        }
        self.install(&mut functions, function).map(Some)
    }

    fn install(
        &self,
        functions: &mut BTreeMap<u64, Arc<TranslatedFunction>>,
        function: TranslatedFunction,
    ) -> JitResult<Arc<TranslatedFunction>> {
        debug_assert!(function.guest_size <= self.max_span);
        let function = Arc::new(function);
        let address = function.guest_address;

        self.table.install(address, function.host_address())?;
        self.add_pages(&function, 1);
        if let Some(old) = functions.insert(address, Arc::clone(&function)) {
            log::debug!("translation at {address:#x} superseded");
            self.add_pages(&old, -1);
            self.reclaimer.retire(old);
        }
        Ok(function)
    }

    fn has_in_flight(&self, start: u64, end: u64) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .any(|range| range.overlaps(start, end))
    }

    fn mark_in_flight(&self, start: u64, end: u64) {
        let in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for range in in_flight.iter().filter(|range| range.overlaps(start, end)) {
            range.stale.store(true, Ordering::Release);
        }
    }

    fn add_pages(&self, function: &TranslatedFunction, delta: isize) {
        let mut pages = self
            .pages
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for page in function.pages() {
            let count = pages.entry(page).or_default();
            *count = count.saturating_add_signed(delta);
            if *count == 0 {
                pages.remove(&page);
            }
        }
    }

    /// Removes every translation overlapping `[address, address + size)`.
    /// Returns how many were removed.
    pub fn invalidate(&self, address: u64, size: u64) -> usize {
        if size == 0 {
            return 0;
        }
        let mut functions = self
            .functions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let lo = address.saturating_sub(self.max_span);
        let hi = address.saturating_add(size);
        self.mark_in_flight(address, hi);
        let victims = functions
            .range(lo..hi)
            .filter(|(_, f)| f.overlaps(address, size))
            .map(|(&start, _)| start)
            .collect::<Vec<_>>();

        for start in &victims {
            if let Some(function) = functions.remove(start) {
                self.table.reset(*start, function.host_address());
                self.add_pages(&function, -1);
                self.reclaimer.retire(function);
            }
        }
        if !victims.is_empty() {
            log::debug!(
                "invalidated {} translation(s) in {address:#x} (+{size:#x})",
                victims.len()
            );
        }
        victims.len()
    }

    pub fn page_has_code(&self, address: u64) -> bool {
        self.pages
            .read()
            .is_ok_and(|pages| pages.contains_key(&(address / GUEST_PAGE_SIZE)))
    }

    /// Invalidates, page by page, the translated code under a guest write.
    pub fn invalidate_written(&self, address: u64, size: u64) -> usize {
        let first = address / GUEST_PAGE_SIZE;
        let last = (address.saturating_add(size.max(1)) - 1) / GUEST_PAGE_SIZE;

        // Translations still being built have no pages yet. A translation
        // registered after this check reads the bytes already written.
        let start = first * GUEST_PAGE_SIZE;
        let end = (last * GUEST_PAGE_SIZE).saturating_add(GUEST_PAGE_SIZE);
        if self.has_in_flight(start, end) {
            let _functions = self
                .functions
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            self.mark_in_flight(start, end);
        }

        (first..=last)
            .filter(|&page| self.page_has_code(page * GUEST_PAGE_SIZE))
            .map(|page| self.invalidate(page * GUEST_PAGE_SIZE, GUEST_PAGE_SIZE))
            .sum()
    }

    /// Guest entry of the translation whose code contains `host_address`.
    pub fn guest_address_of(&self, host_address: u64) -> Option<u64> {
        let functions = self.functions.read().ok()?;
        functions
            .values()
            .find(|f| {
                let start = f.host_address() as u64;
                host_address >= start && host_address < start + f.host_size() as u64
            })
            .map(|f| f.guest_address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{JitMemory, ProtectionMode};
    use crate::table::LEVELS_64_SPARSE;

    fn function(memory: &Arc<JitMemory>, address: u64, size: u64) -> TranslatedFunction {
        let code = memory.install(&[0xc3; 16]).unwrap();
        TranslatedFunction::new(address, size, (size / 4) as usize, code)
    }

    fn memory() -> Arc<JitMemory> {
        JitMemory::new(1 << 20, ProtectionMode::WriteXorExecute).unwrap()
    }

    #[test]
    fn test_invalidate_only_touches_overlaps() {
        let memory = memory();
        let cache = TranslationCache::new(LEVELS_64_SPARSE, 0x400);
        for start in [0x1000, 0x1100, 0x1200, 0x3000] {
            cache.insert(function(&memory, start, 0x40)).unwrap();
        }

        assert_eq!(cache.invalidate(0x1120, 0x100), 2);
        assert!(cache.lookup(0x1100).is_none());
        assert!(cache.lookup(0x1200).is_none());
        assert!(cache.lookup(0x1000).is_some());
        assert!(cache.lookup(0x3000).is_some());
        // Ends exactly where the next one starts.
        assert_eq!(cache.invalidate(0x1040, 0x1000), 0);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_written_pages_invalidate_whole_page() {
        let memory = memory();
        let cache = TranslationCache::new(LEVELS_64_SPARSE, 0x400);
        cache.insert(function(&memory, 0x2000, 0x10)).unwrap();
        cache.insert(function(&memory, 0x2800, 0x10)).unwrap();
        cache.insert(function(&memory, 0x5000, 0x10)).unwrap();

        assert_eq!(cache.invalidate_written(0x9000, 8), 0);
        assert_eq!(cache.invalidate_written(0x2f00, 8), 2);
        assert!(!cache.page_has_code(0x2000));
        assert!(cache.page_has_code(0x5000));
    }

    #[test]
    fn test_publish_refuses_code_written_meanwhile() {
        let memory = memory();
        let cache = TranslationCache::new(LEVELS_64_SPARSE, 0x400);

        let pending = cache.begin(0x2000);
        // No translation exists yet, so nothing is removed.
        assert_eq!(cache.invalidate_written(0x2100, 4), 0);
        assert!(pending.is_stale());
        assert!(cache
            .publish(function(&memory, 0x2000, 0x40), pending)
            .unwrap()
            .is_none());
        assert!(cache.lookup(0x2000).is_none());
        assert_eq!(memory.bytes_in_use(), 0);

        let pending = cache.begin(0x2000);
        cache.invalidate_written(0x9000, 4);
        cache.invalidate(0x1000, 0x800);
        assert!(!pending.is_stale());
        assert!(cache
            .publish(function(&memory, 0x2000, 0x40), pending)
            .unwrap()
            .is_some());
        assert!(cache.lookup(0x2000).is_some());
    }

    #[test]
    fn test_unmap_marks_pending_translation() {
        let memory = memory();
        let cache = TranslationCache::new(LEVELS_64_SPARSE, 0x400);
        let pending = cache.begin(0x2000);
        cache.invalidate(0x2300, 0x10);
        assert!(cache
            .publish(function(&memory, 0x2000, 0x40), pending)
            .unwrap()
            .is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_pages_at_top_of_address_space() {
        let memory = memory();
        let cache = TranslationCache::new(LEVELS_64_SPARSE, 0x400);
        cache
            .insert(function(&memory, 0xffff_ffff_ffff_fffc, 4))
            .unwrap();
        assert!(cache.page_has_code(0xffff_ffff_ffff_f000));
        assert_eq!(cache.invalidate_written(0xffff_ffff_ffff_fff0, 0x10), 1);
    }

    #[test]
    fn test_retired_code_waits_for_pinned_participants() {
        let memory = memory();
        let cache = TranslationCache::new(LEVELS_64_SPARSE, 0x400);
        cache.insert(function(&memory, 0x1000, 0x10)).unwrap();
        let in_use = memory.bytes_in_use();

        let participant = cache.reclaimer().register();
        participant.pin(cache.reclaimer());
        cache.invalidate(0x1000, 4);
        assert_eq!(cache.reclaimer().pending(), 1);
        assert_eq!(memory.bytes_in_use(), in_use);

        participant.pin(cache.reclaimer());
        assert_eq!(cache.reclaimer().collect(), 1);
        assert_eq!(memory.bytes_in_use(), 0);
    }

    #[test]
    fn test_reinsert_supersedes() {
        let memory = memory();
        let cache = TranslationCache::new(LEVELS_64_SPARSE, 0x400);
        let first = cache.insert(function(&memory, 0x1000, 0x10)).unwrap();
        let second = cache.insert(function(&memory, 0x1000, 0x10)).unwrap();
        assert_eq!(
            cache.table().lookup(0x1000),
            Some(second.host_address())
        );
        assert_ne!(first.host_address(), second.host_address());
        assert_eq!(cache.len(), 1);
    }
}
