//! Address spaces with batched updates and published flat views.
//!
//! Mappings are staged per address space and keyed by their owner. Every change happens inside a
//! batch (`begin`/`commit`, nestable); a change made outside a batch is wrapped in one
//! implicitly. Only the outermost `commit` re-renders the flat views, publishes them and notifies
//! listeners, so an observer never sees a half-applied set of mappings.
//!
//! Published views are immutable `Arc<FlatView>` snapshots behind their own lock. DMA-side
//! readers hold a [`FlatViewReader`] and never need access to the fabric itself.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use tracing::{trace, warn};

use crate::DeviceId;

/// Aliases nest once per bridge level; this bounds a malformed alias chain.
const MAX_ALIAS_DEPTH: usize = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AddressSpaceId(u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressSpaceKind {
    Memory,
    Io,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BridgeWindow {
    Io,
    Memory,
    Prefetch,
}

/// Identifies who installed a mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MappingKey {
    Bar { device: DeviceId, region: usize },
    Vga { device: DeviceId, index: usize },
    Window { bridge: DeviceId, window: BridgeWindow },
    BridgeVga { bridge: DeviceId, index: usize },
    External(u32),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MappingTarget {
    /// A BAR or ROM region of a function.
    Region { device: DeviceId, region: usize },
    /// A legacy VGA range of a function.
    Vga { device: DeviceId, index: usize },
    /// `[offset, offset + size)` of another address space.
    Alias { space: AddressSpaceId, offset: u64 },
    /// Platform-provided memory (RAM, ROM, MMIO outside PCI).
    External(u32),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Mapping {
    pub base: u64,
    pub size: u64,
    /// Higher priority wins where mappings overlap; among equals the newest wins.
    pub priority: i32,
    pub target: MappingTarget,
}

impl Mapping {
    pub fn last(&self) -> u64 {
        self.base + (self.size - 1)
    }
}

/// Terminal target of a flattened range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlatTarget {
    Region { device: DeviceId, region: usize },
    Vga { device: DeviceId, index: usize },
    External(u32),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FlatRange {
    pub start: u64,
    pub size: u64,
    pub target: FlatTarget,
    /// Offset into the target where `start` lands.
    pub offset: u64,
}

impl FlatRange {
    fn end(&self) -> u128 {
        u128::from(self.start) + u128::from(self.size)
    }

    fn clip(&self, from: u128, to: u128) -> Self {
        Self {
            start: from as u64,
            size: (to - from) as u64,
            target: self.target,
            offset: self.offset + (from - u128::from(self.start)) as u64,
        }
    }
}

/// Non-overlapping, sorted view of what an address space decodes to.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FlatView {
    ranges: Vec<FlatRange>,
}

impl FlatView {
    pub fn ranges(&self) -> &[FlatRange] {
        &self.ranges
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Resolves `addr` to its target and the offset within that target.
    pub fn lookup(&self, addr: u64) -> Option<(FlatTarget, u64)> {
        let idx = self.ranges.partition_point(|r| r.start <= addr);
        let range = self.ranges.get(idx.checked_sub(1)?)?;
        if u128::from(addr) < range.end() {
            Some((range.target, range.offset + (addr - range.start)))
        } else {
            None
        }
    }

    fn paint(&mut self, new: FlatRange) {
        let new_start = u128::from(new.start);
        let new_end = new.end();
        let mut ranges = Vec::with_capacity(self.ranges.len() + 2);
        for range in self.ranges.drain(..) {
            let end = range.end();
            let start = u128::from(range.start);
            if end <= new_start || start >= new_end {
                ranges.push(range);
                continue;
            }
            if start < new_start {
                ranges.push(range.clip(start, new_start));
            }
            if end > new_end {
                ranges.push(range.clip(new_end, end));
            }
        }
        ranges.push(new);
        ranges.sort_by_key(|r| r.start);
        self.ranges = ranges;
    }
}

/// Cheap handle for reading the latest published view from another context.
#[derive(Clone, Debug)]
pub struct FlatViewReader {
    view: Arc<RwLock<Arc<FlatView>>>,
}

impl FlatViewReader {
    pub fn load(&self) -> Arc<FlatView> {
        let guard = self.view.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    pub fn lookup(&self, addr: u64) -> Option<(FlatTarget, u64)> {
        self.load().lookup(addr)
    }
}

/// Observer notified once per committed batch for each address space whose view changed.
pub trait AddressSpaceListener: Send {
    fn committed(&mut self, space: AddressSpaceId, name: &str, view: &FlatView);
}

#[derive(Debug, Clone)]
struct StagedMapping {
    mapping: Mapping,
    seq: u64,
}

struct AddressSpace {
    name: String,
    kind: AddressSpaceKind,
    mappings: BTreeMap<MappingKey, StagedMapping>,
    published: Arc<RwLock<Arc<FlatView>>>,
}

#[derive(Default)]
pub struct AddressSpaces {
    spaces: BTreeMap<AddressSpaceId, AddressSpace>,
    listeners: Vec<Box<dyn AddressSpaceListener>>,
    next_id: u32,
    seq: u64,
    depth: u32,
    dirty: bool,
    commits: u64,
}

impl AddressSpaces {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&mut self, name: impl Into<String>, kind: AddressSpaceKind) -> AddressSpaceId {
        let id = AddressSpaceId(self.next_id);
        self.next_id += 1;
        self.spaces.insert(
            id,
            AddressSpace {
                name: name.into(),
                kind,
                mappings: BTreeMap::new(),
                published: Arc::new(RwLock::new(Arc::new(FlatView::default()))),
            },
        );
        id
    }

    /// Drops an address space. Aliases pointing at it resolve to nothing from the next commit.
    pub fn destroy(&mut self, id: AddressSpaceId) {
        if self.spaces.remove(&id).is_some() {
            self.touch();
        }
    }

    pub fn name(&self, id: AddressSpaceId) -> &str {
        self.spaces.get(&id).map_or("<destroyed>", |space| space.name.as_str())
    }

    pub fn kind(&self, id: AddressSpaceId) -> Option<AddressSpaceKind> {
        self.spaces.get(&id).map(|space| space.kind)
    }

    pub fn add_listener(&mut self, listener: Box<dyn AddressSpaceListener>) {
        self.listeners.push(listener);
    }

    pub fn begin(&mut self) {
        self.depth += 1;
    }

    pub fn commit(&mut self) {
        assert!(self.depth > 0, "address space commit without begin");
        self.depth -= 1;
        if self.depth == 0 && self.dirty {
            self.publish();
        }
    }

    /// Number of batches that were published.
    pub fn commit_count(&self) -> u64 {
        self.commits
    }

    /// Installs `mapping` under `key`, replacing any previous mapping with the same key.
    pub fn add(&mut self, space: AddressSpaceId, key: MappingKey, mapping: Mapping) {
        assert!(mapping.size > 0, "empty mapping {key:?}");
        let seq = self.seq;
        self.seq += 1;
        let Some(target) = self.spaces.get_mut(&space) else {
            warn!(?key, "mapping added to a destroyed address space");
            return;
        };
        trace!(space = %target.name, ?key, base = mapping.base, size = mapping.size, "map");
        target.mappings.insert(key, StagedMapping { mapping, seq });
        self.touch();
    }

    pub fn remove(&mut self, space: AddressSpaceId, key: MappingKey) -> Option<Mapping> {
        let removed = self.spaces.get_mut(&space)?.mappings.remove(&key)?;
        trace!(space = %self.name(space), ?key, "unmap");
        self.touch();
        Some(removed.mapping)
    }

    pub fn get(&self, space: AddressSpaceId, key: MappingKey) -> Option<Mapping> {
        self.spaces
            .get(&space)?
            .mappings
            .get(&key)
            .map(|staged| staged.mapping)
    }

    pub fn mappings(&self, space: AddressSpaceId) -> Vec<(MappingKey, Mapping)> {
        self.spaces.get(&space).map_or_else(Vec::new, |space| {
            space
                .mappings
                .iter()
                .map(|(key, staged)| (*key, staged.mapping))
                .collect()
        })
    }

    /// Latest published view of `space`.
    pub fn view(&self, space: AddressSpaceId) -> Arc<FlatView> {
        self.reader(space)
            .map(|reader| reader.load())
            .unwrap_or_default()
    }

    pub fn reader(&self, space: AddressSpaceId) -> Option<FlatViewReader> {
        self.spaces.get(&space).map(|space| FlatViewReader {
            view: Arc::clone(&space.published),
        })
    }

    fn touch(&mut self) {
        self.dirty = true;
        if self.depth == 0 {
            self.publish();
        }
    }

    fn publish(&mut self) {
        self.dirty = false;
        self.commits += 1;

        let rendered: Vec<(AddressSpaceId, FlatView)> = self
            .spaces
            .keys()
            .map(|id| (*id, self.render(*id, 0)))
            .collect();

        for (id, view) in rendered {
            let Some(space) = self.spaces.get(&id) else {
                continue;
            };
            let mut published = space.published.write().unwrap_or_else(|e| e.into_inner());
            if **published == view {
                continue;
            }
            *published = Arc::new(view);
            let view = Arc::clone(&published);
            drop(published);

            for listener in &mut self.listeners {
                listener.committed(id, &space.name, &view);
            }
        }
    }

    fn render(&self, id: AddressSpaceId, depth: usize) -> FlatView {
        let mut view = FlatView::default();
        let Some(space) = self.spaces.get(&id) else {
            return view;
        };

        let mut staged: Vec<&StagedMapping> = space.mappings.values().collect();
        staged.sort_by_key(|staged| (staged.mapping.priority, staged.seq));

        for StagedMapping { mapping, .. } in staged {
            match mapping.target {
                MappingTarget::Alias { space: inner, offset } => {
                    if depth >= MAX_ALIAS_DEPTH {
                        warn!(space = %space.name, "alias nesting too deep; ignoring");
                        continue;
                    }
                    let window_start = u128::from(offset);
                    let window_end = window_start + u128::from(mapping.size);
                    for range in self.render(inner, depth + 1).ranges {
                        let from = window_start.max(u128::from(range.start));
                        let to = window_end.min(range.end());
                        if from >= to {
                            continue;
                        }
                        let start = u128::from(mapping.base) + (from - window_start);
                        if start + (to - from) > u128::from(u64::MAX) + 1 {
                            continue;
                        }
                        let mut clipped = range.clip(from, to);
                        clipped.start = start as u64;
                        view.paint(clipped);
                    }
                }
                target => {
                    let target = match target {
                        MappingTarget::Region { device, region } => {
                            FlatTarget::Region { device, region }
                        }
                        MappingTarget::Vga { device, index } => FlatTarget::Vga { device, index },
                        MappingTarget::External(id) => FlatTarget::External(id),
                        MappingTarget::Alias { .. } => unreachable!(),
                    };
                    view.paint(FlatRange {
                        start: mapping.base,
                        size: mapping.size,
                        target,
                        offset: 0,
                    });
                }
            }
        }
        view
    }
}
