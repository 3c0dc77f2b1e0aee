//! Trace ingestion and query core.
//!
//! [`load`] drives the record codec over a trace stream, expands run
//! records against the definition and context tables, applies the
//! event/range/heap filters, and lands surviving accesses in the
//! pool-backed columnar store. The result is a read-only [`TraceData`]
//! that the query side consults.

pub mod debuginfo;
pub mod pool;
pub mod query;
pub mod rangemap;
pub mod remap;
pub mod store;
pub mod summary;

pub use debuginfo::{DebugInfo, SymbolInfo, SymbolReader};
pub use query::{AccessHit, NearestQuery};
pub use remap::{page_down, PageMap, PAGE_SIZE};
pub use store::{AccessStore, DecodedAccess, HeapBlock, StoredRun};
pub use summary::LoadSummary;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::Read;
use std::mem;

use tracing::{debug, warn};

use crate::error::{ContentError, TraceError};
use crate::record::{
    AccessDir, BlockAccess, BlockInstr, Record, RecordKind, RecordReader, Word, ENDIAN_LITTLE,
    MAGIC, TRACE_VERSION, WORD_SIZE,
};
use crate::viewer::rangemap::RangeMap;
use crate::viewer::store::{BlockDef, Context, RunShape, NO_BLOCK};

/// Filters chosen on the command line. Empty sets select everything.
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Keep accesses only while one of these events is active.
    pub events: BTreeSet<String>,
    /// Keep accesses only inside one of these tracked ranges.
    pub ranges: BTreeSet<String>,
    /// Keep accesses only inside live heap blocks.
    pub malloc_only: bool,
}

/// The loaded, immutable trace model.
pub struct TraceData {
    pub store: AccessStore,
    pub page_map: PageMap,
    pub debug_info: DebugInfo,
    pub(crate) records_read: u64,
    pub(crate) records_skipped: u64,
    pub(crate) total_instructions: u64,
    pub(crate) total_accesses: u64,
    pub(crate) live_heap_blocks: usize,
}

/// Load a trace stream into a queryable model.
pub fn load<R: Read>(input: R, options: &LoadOptions) -> Result<TraceData, TraceError> {
    let mut reader = RecordReader::new(input);

    let mut header = reader.next_record()?.ok_or(TraceError::MissingHeader)?;
    if header.kind_byte() != RecordKind::Header as u8 {
        return Err(TraceError::MissingHeader);
    }
    check_header(&mut header)?;

    let mut loader = Loader::new(options);
    loader.records += 1;
    while let Some(mut record) = reader.next_record()? {
        loader.records += 1;
        let outcome = loader
            .dispatch(&mut record)
            .and_then(|()| record.finish());
        if let Err(err) = outcome {
            warn!(kind = record.kind_byte(), %err, "skipping malformed record");
            loader.skipped += 1;
        }
    }
    Ok(loader.into_trace_data())
}

fn check_header(record: &mut Record<'_>) -> Result<(), TraceError> {
    let magic = record
        .bytes(MAGIC.len())
        .map_err(TraceError::Header)?;
    if magic != MAGIC.as_slice() {
        return Err(TraceError::BadMagic);
    }
    let version = record.byte().map_err(TraceError::Header)?;
    if version != TRACE_VERSION {
        warn!(expected = TRACE_VERSION, got = version, "version mismatch, continuing");
    }
    let endian = record.byte().map_err(TraceError::Header)?;
    if endian != ENDIAN_LITTLE {
        return Err(TraceError::EndianMismatch(endian));
    }
    let wordsize = record.byte().map_err(TraceError::Header)?;
    if wordsize as usize != WORD_SIZE {
        return Err(TraceError::WordSizeMismatch {
            expected: WORD_SIZE as u8,
            got: wordsize,
        });
    }
    Ok(())
}

struct Loader<'a> {
    options: &'a LoadOptions,
    store: AccessStore,
    debug_info: DebugInfo,
    /// Live heap blocks: interval -> index into block storage.
    live_blocks: RangeMap<u32>,
    /// START_EVENTs from the chosen set with no matching END_EVENT.
    active_events: HashMap<String, usize>,
    /// TRACK_RANGEs from the chosen set with no matching UNTRACK_RANGE.
    active_ranges: BTreeMap<(Word, Word), usize>,
    /// Page bases touched by retained accesses.
    pages: BTreeSet<Word>,
    iseq: u64,
    dseq: u64,
    /// Instruction address of the last legacy INSTR record.
    last_instr_addr: Word,
    seen_batched: bool,
    seen_legacy: bool,
    warned_mixed: bool,
    records: u64,
    skipped: u64,
    total_accesses: u64,
    addr_scratch: Vec<Word>,
    block_scratch: Vec<u32>,
}

impl<'a> Loader<'a> {
    fn new(options: &'a LoadOptions) -> Self {
        Self {
            options,
            store: AccessStore::new(),
            debug_info: DebugInfo::new(),
            live_blocks: RangeMap::new(),
            active_events: HashMap::new(),
            active_ranges: BTreeMap::new(),
            pages: BTreeSet::new(),
            iseq: 0,
            dseq: 0,
            last_instr_addr: 0,
            seen_batched: false,
            seen_legacy: false,
            warned_mixed: false,
            records: 0,
            skipped: 0,
            total_accesses: 0,
            addr_scratch: Vec::new(),
            block_scratch: Vec::new(),
        }
    }

    fn dispatch(&mut self, record: &mut Record<'_>) -> Result<(), ContentError> {
        match RecordKind::try_from(record.kind_byte())? {
            RecordKind::Header => Err(ContentError::DuplicateHeader),
            RecordKind::Read => self.on_legacy(record, AccessDir::Read),
            RecordKind::Write => self.on_legacy(record, AccessDir::Write),
            RecordKind::Instr => self.on_legacy(record, AccessDir::Execute),
            RecordKind::TrackRange => self.on_track_range(record),
            RecordKind::UntrackRange => self.on_untrack_range(record),
            RecordKind::StartEvent => self.on_event(record, true),
            RecordKind::EndEvent => self.on_event(record, false),
            RecordKind::TextAvma => self.on_text_avma(record),
            RecordKind::MallocBlock => self.on_malloc_block(record),
            RecordKind::FreeBlock => self.on_free_block(record),
            RecordKind::BbDef => self.on_bb_def(record),
            RecordKind::Context => self.on_context(record),
            RecordKind::BbRun => self.on_bb_run(record),
        }
    }

    fn note_legacy(&mut self) {
        self.seen_legacy = true;
        if self.seen_batched && !self.warned_mixed {
            warn!("trace mixes batched runs with legacy single-access records");
            self.warned_mixed = true;
        }
    }

    fn note_batched(&mut self) {
        self.seen_batched = true;
        if self.seen_legacy && !self.warned_mixed {
            warn!("trace mixes batched runs with legacy single-access records");
            self.warned_mixed = true;
        }
    }

    fn on_legacy(&mut self, record: &mut Record<'_>, dir: AccessDir) -> Result<(), ContentError> {
        let size = record.byte()?;
        let addr = record.word()?;
        self.note_legacy();

        let (instr_addr, n_instrs) = match dir {
            AccessDir::Execute => {
                self.last_instr_addr = addr;
                (addr, 1u8)
            }
            _ => (self.last_instr_addr, 0u8),
        };
        let iseq_start = self.iseq;
        let dseq_start = self.dseq;
        self.total_accesses += 1;
        match dir {
            AccessDir::Execute => self.iseq += 1,
            _ => self.dseq += 1,
        }

        if self.keep_access(addr, size) {
            let block = self.block_at(addr);
            self.pages.insert(page_down(addr));
            self.store.push_run(
                iseq_start,
                dseq_start,
                n_instrs,
                RunShape::Legacy {
                    dir,
                    size,
                    instr_addr,
                },
                &[addr],
                &[block],
            );
        }
        Ok(())
    }

    fn on_track_range(&mut self, record: &mut Record<'_>) -> Result<(), ContentError> {
        let addr = record.word()?;
        let size = record.word()?;
        let _type_name = record.string()?;
        let label = record.string()?;

        // A tracked range landing on a live block names that block.
        if let Some((_, _, &index)) = self.live_blocks.find(addr) {
            self.store.heap_blocks[index as usize].label = Some(label.clone());
        }

        if self.options.ranges.contains(&label) {
            *self.active_ranges.entry((addr, size)).or_insert(0) += 1;
        }
        Ok(())
    }

    fn on_untrack_range(&mut self, record: &mut Record<'_>) -> Result<(), ContentError> {
        let addr = record.word()?;
        let size = record.word()?;
        if let Some(count) = self.active_ranges.get_mut(&(addr, size)) {
            *count -= 1;
            if *count == 0 {
                self.active_ranges.remove(&(addr, size));
            }
        }
        Ok(())
    }

    fn on_event(&mut self, record: &mut Record<'_>, start: bool) -> Result<(), ContentError> {
        let label = record.string()?;
        if !self.options.events.contains(&label) {
            return Ok(());
        }
        if start {
            *self.active_events.entry(label).or_insert(0) += 1;
        } else if let Some(count) = self.active_events.get_mut(&label) {
            *count -= 1;
            if *count == 0 {
                self.active_events.remove(&label);
            }
        }
        Ok(())
    }

    fn on_text_avma(&mut self, record: &mut Record<'_>) -> Result<(), ContentError> {
        let avma = record.word()?;
        let filename = record.string()?;
        self.debug_info.add_object(avma, filename);
        Ok(())
    }

    fn on_malloc_block(&mut self, record: &mut Record<'_>) -> Result<(), ContentError> {
        let addr = record.word()?;
        let size = record.word()?;
        let n_ips = record.word()? as usize;
        let mut stack = Vec::with_capacity(n_ips.min(64));
        for _ in 0..n_ips {
            stack.push(record.word()?);
        }

        let index = self.store.heap_blocks.len() as u32;
        self.store.heap_blocks.push(HeapBlock {
            base: addr,
            size,
            stack,
            label: None,
        });

        // Live blocks must never overlap; an intersecting allocation is an
        // upstream bug and the last writer wins.
        let hi = addr.saturating_add(size);
        while let Err(overlap) = self.live_blocks.insert(addr, hi, index) {
            warn!(%overlap, "allocation overlaps a live block, evicting the old one");
            self.live_blocks.erase_by_start(overlap.old_lo);
        }
        Ok(())
    }

    fn on_free_block(&mut self, record: &mut Record<'_>) -> Result<(), ContentError> {
        let addr = record.word()?;
        if self.live_blocks.erase_by_start(addr).is_none() {
            debug!("free of an unknown block at {addr:#x}");
        }
        Ok(())
    }

    fn on_bb_def(&mut self, record: &mut Record<'_>) -> Result<(), ContentError> {
        let n_instrs = record.byte()?;
        if n_instrs == 0 {
            return Err(ContentError::EmptyDefinition);
        }
        let n_accesses = record.word()? as usize;

        let mut instrs = Vec::with_capacity(n_instrs as usize);
        for _ in 0..n_instrs {
            let addr = record.word()?;
            let size = record.byte()?;
            instrs.push(BlockInstr { addr, size });
        }
        let mut accesses = Vec::with_capacity(n_accesses.min(1024));
        for _ in 0..n_accesses {
            let dir_byte = record.byte()?;
            let dir = AccessDir::from_wire(dir_byte)
                .ok_or(ContentError::BadDirection(dir_byte))?;
            let size = record.byte()?;
            let instr_index = record.byte()?;
            if instr_index >= n_instrs {
                return Err(ContentError::AccessIndexOutOfRange {
                    index: instr_index,
                    count: n_instrs,
                });
            }
            accesses.push(BlockAccess {
                dir,
                size,
                instr_index,
            });
        }
        self.store.defs.push(BlockDef { instrs, accesses });
        Ok(())
    }

    fn on_context(&mut self, record: &mut Record<'_>) -> Result<(), ContentError> {
        let def = record.word()?;
        if def as usize >= self.store.defs.len() {
            return Err(ContentError::UnknownDefinition(def));
        }
        let n_stack = record.byte()?;
        if n_stack == 0 {
            return Err(ContentError::EmptyStack);
        }
        let mut stack = Vec::with_capacity(n_stack as usize);
        for _ in 0..n_stack {
            stack.push(record.word()?);
        }
        self.store.contexts.push(Context { def, stack });
        Ok(())
    }

    fn on_bb_run(&mut self, record: &mut Record<'_>) -> Result<(), ContentError> {
        let context = record.word()?;
        let Some(ctx) = self.store.contexts.get(context as usize) else {
            return Err(ContentError::UnknownContext(context));
        };
        let def_index = ctx.def as usize;
        let n_instrs = record.byte()?;

        let remaining = record.remaining();
        if remaining % WORD_SIZE != 0 {
            return Err(ContentError::RaggedAddresses(remaining as u64));
        }
        let n_addrs = remaining / WORD_SIZE;
        let slots = self.store.defs[def_index].accesses.len();
        if n_addrs > slots {
            return Err(ContentError::TooManyAddresses {
                got: n_addrs,
                slots,
            });
        }

        let mut addrs = mem::take(&mut self.addr_scratch);
        addrs.clear();
        for _ in 0..n_addrs {
            addrs.push(record.word()?);
        }

        self.note_batched();
        let iseq_start = self.iseq;
        let dseq_start = self.dseq;
        self.iseq += u64::from(n_instrs);
        self.dseq += n_addrs as u64;
        self.total_accesses += n_addrs as u64;

        let mut blocks = mem::take(&mut self.block_scratch);
        blocks.clear();
        let mut any_kept = false;
        for slot in 0..n_addrs {
            let addr = addrs[slot];
            let size = self.store.defs[def_index].accesses[slot].size;
            if self.keep_access(addr, size) {
                any_kept = true;
                self.pages.insert(page_down(addr));
                blocks.push(self.block_at(addr));
            } else {
                // Zero keeps the slot position so later slots still line
                // up with their definition entries.
                addrs[slot] = 0;
                blocks.push(NO_BLOCK);
            }
        }

        if any_kept {
            self.store.push_run(
                iseq_start,
                dseq_start,
                n_instrs,
                RunShape::Block {
                    context: context as u32,
                },
                &addrs,
                &blocks,
            );
        }

        self.addr_scratch = addrs;
        self.block_scratch = blocks;
        Ok(())
    }

    /// Filter predicate of the load phase, in selection order: events
    /// gate everything, then tracked ranges, then the heap restriction.
    fn keep_access(&self, addr: Word, size: u8) -> bool {
        let selected = if !self.options.events.is_empty() && self.active_events.is_empty() {
            false
        } else if !self.options.ranges.is_empty() {
            let end = addr.saturating_add(u64::from(size));
            self.active_ranges
                .keys()
                .any(|&(base, range_size)| end > base && addr < base.saturating_add(range_size))
        } else {
            true
        };
        if !selected {
            return false;
        }
        if self.options.malloc_only && self.live_blocks.find(addr).is_none() {
            return false;
        }
        true
    }

    fn block_at(&self, addr: Word) -> u32 {
        self.live_blocks
            .find(addr)
            .map_or(NO_BLOCK, |(_, _, &index)| index)
    }

    fn into_trace_data(mut self) -> TraceData {
        self.store.shrink_to_fit();
        TraceData {
            page_map: PageMap::build(&self.pages),
            live_heap_blocks: self.live_blocks.len(),
            store: self.store,
            debug_info: self.debug_info,
            records_read: self.records,
            records_skipped: self.skipped,
            total_instructions: self.iseq,
            total_accesses: self.total_accesses,
        }
    }
}
