//! Trace instrumentation core.
//!
//! The producer is a single value owned by the host's tool handle and
//! threaded through every instrumentation callback. The host serialises
//! all calls, so the caches, the pending run, and the output buffer are
//! plain mutable state.
//!
//! Per dynamic block execution the helpers fire in a fixed pattern:
//! [`trace_bb_start`](Producer::trace_bb_start) at block entry,
//! [`trace_access`](Producer::trace_access) per memory access,
//! [`trace_update_instrs`](Producer::trace_update_instrs) before each
//! side exit. The pending run is emitted lazily at the next block entry
//! (or at shutdown), when its address count is final.

pub mod block;
pub mod context;
pub mod heap;
pub mod host;

pub use block::{BlockAccess, BlockBuilder, BlockCache, BlockInstr, BlockShape};
pub use context::ContextCache;
pub use heap::HeapTracker;
pub use host::{CodeObject, Host};

use std::collections::HashSet;
use std::io::{self, Write};

use crate::record::{RecordKind, TraceWriter, Word, WORD_SIZE};

/// Longest type/label string written for a client request.
const REQUEST_STR_TRUNC: usize = 64;

/// Longest code-object filename written in a TEXT_AVMA record.
const FILENAME_TRUNC: usize = 128;

/// Default bound on captured call stacks.
pub const DEFAULT_STACK_DEPTH: usize = 8;

/// Producer tunables, surfaced by the host's command-line glue.
#[derive(Debug, Clone)]
pub struct ProducerOptions {
    /// Record instruction fetches as execute accesses.
    pub trace_instr: bool,
    /// Frames captured for context and allocation stacks.
    pub stack_depth: usize,
}

impl Default for ProducerOptions {
    fn default() -> Self {
        Self {
            trace_instr: true,
            stack_depth: DEFAULT_STACK_DEPTH,
        }
    }
}

/// Expand an output-file template: `%p` becomes the process id, `%%` a
/// literal percent. Default template is `datagrind.out.%p`.
pub fn expand_out_file(template: &str, pid: u32) -> String {
    let mut out = String::with_capacity(template.len() + 8);
    let mut chars = template.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('p') => out.push_str(&pid.to_string()),
            Some('%') => out.push('%'),
            Some(other) => {
                out.push('%');
                out.push(other);
            }
            None => out.push('%'),
        }
    }
    out
}

/// In-guest messages forwarded through the host's client-request ABI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientRequest<'a> {
    /// Declare a typed, labelled address range.
    TrackRange {
        addr: Word,
        size: Word,
        type_name: &'a str,
        label: &'a str,
    },
    /// Undeclare a range.
    UntrackRange { addr: Word, size: Word },
    /// Open a scoped event.
    StartEvent { label: &'a str },
    /// Close a scoped event.
    EndEvent { label: &'a str },
    /// Declare a client-managed allocation.
    MallocLike { addr: Word, size: Word },
    /// Declare a client-managed free.
    FreeLike { addr: Word },
}

#[derive(Debug)]
struct PendingRun {
    active: bool,
    context: Word,
    n_instrs: u8,
    max_accesses: u32,
    addrs: Vec<Word>,
}

/// The instrumentation-side driver: caches, heap tracker, run streamer,
/// and the buffered record writer.
pub struct Producer<W: Write> {
    writer: TraceWriter<W>,
    blocks: BlockCache,
    contexts: ContextCache,
    heap: HeapTracker,
    options: ProducerOptions,
    pending: PendingRun,
    stack_scratch: Vec<Word>,
    object_scratch: Vec<CodeObject>,
    seen_objects: HashSet<(Word, String)>,
    debuginfo_dirty: bool,
}

impl<W: Write> Producer<W> {
    /// Open a producer over `sink`; the header record is written
    /// immediately.
    pub fn new(sink: W, options: ProducerOptions) -> io::Result<Self> {
        Ok(Self {
            writer: TraceWriter::new(sink)?,
            blocks: BlockCache::new(),
            contexts: ContextCache::new(),
            heap: HeapTracker::new(options.stack_depth),
            options,
            pending: PendingRun {
                active: false,
                context: 0,
                n_instrs: 0,
                max_accesses: 0,
                addrs: Vec::new(),
            },
            stack_scratch: Vec::new(),
            object_scratch: Vec::new(),
            seen_objects: HashSet::new(),
            debuginfo_dirty: true,
        })
    }

    /// A builder configured with this producer's options, for the host's
    /// IR-lowering pass.
    pub fn block_builder(&self) -> BlockBuilder {
        BlockBuilder::new(self.options.trace_instr)
    }

    /// The host's new-segment callback: executable mappings may carry
    /// fresh code objects to announce.
    pub fn note_new_segment(&mut self, executable: bool) {
        if executable {
            self.debuginfo_dirty = true;
        }
    }

    /// Intern a freshly translated block, emitting TEXT_AVMA records for
    /// any new code objects first and a BBDEF per unseen shape. Returns
    /// the definition indices in block order, one per 255-instruction
    /// split.
    pub fn instrument_block(
        &mut self,
        host: &mut dyn Host,
        builder: BlockBuilder,
    ) -> io::Result<Vec<Word>> {
        self.announce_code_objects(host)?;

        let shapes = builder.finish();
        let mut defs = Vec::with_capacity(shapes.len());
        for shape in shapes {
            assert!(!shape.instrs.is_empty(), "translated block with no instructions");
            let writer = &mut self.writer;
            let def = self.blocks.intern_with(shape, |_, shape| {
                let len = 1
                    + WORD_SIZE
                    + shape.instrs.len() * (WORD_SIZE + 1)
                    + shape.accesses.len() * 3;
                writer.begin_record(RecordKind::BbDef, len as u64)?;
                writer.put_u8(shape.instrs.len() as u8)?;
                writer.put_word(shape.accesses.len() as Word)?;
                for instr in &shape.instrs {
                    writer.put_word(instr.addr)?;
                    writer.put_u8(instr.size)?;
                }
                for access in &shape.accesses {
                    writer.put_u8(access.dir.to_wire())?;
                    writer.put_u8(access.size)?;
                    writer.put_u8(access.instr_index)?;
                }
                Ok(())
            })?;
            defs.push(def);
        }
        Ok(defs)
    }

    /// Block-entry helper: emit the previous run, capture a stack,
    /// intern the context, and arm a fresh pending run.
    pub fn trace_bb_start(&mut self, host: &mut dyn Host, def: Word) -> io::Result<()> {
        self.flush_pending()?;

        host.stack_trace(&mut self.stack_scratch, self.options.stack_depth);
        assert!(
            !self.stack_scratch.is_empty(),
            "host produced an empty stack at block entry"
        );
        let writer = &mut self.writer;
        let context = self
            .contexts
            .intern_with(def, &self.stack_scratch, |_, def, stack| {
                let len = WORD_SIZE + 1 + stack.len() * WORD_SIZE;
                writer.begin_record(RecordKind::Context, len as u64)?;
                writer.put_word(def)?;
                writer.put_u8(stack.len() as u8)?;
                for &ip in stack {
                    writer.put_word(ip)?;
                }
                Ok(())
            })?;

        let meta = self.blocks.meta(def);
        self.pending.active = true;
        self.pending.context = context;
        self.pending.n_instrs = meta.n_instrs;
        self.pending.max_accesses = meta.n_accesses;
        self.pending.addrs.clear();
        Ok(())
    }

    /// Access helper: append one concrete address to the pending run.
    /// Guarded accesses simply never call this when the guard is false;
    /// slot identity is positional.
    pub fn trace_access(&mut self, addr: Word) {
        assert!(self.pending.active, "access traced outside a block run");
        assert!(
            self.pending.addrs.len() < self.pending.max_accesses as usize,
            "more accesses than the block definition declares"
        );
        self.pending.addrs.push(addr);
    }

    /// Side-exit helper: stamp the live instruction count. The host
    /// injects one call before every exit edge; block entry resets the
    /// count to the full definition length for the fall-through case.
    pub fn trace_update_instrs(&mut self, n_instrs: u8) {
        assert!(self.pending.active, "instruction count stamped outside a run");
        self.pending.n_instrs = n_instrs;
    }

    fn flush_pending(&mut self) -> io::Result<()> {
        if !self.pending.active {
            return Ok(());
        }
        let len = (WORD_SIZE + 1 + WORD_SIZE * self.pending.addrs.len()) as u64;
        self.writer.begin_record(RecordKind::BbRun, len)?;
        self.writer.put_word(self.pending.context)?;
        self.writer.put_u8(self.pending.n_instrs)?;
        for &addr in &self.pending.addrs {
            self.writer.put_word(addr)?;
        }
        self.pending.active = false;
        self.pending.addrs.clear();
        Ok(())
    }

    fn announce_code_objects(&mut self, host: &mut dyn Host) -> io::Result<()> {
        if !self.debuginfo_dirty {
            return Ok(());
        }
        self.object_scratch.clear();
        host.code_objects(&mut self.object_scratch);
        for object in &self.object_scratch {
            let key = (object.text_avma, object.filename.clone());
            if !self.seen_objects.insert(key) {
                continue;
            }
            let name = object.filename.as_bytes();
            let name = &name[..name.len().min(FILENAME_TRUNC)];
            let len = (WORD_SIZE + name.len() + 1) as u64;
            self.writer.begin_record(RecordKind::TextAvma, len)?;
            self.writer.put_word(object.text_avma)?;
            self.writer.put_str(name)?;
        }
        self.debuginfo_dirty = false;
        Ok(())
    }

    /// Dispatch an in-guest client request.
    pub fn client_request(
        &mut self,
        host: &mut dyn Host,
        request: ClientRequest<'_>,
    ) -> io::Result<()> {
        match request {
            ClientRequest::TrackRange {
                addr,
                size,
                type_name,
                label,
            } => {
                let type_name = truncate(type_name);
                let label = truncate(label);
                let len = (2 * WORD_SIZE + type_name.len() + label.len() + 2) as u64;
                self.writer.begin_record(RecordKind::TrackRange, len)?;
                self.writer.put_word(addr)?;
                self.writer.put_word(size)?;
                self.writer.put_str(type_name)?;
                self.writer.put_str(label)
            }
            ClientRequest::UntrackRange { addr, size } => {
                self.writer
                    .begin_record(RecordKind::UntrackRange, 2 * WORD_SIZE as u64)?;
                self.writer.put_word(addr)?;
                self.writer.put_word(size)
            }
            ClientRequest::StartEvent { label } => self.emit_event(RecordKind::StartEvent, label),
            ClientRequest::EndEvent { label } => self.emit_event(RecordKind::EndEvent, label),
            ClientRequest::MallocLike { addr, size } => {
                self.heap.malloc_like(host, &mut self.writer, addr, size)
            }
            ClientRequest::FreeLike { addr } => self.heap.free_like(&mut self.writer, addr),
        }
    }

    fn emit_event(&mut self, kind: RecordKind, label: &str) -> io::Result<()> {
        let label = truncate(label);
        self.writer.begin_record(kind, (label.len() + 1) as u64)?;
        self.writer.put_str(label)
    }

    /// Allocator intercepts, forwarded to the heap tracker. `malloc`
    /// also services the C++ `new` and `new[]` replacements.
    pub fn malloc(&mut self, host: &mut dyn Host, size: Word) -> io::Result<Option<Word>> {
        self.heap.malloc(host, &mut self.writer, size)
    }

    pub fn calloc(
        &mut self,
        host: &mut dyn Host,
        count: Word,
        elem_size: Word,
    ) -> io::Result<Option<Word>> {
        self.heap.calloc(host, &mut self.writer, count, elem_size)
    }

    pub fn memalign(
        &mut self,
        host: &mut dyn Host,
        align: Word,
        size: Word,
    ) -> io::Result<Option<Word>> {
        self.heap.memalign(host, &mut self.writer, align, size)
    }

    /// Also services `delete` and `delete[]`.
    pub fn free(&mut self, host: &mut dyn Host, addr: Word) -> io::Result<()> {
        self.heap.free(host, &mut self.writer, addr)
    }

    pub fn realloc(
        &mut self,
        host: &mut dyn Host,
        addr: Word,
        new_size: Word,
    ) -> io::Result<Option<Word>> {
        self.heap.realloc(host, &mut self.writer, addr, new_size)
    }

    pub fn malloc_usable_size(&self, addr: Word) -> Word {
        self.heap.usable_size(addr)
    }

    /// The host discarded its translations; release the interning tables.
    /// Indices already written to the trace stay canonical.
    pub fn discard_translations(&mut self) {
        self.blocks.discard();
        self.contexts.discard();
    }

    /// Guest-shutdown finaliser: emit the pending run, flush the output
    /// buffer, and hand back the sink.
    pub fn finish(mut self) -> io::Result<W> {
        self.flush_pending()?;
        self.writer.close()
    }
}

fn truncate(s: &str) -> &[u8] {
    let bytes = s.as_bytes();
    &bytes[..bytes.len().min(REQUEST_STR_TRUNC)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_file_template_expands_pid() {
        assert_eq!(expand_out_file("datagrind.out.%p", 1234), "datagrind.out.1234");
        assert_eq!(expand_out_file("plain.out", 1), "plain.out");
        assert_eq!(expand_out_file("a%%b", 1), "a%b");
        assert_eq!(expand_out_file("x%q", 1), "x%q");
    }
}
