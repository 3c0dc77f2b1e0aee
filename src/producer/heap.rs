//! Heap-block lifecycle tracking.
//!
//! The host routes the guest's allocator entry points (malloc, the C++
//! operators, memalign, calloc, realloc, free, malloc_usable_size) through
//! this tracker. Every live block carries its declared size, the host
//! allocator's actual usable size, and a bounded allocation stack; block
//! births and deaths are written to the trace as MALLOC_BLOCK and
//! FREE_BLOCK records. Client programs may also declare their own
//! pool-carved blocks via the malloc-like/free-like requests, in which
//! case the usable size equals the declared size.

use std::collections::HashMap;
use std::io::{self, Write};

use crate::producer::host::Host;
use crate::record::{RecordKind, TraceWriter, Word, WORD_SIZE};

#[derive(Debug)]
struct BlockMeta {
    size: Word,
    usable_size: Word,
    stack: Vec<Word>,
}

/// Tracks live heap blocks and emits their lifecycle records.
#[derive(Debug)]
pub struct HeapTracker {
    table: HashMap<Word, BlockMeta>,
    stack_depth: usize,
    stack_scratch: Vec<Word>,
}

impl HeapTracker {
    pub fn new(stack_depth: usize) -> Self {
        Self {
            table: HashMap::new(),
            stack_depth,
            stack_scratch: Vec::new(),
        }
    }

    /// Live blocks currently tracked.
    pub fn live_blocks(&self) -> usize {
        self.table.len()
    }

    pub fn malloc<W: Write>(
        &mut self,
        host: &mut dyn Host,
        writer: &mut TraceWriter<W>,
        size: Word,
    ) -> io::Result<Option<Word>> {
        let align = host.alignment();
        let Some(addr) = host.cli_malloc(align, size) else {
            return Ok(None);
        };
        self.add_block(host, writer, addr, size, false)?;
        Ok(Some(addr))
    }

    pub fn calloc<W: Write>(
        &mut self,
        host: &mut dyn Host,
        writer: &mut TraceWriter<W>,
        count: Word,
        elem_size: Word,
    ) -> io::Result<Option<Word>> {
        let Some(size) = count.checked_mul(elem_size) else {
            return Ok(None);
        };
        let align = host.alignment();
        let Some(addr) = host.cli_malloc(align, size) else {
            return Ok(None);
        };
        host.zero_guest(addr, size);
        self.add_block(host, writer, addr, size, false)?;
        Ok(Some(addr))
    }

    pub fn memalign<W: Write>(
        &mut self,
        host: &mut dyn Host,
        writer: &mut TraceWriter<W>,
        align: Word,
        size: Word,
    ) -> io::Result<Option<Word>> {
        let Some(addr) = host.cli_malloc(align, size) else {
            return Ok(None);
        };
        self.add_block(host, writer, addr, size, false)?;
        Ok(Some(addr))
    }

    pub fn free<W: Write>(
        &mut self,
        host: &mut dyn Host,
        writer: &mut TraceWriter<W>,
        addr: Word,
    ) -> io::Result<()> {
        if self.remove_block(writer, addr)? {
            host.cli_free(addr);
        }
        Ok(())
    }

    /// Reallocation. If the new size still fits the allocator's usable
    /// size the block stays in place; the trace sees a free and a fresh
    /// allocation either way, so block lifetimes stay well-nested.
    pub fn realloc<W: Write>(
        &mut self,
        host: &mut dyn Host,
        writer: &mut TraceWriter<W>,
        addr: Word,
        new_size: Word,
    ) -> io::Result<Option<Word>> {
        let Some(mut meta) = self.table.remove(&addr) else {
            // Bogus realloc; the host wrapper handles the corner cases.
            return Ok(None);
        };

        if new_size <= meta.usable_size {
            self.log_remove(writer, addr)?;
            meta.size = new_size;
            host.stack_trace(&mut self.stack_scratch, self.stack_depth);
            meta.stack.clear();
            meta.stack.extend_from_slice(&self.stack_scratch);
            self.log_add(writer, addr, &meta)?;
            self.table.insert(addr, meta);
            return Ok(Some(addr));
        }

        let align = host.alignment();
        let Some(new_addr) = host.cli_malloc(align, new_size) else {
            // Allocation failed; the block stays as it was.
            self.table.insert(addr, meta);
            return Ok(None);
        };
        host.copy_guest(new_addr, addr, meta.size);
        self.log_remove(writer, addr)?;
        host.cli_free(addr);
        self.add_block(host, writer, new_addr, new_size, false)?;
        Ok(Some(new_addr))
    }

    /// The usable size reported to the guest is the one captured at
    /// allocation time.
    pub fn usable_size(&self, addr: Word) -> Word {
        self.table.get(&addr).map_or(0, |meta| meta.usable_size)
    }

    /// Client-declared allocation (MALLOCLIKE_BLOCK). The declared size
    /// is all we know, so it doubles as the usable size.
    pub fn malloc_like<W: Write>(
        &mut self,
        host: &mut dyn Host,
        writer: &mut TraceWriter<W>,
        addr: Word,
        size: Word,
    ) -> io::Result<()> {
        self.add_block(host, writer, addr, size, true)
    }

    /// Client-declared free (FREELIKE_BLOCK).
    pub fn free_like<W: Write>(
        &mut self,
        writer: &mut TraceWriter<W>,
        addr: Word,
    ) -> io::Result<()> {
        self.remove_block(writer, addr)?;
        Ok(())
    }

    fn add_block<W: Write>(
        &mut self,
        host: &mut dyn Host,
        writer: &mut TraceWriter<W>,
        addr: Word,
        size: Word,
        custom: bool,
    ) -> io::Result<()> {
        host.stack_trace(&mut self.stack_scratch, self.stack_depth);
        let meta = BlockMeta {
            size,
            usable_size: if custom { size } else { host.usable_size(addr) },
            stack: self.stack_scratch.clone(),
        };
        self.log_add(writer, addr, &meta)?;
        self.table.insert(addr, meta);
        Ok(())
    }

    /// Returns whether the block was found.
    fn remove_block<W: Write>(
        &mut self,
        writer: &mut TraceWriter<W>,
        addr: Word,
    ) -> io::Result<bool> {
        if self.table.remove(&addr).is_none() {
            return Ok(false);
        }
        self.log_remove(writer, addr)?;
        Ok(true)
    }

    fn log_add<W: Write>(
        &mut self,
        writer: &mut TraceWriter<W>,
        addr: Word,
        meta: &BlockMeta,
    ) -> io::Result<()> {
        let len = ((meta.stack.len() + 3) * WORD_SIZE) as u64;
        writer.begin_record(RecordKind::MallocBlock, len)?;
        writer.put_word(addr)?;
        writer.put_word(meta.size)?;
        writer.put_word(meta.stack.len() as Word)?;
        for &ip in &meta.stack {
            writer.put_word(ip)?;
        }
        Ok(())
    }

    fn log_remove<W: Write>(
        &mut self,
        writer: &mut TraceWriter<W>,
        addr: Word,
    ) -> io::Result<()> {
        writer.begin_record(RecordKind::FreeBlock, WORD_SIZE as u64)?;
        writer.put_word(addr)
    }
}
