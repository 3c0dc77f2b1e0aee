//! Static block shapes and the definition-interning cache.
//!
//! As the host lowers a translated superblock, a [`BlockBuilder`]
//! accumulates the per-instruction addresses and the in-block access
//! slots. The finished shape is interned: structurally identical blocks
//! share one definition index, and only the first sighting emits a BBDEF
//! record. The wire format caps a definition at 255 instructions, so
//! oversized superblocks are split on encode regardless of the host's own
//! block size.

use std::collections::HashMap;
use std::io;

use crate::record::{AccessDir, Word, MAX_BLOCK_INSTRS};

pub use crate::record::{BlockAccess, BlockInstr};

/// The interned static shape of a translated block.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlockShape {
    pub instrs: Vec<BlockInstr>,
    pub accesses: Vec<BlockAccess>,
}

/// Per-definition facts the run streamer needs after interning.
#[derive(Debug, Clone, Copy)]
pub struct DefMeta {
    /// Instructions in the definition; the default live count of a run.
    pub n_instrs: u8,
    /// Access slots in the definition; upper bound on run addresses.
    pub n_accesses: u32,
}

/// Accumulates a block's shape while the host lowers its IR.
#[derive(Debug)]
pub struct BlockBuilder {
    instrs: Vec<BlockInstr>,
    /// Access slots with unsplit instruction indices.
    accesses: Vec<(AccessDir, u8, usize)>,
    trace_instr: bool,
}

impl BlockBuilder {
    pub fn new(trace_instr: bool) -> Self {
        Self {
            instrs: Vec::new(),
            accesses: Vec::new(),
            trace_instr,
        }
    }

    /// Record the next instruction. When instruction tracing is on, the
    /// fetch itself becomes an execute access slot.
    pub fn push_instr(&mut self, addr: Word, size: u8) {
        self.instrs.push(BlockInstr { addr, size });
        if self.trace_instr {
            self.accesses
                .push((AccessDir::Execute, size, self.instrs.len() - 1));
        }
    }

    /// Record a data access performed by the most recent instruction.
    pub fn push_access(&mut self, dir: AccessDir, size: u8) {
        assert!(
            !self.instrs.is_empty(),
            "access lowered before any instruction"
        );
        self.accesses.push((dir, size, self.instrs.len() - 1));
    }

    pub fn is_empty(&self) -> bool {
        self.instrs.is_empty()
    }

    /// Split into wire-sized shapes. Instruction indices are rebased per
    /// split so that `instr_index < len(instrs)` holds in every shape.
    pub fn finish(self) -> Vec<BlockShape> {
        let mut shapes: Vec<BlockShape> = self
            .instrs
            .chunks(MAX_BLOCK_INSTRS)
            .map(|chunk| BlockShape {
                instrs: chunk.to_vec(),
                accesses: Vec::new(),
            })
            .collect();
        for (dir, size, index) in self.accesses {
            let shape = index / MAX_BLOCK_INSTRS;
            shapes[shape].accesses.push(BlockAccess {
                dir,
                size,
                instr_index: (index % MAX_BLOCK_INSTRS) as u8,
            });
        }
        shapes
    }
}

/// Interns block shapes and assigns monotonically increasing definition
/// indices.
#[derive(Debug, Default)]
pub struct BlockCache {
    map: HashMap<BlockShape, Word>,
    metas: Vec<DefMeta>,
}

impl BlockCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up or assign a definition index. `emit` runs exactly once per
    /// new shape, before the index becomes visible, so the BBDEF record
    /// always precedes any run that names it.
    pub fn intern_with<E>(&mut self, shape: BlockShape, mut emit: E) -> io::Result<Word>
    where
        E: FnMut(Word, &BlockShape) -> io::Result<()>,
    {
        if let Some(&index) = self.map.get(&shape) {
            return Ok(index);
        }
        let index = self.metas.len() as Word;
        emit(index, &shape)?;
        self.metas.push(DefMeta {
            n_instrs: shape.instrs.len() as u8,
            n_accesses: shape.accesses.len() as u32,
        });
        self.map.insert(shape, index);
        Ok(index)
    }

    /// Facts about an already-interned definition.
    pub fn meta(&self, index: Word) -> DefMeta {
        self.metas[index as usize]
    }

    /// Definitions assigned so far.
    pub fn len(&self) -> usize {
        self.metas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metas.is_empty()
    }

    /// Drop the interning table when the host discards its translations.
    /// Indices already emitted stay canonical, so the metadata survives.
    pub fn discard(&mut self) {
        self.map.clear();
        self.map.shrink_to_fit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_attaches_accesses_to_current_instruction() {
        let mut builder = BlockBuilder::new(false);
        builder.push_instr(0x400100, 4);
        builder.push_access(AccessDir::Read, 8);
        builder.push_instr(0x400104, 4);
        builder.push_access(AccessDir::Write, 4);
        let shapes = builder.finish();
        assert_eq!(shapes.len(), 1);
        assert_eq!(shapes[0].accesses[0].instr_index, 0);
        assert_eq!(shapes[0].accesses[1].instr_index, 1);
    }

    #[test]
    fn instruction_tracing_adds_execute_slots() {
        let mut builder = BlockBuilder::new(true);
        builder.push_instr(0x400100, 4);
        builder.push_access(AccessDir::Read, 8);
        let shapes = builder.finish();
        assert_eq!(shapes[0].accesses.len(), 2);
        assert_eq!(shapes[0].accesses[0].dir, AccessDir::Execute);
        assert_eq!(shapes[0].accesses[0].size, 4);
        assert_eq!(shapes[0].accesses[1].dir, AccessDir::Read);
    }

    #[test]
    fn oversized_blocks_split_with_rebased_indices() {
        let mut builder = BlockBuilder::new(false);
        for i in 0..300u64 {
            builder.push_instr(0x400000 + i * 4, 4);
        }
        builder.push_access(AccessDir::Write, 8); // instruction 299
        let shapes = builder.finish();
        assert_eq!(shapes.len(), 2);
        assert_eq!(shapes[0].instrs.len(), 255);
        assert_eq!(shapes[1].instrs.len(), 45);
        assert!(shapes[0].accesses.is_empty());
        assert_eq!(shapes[1].accesses[0].instr_index, 44);
    }

    #[test]
    fn interning_emits_once_per_shape() {
        let mut cache = BlockCache::new();
        let shape = BlockShape {
            instrs: vec![BlockInstr { addr: 0x400100, size: 4 }],
            accesses: vec![],
        };
        let mut emitted = 0;
        let first = cache
            .intern_with(shape.clone(), |_, _| {
                emitted += 1;
                Ok(())
            })
            .unwrap();
        let second = cache
            .intern_with(shape, |_, _| {
                emitted += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(emitted, 1);
    }

    #[test]
    fn discard_keeps_indices_canonical() {
        let mut cache = BlockCache::new();
        let shape = BlockShape {
            instrs: vec![BlockInstr { addr: 0x400100, size: 4 }],
            accesses: vec![],
        };
        let first = cache.intern_with(shape.clone(), |_, _| Ok(())).unwrap();
        cache.discard();
        let second = cache.intern_with(shape, |_, _| Ok(())).unwrap();
        assert_eq!(first, 0);
        assert_eq!(second, 1);
        assert_eq!(cache.meta(first).n_instrs, 1);
    }
}
