//! Post-load summary of a trace.

use serde::Serialize;

use crate::viewer::TraceData;

/// Counts gathered while loading, serialisable for the `--json` output.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadSummary {
    /// Records read from the stream, header included.
    pub records: u64,
    /// Records discarded for content errors.
    pub skipped_records: u64,
    /// Block definitions seen.
    pub definitions: usize,
    /// Contexts seen.
    pub contexts: usize,
    /// Runs retained after filtering.
    pub retained_runs: usize,
    /// Accesses retained after filtering.
    pub retained_accesses: usize,
    /// Total bytes touched by retained accesses.
    pub access_bytes: u64,
    /// Instructions executed across the whole stream.
    pub total_instructions: u64,
    /// Accesses observed across the whole stream, filtered or not.
    pub total_accesses: u64,
    /// Heap blocks allocated over the trace lifetime.
    pub heap_blocks: usize,
    /// Heap blocks still live at end of trace.
    pub live_heap_blocks: usize,
    /// Distinct pages touched by retained accesses.
    pub pages: usize,
    /// Code objects announced.
    pub code_objects: usize,
}

impl TraceData {
    /// Summarise the loaded model.
    pub fn summary(&self) -> LoadSummary {
        LoadSummary {
            records: self.records_read,
            skipped_records: self.records_skipped,
            definitions: self.store.definition_count(),
            contexts: self.store.context_count(),
            retained_runs: self.store.runs().len(),
            retained_accesses: self.store.access_count(),
            access_bytes: self.store.access_bytes(),
            total_instructions: self.total_instructions,
            total_accesses: self.total_accesses,
            heap_blocks: self.store.heap_blocks().len(),
            live_heap_blocks: self.live_heap_blocks,
            pages: self.page_map.page_count(),
            code_objects: self.debug_info.object_count(),
        }
    }
}
