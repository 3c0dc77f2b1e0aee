//! Debug-info facade: code addresses to human-readable origin strings.
//!
//! The trace announces each code object with its text base VMA; actual
//! symbol and line lookup is an external capability behind
//! [`SymbolReader`]. With no reader installed, addresses format as bare
//! hex.

use std::collections::BTreeMap;

use crate::record::Word;

/// Result of a symbol lookup.
#[derive(Debug, Clone, Default)]
pub struct SymbolInfo {
    pub function: Option<String>,
    pub file: Option<String>,
    pub line: Option<u32>,
}

/// External symbol-resolution capability (debug readers, symbol servers).
pub trait SymbolReader {
    /// Resolve `addr` within the object loaded from `filename` at
    /// `text_avma`.
    fn nearest_line(&self, filename: &str, text_avma: Word, addr: Word) -> Option<SymbolInfo>;
}

/// Registry of announced code objects plus the optional reader.
#[derive(Default)]
pub struct DebugInfo {
    /// text base VMA -> filename, ascending so a point query finds the
    /// nearest object at or below an address.
    objects: BTreeMap<Word, String>,
    reader: Option<Box<dyn SymbolReader>>,
}

impl DebugInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_reader(&mut self, reader: Box<dyn SymbolReader>) {
        self.reader = Some(reader);
    }

    /// Register an object from a TEXT_AVMA record. Re-announcement of
    /// the same base replaces the filename (the object was remapped).
    pub fn add_object(&mut self, text_avma: Word, filename: String) {
        self.objects.insert(text_avma, filename);
    }

    /// Number of announced objects.
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// The object whose text interval plausibly contains `addr`.
    fn object_for(&self, addr: Word) -> Option<(Word, &str)> {
        self.objects
            .range(..=addr)
            .next_back()
            .map(|(&avma, name)| (avma, name.as_str()))
    }

    /// Format an address as `0xADDR [in SYMBOL] (basename[:line])`.
    pub fn resolve(&self, addr: Word) -> String {
        let mut label = format!("{addr:#x}");
        let Some(reader) = &self.reader else {
            return label;
        };
        let Some((avma, filename)) = self.object_for(addr) else {
            return label;
        };
        let Some(info) = reader.nearest_line(filename, avma, addr) else {
            return label;
        };
        if let Some(function) = &info.function {
            if !function.is_empty() {
                label.push_str(" in ");
                label.push_str(function);
            }
        }
        match &info.file {
            Some(file) => {
                let basename = file.rsplit('/').next().unwrap_or(file);
                label.push_str(" (");
                label.push_str(basename);
                if let Some(line) = info.line {
                    label.push_str(&format!(":{line}"));
                }
                label.push(')');
            }
            None => {
                label.push_str(" (");
                label.push_str(filename);
                label.push(')');
            }
        }
        label
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedReader;

    impl SymbolReader for FixedReader {
        fn nearest_line(&self, _filename: &str, text_avma: Word, addr: Word) -> Option<SymbolInfo> {
            (addr - text_avma < 0x1000).then(|| SymbolInfo {
                function: Some("sort".to_string()),
                file: Some("/src/demo/sorts.c".to_string()),
                line: Some(42),
            })
        }
    }

    #[test]
    fn bare_hex_without_a_reader() {
        let mut info = DebugInfo::new();
        info.add_object(0x400000, "/bin/demo".to_string());
        assert_eq!(info.resolve(0x400123), "0x400123");
    }

    #[test]
    fn full_format_with_reader() {
        let mut info = DebugInfo::new();
        info.add_object(0x400000, "/bin/demo".to_string());
        info.set_reader(Box::new(FixedReader));
        assert_eq!(info.resolve(0x400123), "0x400123 in sort (sorts.c:42)");
    }

    #[test]
    fn lookup_picks_nearest_object_below() {
        let mut info = DebugInfo::new();
        info.add_object(0x400000, "/bin/demo".to_string());
        info.add_object(0x7f000000, "/lib/libc.so".to_string());
        info.set_reader(Box::new(FixedReader));
        // Out of the fixed reader's faked range: falls back to bare hex.
        assert_eq!(info.resolve(0x7f002000), "0x7f002000");
        assert_eq!(info.resolve(0x7f000010), "0x7f000010 in sort (sorts.c:42)");
    }
}
