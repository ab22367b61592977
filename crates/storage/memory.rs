use std::collections::BTreeMap;
use std::fmt;

/// Hierarchical report of approximate in-memory usage.
///
/// Each node accounts for the bytes held directly by one component;
/// children cover nested components. The report is a diagnostic aid, not
/// an exact allocator measurement.
#[derive(Clone, Debug, Default)]
pub struct MemoryFootprint {
    bytes: u64,
    children: BTreeMap<String, MemoryFootprint>,
}

impl MemoryFootprint {
    pub fn new(bytes: u64) -> Self {
        Self {
            bytes,
            children: BTreeMap::new(),
        }
    }

    pub fn with_child(mut self, name: impl Into<String>, child: MemoryFootprint) -> Self {
        self.add_child(name, child);
        self
    }

    pub fn add_child(&mut self, name: impl Into<String>, child: MemoryFootprint) {
        self.children.insert(name.into(), child);
    }

    /// Bytes held directly by this node.
    pub fn own_bytes(&self) -> u64 {
        self.bytes
    }

    /// Bytes held by this node and all of its children.
    pub fn total(&self) -> u64 {
        self.bytes + self.children.values().map(|c| c.total()).sum::<u64>()
    }

    fn fmt_indented(&self, f: &mut fmt::Formatter<'_>, name: &str, depth: usize) -> fmt::Result {
        writeln!(
            f,
            "{:indent$}{name}: {} B",
            "",
            self.total(),
            indent = depth * 2
        )?;
        for (child_name, child) in &self.children {
            child.fmt_indented(f, child_name, depth + 1)?;
        }
        Ok(())
    }
}

impl fmt::Display for MemoryFootprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_indented(f, "total", 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn total_sums_children() {
        let report = MemoryFootprint::new(10)
            .with_child("a", MemoryFootprint::new(5))
            .with_child("b", MemoryFootprint::new(7).with_child("c", MemoryFootprint::new(1)));
        assert_eq!(report.total(), 23);
        assert_eq!(report.own_bytes(), 10);
    }

    #[test]
    fn display_renders_every_node() {
        let report = MemoryFootprint::new(1).with_child("index", MemoryFootprint::new(2));
        let text = format!("{report}");
        assert!(text.contains("total: 3 B"));
        assert!(text.contains("index: 2 B"));
    }
}
