//! The named workload catalog.
//!
//! A workload is a named bundle of option strings; external callers
//! register them before jobs start and the front end looks them up by
//! exact name when it sees `workload=<name>`. The core stores strings
//! only; parsing stays with the argument collaborator.

use parking_lot::Mutex;

#[derive(Debug, Clone)]
pub struct Workload {
    pub name: String,
    pub description: String,
    pub options: String,
}

#[derive(Debug, Default)]
pub struct WorkloadCatalog {
    entries: Mutex<Vec<Workload>>,
}

impl WorkloadCatalog {
    pub fn new() -> WorkloadCatalog {
        WorkloadCatalog::default()
    }

    /// Catalog pre-seeded with the stock workloads.
    pub fn with_standard() -> WorkloadCatalog {
        let catalog = WorkloadCatalog::new();
        catalog.register(
            "sanity",
            "quick single-file validation pass",
            "limit=64k bs=8k passes=1 pattern=iot prefix='%d@%h'",
        );
        catalog.register(
            "aging",
            "random overwrites with inline read-after-write",
            "iotype=random bs=random min=4k max=256k enable=raw runtime=1h",
        );
        catalog.register(
            "mirror-verify",
            "mirror pair write/read compare",
            "bs=16k limit=1m passes=3",
        );
        catalog.register(
            "reverse-sweep",
            "reverse sequential sweep with full verification",
            "iodir=reverse bs=64k passes=2 pattern=iot",
        );
        catalog
    }

    /// Register a workload; names are unique, the first wins.
    pub fn register(&self, name: &str, description: &str, options: &str) -> bool {
        let mut entries = self.entries.lock();
        if entries.iter().any(|w| w.name == name) {
            return false;
        }
        entries.push(Workload {
            name: name.to_string(),
            description: description.to_string(),
            options: options.to_string(),
        });
        true
    }

    /// Exact-name lookup.
    pub fn find(&self, name: &str) -> Option<Workload> {
        self.entries.lock().iter().find(|w| w.name == name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.lock().iter().map(|w| w.name.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_find() {
        let catalog = WorkloadCatalog::new();
        assert!(catalog.register("burn-in", "overnight soak", "runtime=8h"));
        let found = catalog.find("burn-in").unwrap();
        assert_eq!(found.options, "runtime=8h");
        assert!(catalog.find("burn").is_none());
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let catalog = WorkloadCatalog::new();
        assert!(catalog.register("x", "first", "a=1"));
        assert!(!catalog.register("x", "second", "a=2"));
        assert_eq!(catalog.find("x").unwrap().description, "first");
    }

    #[test]
    fn standard_catalog_is_populated() {
        let catalog = WorkloadCatalog::with_standard();
        assert!(catalog.find("sanity").is_some());
        assert!(catalog.names().len() >= 4);
    }
}
