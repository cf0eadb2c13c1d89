use tracing::debug;

/// Opaque resolved driver entry point.
///
/// The dispatch layer never calls through this value itself; it only proves
/// resolution succeeded and forwards it to the (out-of-scope) dispatch
/// tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcAddress(pub u64);

/// Source of raw driver entry points (a loaded driver library, a mock in
/// tests).
pub trait ProcAddressTable {
    fn lookup(&self, name: &str) -> Option<ProcAddress>;
}

/// Vendor suffixes tried when the unsuffixed name does not resolve. Whichever
/// variant resolves is assumed ABI-compatible with the unsuffixed signature.
pub const VENDOR_SUFFIXES: [&str; 3] = ["OES", "EXT", "ARB"];

/// Resolve `name` against the driver, trying the unsuffixed name first and
/// then each vendor-suffixed variant in order.
pub fn resolve_entry_point(table: &dyn ProcAddressTable, name: &str) -> Option<ProcAddress> {
    if let Some(addr) = table.lookup(name) {
        return Some(addr);
    }
    for suffix in VENDOR_SUFFIXES {
        let candidate = format!("{name}{suffix}");
        if let Some(addr) = table.lookup(&candidate) {
            debug!(name, %candidate, "resolved entry point via vendor suffix");
            return Some(addr);
        }
    }
    None
}
