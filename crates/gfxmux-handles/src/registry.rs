use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use gfxmux_snapshot::{ReadLeExt, SnapshotError, WriteLeExt};
use tracing::warn;

use crate::{BoxedHandle, HandleError, HostHandle, ObjectType};

/// First boxed value handed out. Leaves 0 (the APIs' null handle) and a
/// window of small values permanently unmappable.
pub const FIRST_BOXED_ID: u64 = 0x1000;

// Snapshots are untrusted input; bound the record count before allocating.
const MAX_SNAPSHOT_RECORDS: u32 = 1 << 24;

#[derive(Debug, Default)]
struct TypeTable {
    /// boxed value -> host value.
    by_boxed: HashMap<u64, u64>,
    /// host value -> boxed value (idempotent boxing).
    by_host: HashMap<u64, u64>,
}

/// Bidirectional host↔boxed translation, one table per [`ObjectType`].
///
/// Shared by every render thread in the session; all access goes through the
/// short-lived per-type table locks, never blocking on driver work.
#[derive(Debug)]
pub struct HandleRegistry {
    tables: [Mutex<TypeTable>; ObjectType::COUNT],
    next_boxed: AtomicU64,
}

impl Default for HandleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self {
            tables: std::array::from_fn(|_| Mutex::new(TypeTable::default())),
            next_boxed: AtomicU64::new(FIRST_BOXED_ID),
        }
    }

    fn table(&self, object_type: ObjectType) -> std::sync::MutexGuard<'_, TypeTable> {
        self.tables[object_type.index()]
            .lock()
            .expect("handle table poisoned")
    }

    fn allocate_boxed(&self) -> u64 {
        self.next_boxed.fetch_add(1, Ordering::Relaxed)
    }

    /// Box a batch of host handles, one output per input, order preserved.
    ///
    /// Boxing is idempotent for a live host handle: boxing the same value
    /// again returns the existing boxed value instead of minting a new one.
    pub fn box_handles(&self, object_type: ObjectType, hosts: &[HostHandle]) -> Vec<BoxedHandle> {
        let mut table = self.table(object_type);
        hosts
            .iter()
            .map(|host| {
                if let Some(&existing) = table.by_host.get(&host.0) {
                    return BoxedHandle(existing);
                }
                let boxed = self.allocate_boxed();
                table.by_boxed.insert(boxed, host.0);
                table.by_host.insert(host.0, boxed);
                BoxedHandle(boxed)
            })
            .collect()
    }

    pub fn box_handle(&self, object_type: ObjectType, host: HostHandle) -> BoxedHandle {
        self.box_handles(object_type, &[host])[0]
    }

    /// Translate a batch of boxed handles back to host handles.
    ///
    /// Fails on the first value that is unknown under `object_type`: either
    /// never boxed, already released, or boxed under a different type (a raw
    /// value collision across types must not validate). No partial results.
    pub fn unbox_handles(
        &self,
        object_type: ObjectType,
        boxed: &[BoxedHandle],
    ) -> Result<Vec<HostHandle>, HandleError> {
        let table = self.table(object_type);
        boxed
            .iter()
            .map(|b| {
                table
                    .by_boxed
                    .get(&b.0)
                    .map(|&host| HostHandle(host))
                    .ok_or(HandleError::InvalidHandle {
                        object_type,
                        value: b.0,
                    })
            })
            .collect()
    }

    pub fn unbox_handle(
        &self,
        object_type: ObjectType,
        boxed: BoxedHandle,
    ) -> Result<HostHandle, HandleError> {
        Ok(self.unbox_handles(object_type, &[boxed])?[0])
    }

    /// Remove mappings by boxed value. Unknown values are a no-op, and since
    /// boxed ids are never reused, a double release can only miss.
    pub fn release_boxed(&self, object_type: ObjectType, boxed: &[BoxedHandle]) {
        let mut table = self.table(object_type);
        for b in boxed {
            if let Some(host) = table.by_boxed.remove(&b.0) {
                table.by_host.remove(&host);
            }
        }
    }

    /// Remove mappings by host value. Unknown values are a no-op.
    pub fn release_host(&self, object_type: ObjectType, hosts: &[HostHandle]) {
        let mut table = self.table(object_type);
        for host in hosts {
            if let Some(boxed) = table.by_host.remove(&host.0) {
                table.by_boxed.remove(&boxed);
            }
        }
    }

    pub fn live_count(&self, object_type: ObjectType) -> usize {
        self.table(object_type).by_boxed.len()
    }

    pub fn total_live_count(&self) -> usize {
        ObjectType::ALL
            .iter()
            .map(|&ty| self.live_count(ty))
            .sum()
    }

    /// Register an exact `(boxed, host)` pair, used when rebuilding tables
    /// from a snapshot. A boxed value already bound to a different host is
    /// the `DuplicateRegistration` consistency fault; the existing mapping
    /// wins.
    fn register_mapping(
        &self,
        object_type: ObjectType,
        boxed: u64,
        host: u64,
    ) -> Result<(), HandleError> {
        let mut table = self.table(object_type);
        match table.by_boxed.get(&boxed) {
            Some(&existing) if existing != host => Err(HandleError::DuplicateRegistration {
                object_type,
                boxed,
                existing,
                host,
            }),
            Some(_) => Ok(()),
            None => {
                table.by_boxed.insert(boxed, host);
                table.by_host.insert(host, boxed);
                Ok(())
            }
        }
    }

    /// Serialize the allocator cursor and every live mapping record.
    pub fn encode<W: Write>(&self, w: &mut W) -> Result<(), SnapshotError> {
        w.write_u64_le(self.next_boxed.load(Ordering::Relaxed))?;

        let mut records: Vec<(u8, u64, u64)> = Vec::new();
        for ty in ObjectType::ALL {
            let table = self.table(ty);
            for (&boxed, &host) in &table.by_boxed {
                records.push((ty.tag(), boxed, host));
            }
        }
        // Deterministic output regardless of hash order.
        records.sort_unstable();

        let count: u32 = records
            .len()
            .try_into()
            .map_err(|_| SnapshotError::Corrupt("too many handle records"))?;
        w.write_u32_le(count)?;
        for (tag, boxed, host) in records {
            w.write_u8(tag)?;
            w.write_u64_le(boxed)?;
            w.write_u64_le(host)?;
        }
        Ok(())
    }

    /// Rebuild a registry from a snapshot payload.
    pub fn decode<R: Read>(r: &mut R) -> Result<Self, SnapshotError> {
        let registry = HandleRegistry::new();
        registry.load(r)?;
        Ok(registry)
    }

    /// Replace this registry's state from a snapshot payload.
    ///
    /// The allocator cursor is restored before any record is replayed, and
    /// must sit above every persisted boxed value, otherwise a post-restore
    /// allocation could collide with a live mapping.
    pub fn load<R: Read>(&self, r: &mut R) -> Result<(), SnapshotError> {
        let next_boxed = r.read_u64_le()?;
        let count = r.read_u32_le()?;
        if count > MAX_SNAPSHOT_RECORDS {
            return Err(SnapshotError::Corrupt("handle record count too large"));
        }

        for ty in ObjectType::ALL {
            let mut table = self.table(ty);
            table.by_boxed.clear();
            table.by_host.clear();
        }
        self.next_boxed.store(next_boxed, Ordering::Relaxed);

        for _ in 0..count {
            let tag = r.read_u8()?;
            let boxed = r.read_u64_le()?;
            let host = r.read_u64_le()?;

            let Some(ty) = ObjectType::from_tag(tag) else {
                // Record from a newer writer; fixed-size, safe to skip.
                warn!(tag, boxed, "skipping handle record with unknown object type");
                continue;
            };
            if boxed >= next_boxed {
                return Err(SnapshotError::Corrupt("boxed-id cursor behind live mapping"));
            }
            if let Err(err) = self.register_mapping(ty, boxed, host) {
                // Keep the first mapping; losing the duplicate is the
                // recoverable outcome.
                warn!(%err, "snapshot replayed a duplicate handle registration");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boxing_is_idempotent_per_live_host_handle() {
        let registry = HandleRegistry::new();
        let first = registry.box_handle(ObjectType::Image, HostHandle(0xAB));
        let second = registry.box_handle(ObjectType::Image, HostHandle(0xAB));
        assert_eq!(first, second);
        assert_eq!(registry.live_count(ObjectType::Image), 1);
    }

    #[test]
    fn released_boxed_ids_are_not_recycled() {
        let registry = HandleRegistry::new();
        let first = registry.box_handle(ObjectType::Buffer, HostHandle(1));
        registry.release_boxed(ObjectType::Buffer, &[first]);
        let second = registry.box_handle(ObjectType::Buffer, HostHandle(1));
        assert_ne!(first, second);
    }

    #[test]
    fn double_release_does_not_disturb_other_mappings() {
        let registry = HandleRegistry::new();
        let a = registry.box_handle(ObjectType::Buffer, HostHandle(1));
        registry.release_boxed(ObjectType::Buffer, &[a]);
        let b = registry.box_handle(ObjectType::Buffer, HostHandle(2));
        registry.release_boxed(ObjectType::Buffer, &[a]);
        assert_eq!(
            registry.unbox_handle(ObjectType::Buffer, b),
            Ok(HostHandle(2))
        );
    }

    #[test]
    fn decode_rejects_cursor_behind_mappings() {
        let registry = HandleRegistry::new();
        registry.box_handles(
            ObjectType::Image,
            &[HostHandle(10), HostHandle(11), HostHandle(12)],
        );

        let mut bytes = Vec::new();
        registry.encode(&mut bytes).unwrap();
        // Rewind the stored allocator cursor below the live records.
        bytes[..8].copy_from_slice(&FIRST_BOXED_ID.to_le_bytes());

        let err = HandleRegistry::decode(&mut bytes.as_slice()).unwrap_err();
        assert!(matches!(err, SnapshotError::Corrupt(_)));
    }
}
