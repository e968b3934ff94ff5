use anyhow::bail;
use rustc_hash::FxHashMap;
use std::sync::Mutex;
use tracing::trace;

/// Static description of an application packet type, supplied by the protocol layer: a
///  stable key plus the keys of the types it must not overtake. A type may list itself,
///  meaning successive instances of that type are strictly ordered.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct PacketTypeDescriptor {
    pub key: &'static str,
    pub must_not_overtake: &'static [&'static str],
}

impl PacketTypeDescriptor {
    pub const fn unordered(key: &'static str) -> PacketTypeDescriptor {
        PacketTypeDescriptor { key, must_not_overtake: &[] }
    }
}

/// A packet type as seen by one connection: a small id assigned in first-seen order plus
///  the resolved waits-for set as a bitmask over type ids. The mask is built once and
///  thereafter read-only, so holders of a `PacketType` need no further locking.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct PacketType {
    pub id: usize,
    pub waits_for: u64,
}

/// Per-connection arena of packet type records.
///
/// Ids are assigned in first-seen order. A type's waits-for set is resolved lazily on the
///  first packet of that type, because the declared list may reference the type itself or
///  types not seen yet; referenced-but-unseen types get an id allocated immediately and
///  their own resolution deferred until their first packet arrives with a descriptor.
///  Resolution is idempotent and guarded by the table's mutex, so concurrent first use
///  from packets of different types is safe.
pub struct PacketTypeTable {
    inner: Mutex<TableInner>,
}

struct TableInner {
    ids_by_key: FxHashMap<&'static str, usize>,
    records: Vec<TypeRecord>,
}

struct TypeRecord {
    key: &'static str,
    /// resolved waits-for mask; `None` until the first packet of this type supplies the
    ///  declared list
    waits_for: Option<u64>,
}

/// The waits-for mask is a u64, which caps the distinct packet types per connection.
pub const MAX_PACKET_TYPES: usize = 64;

/// The type ids in a waits-for mask.
pub fn type_ids(mask: u64) -> impl Iterator<Item = usize> {
    (0..MAX_PACKET_TYPES).filter(move |i| mask & (1u64 << i) != 0)
}

impl PacketTypeTable {
    pub fn new() -> PacketTypeTable {
        PacketTypeTable {
            inner: Mutex::new(TableInner {
                ids_by_key: FxHashMap::default(),
                records: Vec::new(),
            }),
        }
    }

    /// Looks up or allocates the type for `descriptor`, resolving its waits-for set if that
    ///  has not happened yet.
    pub fn type_for(&self, descriptor: &PacketTypeDescriptor) -> anyhow::Result<PacketType> {
        let mut inner = self.inner.lock().unwrap();

        let id = inner.id_for_key(descriptor.key)?;
        if inner.records[id].waits_for.is_none() {
            let mut mask = 0u64;
            for dep_key in descriptor.must_not_overtake {
                let dep_id = inner.id_for_key(dep_key)?;
                mask |= 1u64 << dep_id;
            }
            inner.records[id].waits_for = Some(mask);
            trace!("resolved packet type {:?} to id {} with waits-for mask {:#x}", descriptor.key, id, mask);
        }

        Ok(PacketType {
            id,
            waits_for: inner.records[id].waits_for.unwrap(),
        })
    }
}

impl TableInner {
    fn id_for_key(&mut self, key: &'static str) -> anyhow::Result<usize> {
        if let Some(&id) = self.ids_by_key.get(key) {
            return Ok(id);
        }

        let id = self.records.len();
        if id >= MAX_PACKET_TYPES {
            bail!("connection exceeds the limit of {} distinct packet types", MAX_PACKET_TYPES);
        }
        self.records.push(TypeRecord { key, waits_for: None });
        self.ids_by_key.insert(key, id);
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_in_first_seen_order() {
        let table = PacketTypeTable::new();
        let a = table.type_for(&PacketTypeDescriptor::unordered("a")).unwrap();
        let b = table.type_for(&PacketTypeDescriptor::unordered("b")).unwrap();
        let a_again = table.type_for(&PacketTypeDescriptor::unordered("a")).unwrap();

        assert_eq!(a.id, 0);
        assert_eq!(b.id, 1);
        assert_eq!(a_again, a);
    }

    #[test]
    fn test_self_reference() {
        let table = PacketTypeTable::new();
        let t = table
            .type_for(&PacketTypeDescriptor { key: "self_ordered", must_not_overtake: &["self_ordered"] })
            .unwrap();

        assert_eq!(t.id, 0);
        assert_eq!(t.waits_for, 1 << 0);
    }

    #[test]
    fn test_forward_reference_allocates_id() {
        let table = PacketTypeTable::new();
        let a = table
            .type_for(&PacketTypeDescriptor { key: "a", must_not_overtake: &["not_yet_seen"] })
            .unwrap();

        // 'not_yet_seen' got id 1 even though no packet of that type ever appeared
        assert_eq!(a.waits_for, 1 << 1);

        let b = table.type_for(&PacketTypeDescriptor::unordered("not_yet_seen")).unwrap();
        assert_eq!(b.id, 1);
        assert_eq!(b.waits_for, 0);
    }

    #[test]
    fn test_resolution_is_idempotent() {
        let table = PacketTypeTable::new();
        let descriptor = PacketTypeDescriptor { key: "a", must_not_overtake: &["b", "a"] };

        let first = table.type_for(&descriptor).unwrap();
        let second = table.type_for(&descriptor).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.waits_for, (1 << 1) | (1 << 0));
    }

    #[test]
    fn test_type_limit() {
        let table = PacketTypeTable::new();
        let keys: Vec<String> = (0..MAX_PACKET_TYPES + 1).map(|i| format!("type_{}", i)).collect();
        let keys: Vec<&'static str> = keys.into_iter().map(|k| Box::leak(k.into_boxed_str()) as &'static str).collect();

        for key in &keys[..MAX_PACKET_TYPES] {
            assert!(table.type_for(&PacketTypeDescriptor::unordered(key)).is_ok());
        }
        assert!(table.type_for(&PacketTypeDescriptor::unordered(keys[MAX_PACKET_TYPES])).is_err());
    }
}
