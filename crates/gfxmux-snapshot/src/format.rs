pub const SNAPSHOT_MAGIC: &[u8; 8] = b"GFXMSNAP";
pub const SNAPSHOT_VERSION_V1: u16 = 1;
pub const SNAPSHOT_ENDIANNESS_LITTLE: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SectionId(pub u32);

impl SectionId {
    /// Process-id generation counter + live process-id set.
    pub const PROCESSES: SectionId = SectionId(1);
    /// Boxed-handle tables (all object types) + boxed-id allocator cursor.
    pub const HANDLES: SectionId = SectionId(2);
    /// Active render-channel roster.
    pub const CHANNELS: SectionId = SectionId(3);
    /// Shared-memory consumer-context bindings.
    pub const CONSUMERS: SectionId = SectionId(4);

    pub fn name(self) -> Option<&'static str> {
        match self {
            SectionId::PROCESSES => Some("PROCESSES"),
            SectionId::HANDLES => Some("HANDLES"),
            SectionId::CHANNELS => Some("CHANNELS"),
            SectionId::CONSUMERS => Some("CONSUMERS"),
            _ => None,
        }
    }
}

impl core::fmt::Display for SectionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if let Some(name) = self.name() {
            write!(f, "{name}({})", self.0)
        } else {
            write!(f, "SectionId({})", self.0)
        }
    }
}
