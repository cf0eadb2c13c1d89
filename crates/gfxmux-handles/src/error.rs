use thiserror::Error;

use crate::ObjectType;

/// Registry lookup failures.
///
/// Neither variant is fatal to the host: `InvalidHandle` is a guest protocol
/// violation that the decoder maps to the corresponding API error code, and
/// `DuplicateRegistration` is an internal consistency fault recovered by
/// keeping the existing mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HandleError {
    #[error("invalid {object_type} handle 0x{value:016x}")]
    InvalidHandle { object_type: ObjectType, value: u64 },

    #[error(
        "duplicate registration of {object_type} boxed handle 0x{boxed:016x} \
         (existing host 0x{existing:016x}, new host 0x{host:016x})"
    )]
    DuplicateRegistration {
        object_type: ObjectType,
        boxed: u64,
        existing: u64,
        host: u64,
    },
}
