use crate::{BoxedHandle, HandleError, HandleRegistry, HostHandle, ObjectType};

/// How a decoded call's handle arguments cross the trust boundary.
///
/// Selected per call site, by call direction:
/// - creation calls register the driver's outputs (`BoxCreate`),
/// - consuming calls resolve the guest's inputs (`BoxUnwrap`),
/// - internal host-to-host calls pass through untouched (`Identity`).
///
/// Keeping registration and resolution on two separate, explicitly chosen
/// paths makes it checkable that every creation call registers exactly the
/// handles it returns and every destruction call consumes exactly the handles
/// it resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingPolicy {
    /// Pass-through for trusted internal calls that never reach the guest.
    Identity,
    /// After the driver call succeeded: box the new host handles and hand the
    /// boxed values to the guest.
    BoxCreate,
    /// Before the driver call: resolve guest-supplied boxed values back to
    /// host handles, rejecting the call if any fails.
    BoxUnwrap,
}

impl MappingPolicy {
    /// Translate `handles` in place under this policy.
    ///
    /// On error nothing is written back; the caller rejects the whole call.
    pub fn translate(
        self,
        registry: &HandleRegistry,
        object_type: ObjectType,
        handles: &mut [u64],
    ) -> Result<(), HandleError> {
        match self {
            MappingPolicy::Identity => Ok(()),
            MappingPolicy::BoxCreate => {
                let hosts: Vec<HostHandle> = handles.iter().map(|&h| HostHandle(h)).collect();
                let boxed = registry.box_handles(object_type, &hosts);
                for (slot, b) in handles.iter_mut().zip(boxed) {
                    *slot = b.0;
                }
                Ok(())
            }
            MappingPolicy::BoxUnwrap => {
                let boxed: Vec<BoxedHandle> = handles.iter().map(|&h| BoxedHandle(h)).collect();
                let hosts = registry.unbox_handles(object_type, &boxed)?;
                for (slot, h) in handles.iter_mut().zip(hosts) {
                    *slot = h.0;
                }
                Ok(())
            }
        }
    }
}
