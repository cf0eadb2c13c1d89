//! Shared helpers for `gfxmux` integration tests.

use std::sync::Arc;
use std::time::{Duration, Instant};

use gfxmux::{
    BoxedHandle, CommandDecoder, DispatchContext, DispatchError, HostHandle, ObjectType,
    RenderChannel,
};

/// Route `tracing` output through the test harness (idempotent).
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
}

pub const OP_CREATE_IMAGE: u8 = 1;
pub const OP_USE_IMAGE: u8 = 2;
pub const OP_DESTROY_IMAGE: u8 = 3;
pub const OP_DEVICE_LOST: u8 = 4;

/// Minimal test protocol: one opcode byte followed by an 8-byte LE handle.
/// Stands in for the (out-of-scope) wire decoder.
#[derive(Debug, Default)]
pub struct TestProtocolDecoder;

fn handle_arg(rest: &[u8]) -> Result<u64, DispatchError> {
    let bytes: [u8; 8] = rest
        .try_into()
        .map_err(|_| DispatchError::Malformed("handle argument must be 8 bytes"))?;
    Ok(u64::from_le_bytes(bytes))
}

impl CommandDecoder for TestProtocolDecoder {
    fn decode(
        &mut self,
        commands: &[u8],
        cx: &mut DispatchContext<'_>,
    ) -> Result<Vec<u8>, DispatchError> {
        let (&op, rest) = commands
            .split_first()
            .ok_or(DispatchError::Malformed("empty command buffer"))?;
        match op {
            OP_CREATE_IMAGE => {
                let host = handle_arg(rest)?;
                let boxed = cx.box_created(ObjectType::Image, &[HostHandle(host)]);
                Ok(boxed[0].0.to_le_bytes().to_vec())
            }
            OP_USE_IMAGE => {
                let boxed = handle_arg(rest)?;
                let hosts = cx.resolve(ObjectType::Image, &[BoxedHandle(boxed)])?;
                Ok(hosts[0].0.to_le_bytes().to_vec())
            }
            OP_DESTROY_IMAGE => {
                let boxed = handle_arg(rest)?;
                cx.release_destroyed(ObjectType::Image, &[BoxedHandle(boxed)]);
                Ok(vec![0])
            }
            OP_DEVICE_LOST => Err(DispatchError::DriverFatal("device lost".to_owned())),
            _ => Err(DispatchError::Malformed("unknown opcode")),
        }
    }
}

pub fn command(op: u8, handle: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(9);
    buf.push(op);
    buf.extend_from_slice(&handle.to_le_bytes());
    buf
}

/// Poll for the next host-to-guest reply, failing the test after a generous
/// timeout rather than hanging it.
pub fn recv_reply(channel: &Arc<RenderChannel>) -> Vec<u8> {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(reply) = channel.guest_recv() {
            return reply;
        }
        assert!(Instant::now() < deadline, "timed out waiting for reply");
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// Wait until `predicate` holds, with the same timeout policy.
pub fn wait_until(mut predicate: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !predicate() {
        assert!(Instant::now() < deadline, "timed out waiting for condition");
        std::thread::sleep(Duration::from_millis(1));
    }
}
