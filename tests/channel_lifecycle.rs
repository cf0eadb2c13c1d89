mod common;

use gfxmux::{
    ChannelState, CommandDecoder, ObjectType, ProcessId, Renderer, RendererConfig, RendererError,
};

use common::{command, recv_reply, wait_until, TestProtocolDecoder, OP_CREATE_IMAGE, OP_DEVICE_LOST, OP_USE_IMAGE};

fn test_renderer() -> Renderer {
    common::init_tracing();
    Renderer::new(RendererConfig::default(), || {
        Box::new(TestProtocolDecoder) as Box<dyn CommandDecoder>
    })
    .expect("renderer construction")
}

#[test]
fn commands_execute_in_submission_order() {
    let renderer = test_renderer();
    let channel = renderer
        .create_render_channel(ProcessId(1), 5)
        .expect("channel");

    channel.guest_send(command(OP_CREATE_IMAGE, 100)).unwrap();
    let boxed = u64::from_le_bytes(recv_reply(&channel).try_into().unwrap());

    channel.guest_send(command(OP_USE_IMAGE, boxed)).unwrap();
    let host = u64::from_le_bytes(recv_reply(&channel).try_into().unwrap());
    assert_eq!(host, 100);

    renderer.finish();
}

#[test]
fn invalid_handle_rejects_call_but_keeps_channel_alive() {
    let renderer = test_renderer();
    let channel = renderer
        .create_render_channel(ProcessId(1), 0)
        .expect("channel");

    // Forged handle: the call is rejected, no crash, no disconnect.
    channel.guest_send(command(OP_USE_IMAGE, 0xF00D)).unwrap();

    // The channel still executes subsequent work.
    channel.guest_send(command(OP_CREATE_IMAGE, 7)).unwrap();
    let boxed = u64::from_le_bytes(recv_reply(&channel).try_into().unwrap());
    assert!(renderer
        .handle_registry()
        .unbox_handle(ObjectType::Image, gfxmux::BoxedHandle(boxed))
        .is_ok());
    assert!(!channel.is_stopped());

    renderer.finish();
}

#[test]
fn driver_fatal_tears_down_only_the_affected_channel() {
    let renderer = test_renderer();
    let doomed = renderer
        .create_render_channel(ProcessId(1), 1)
        .expect("channel");
    let sibling = renderer
        .create_render_channel(ProcessId(2), 2)
        .expect("channel");

    doomed.guest_send(command(OP_DEVICE_LOST, 0)).unwrap();
    wait_until(|| doomed.is_stopped());

    // The sibling context is unaffected.
    sibling.guest_send(command(OP_CREATE_IMAGE, 55)).unwrap();
    assert_eq!(recv_reply(&sibling).len(), 8);
    assert!(!sibling.is_stopped());

    renderer.finish();
}

#[test]
fn create_during_stop_is_refused_without_starting_a_thread() {
    let renderer = test_renderer();
    renderer
        .create_render_channel(ProcessId(1), 5)
        .expect("channel");

    renderer.stop(true);

    let err = renderer
        .create_render_channel(ProcessId(1), 6)
        .expect_err("supervisor is stopping");
    assert!(matches!(err, RendererError::ChannelCreationRefused));

    // The refused channel never entered either set.
    assert_eq!(renderer.active_channel_count(), 0);
    assert_eq!(renderer.stopped_channel_count(), 1);

    renderer.finish();
}

#[test]
fn stop_with_wait_leaves_no_work_in_flight() {
    let renderer = test_renderer();
    let channel = renderer
        .create_render_channel(ProcessId(3), 9)
        .expect("channel");

    for i in 0..16 {
        channel.guest_send(command(OP_CREATE_IMAGE, 1000 + i)).unwrap();
    }
    renderer.stop(true);

    // Stopped channels stay queryable until finish().
    assert!(channel.state().contains(ChannelState::STOPPED));
    assert_eq!(renderer.stopped_channel_count(), 1);
    assert!(channel.guest_send(command(OP_CREATE_IMAGE, 1)).is_err());

    renderer.finish();
    assert_eq!(renderer.stopped_channel_count(), 0);
}

#[test]
fn stop_is_idempotent() {
    let renderer = test_renderer();
    renderer.create_render_channel(ProcessId(1), 0).unwrap();
    renderer.stop(false);
    renderer.stop(true);
    renderer.finish();
}
