use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use gfxmux_process::{
    AttributionPolicy, ControlPipeError, ControlPipeService, ProcessId, ProcessTracker,
    TransportKind, PROCESS_PIPE_CONFIRM_TOKEN,
};

fn service_with_counter(
    policy: AttributionPolicy,
) -> (ControlPipeService, Arc<ProcessTracker>, Arc<AtomicUsize>) {
    let cleanups = Arc::new(AtomicUsize::new(0));
    let tracker = {
        let cleanups = Arc::clone(&cleanups);
        Arc::new(ProcessTracker::new(move |_| {
            cleanups.fetch_add(1, Ordering::SeqCst);
        }))
    };
    let service = ControlPipeService::new(Arc::clone(&tracker), policy, |_| {});
    (service, tracker, cleanups)
}

#[test]
fn handshake_reveals_id_only_after_confirm_token() {
    let (service, tracker, _) = service_with_counter(AttributionPolicy::PipeAlways);
    let mut pipe = service.open(TransportKind::Stream);

    let id = pipe.process_id().expect("stream pipe assigns eagerly");
    assert!(tracker.is_live(id));

    // Reading before the token yields nothing.
    let mut buf = [0u8; 8];
    assert_eq!(pipe.on_guest_recv(&mut buf).unwrap(), 0);

    let sent = pipe
        .on_guest_send(&PROCESS_PIPE_CONFIRM_TOKEN.to_le_bytes())
        .unwrap();
    assert_eq!(sent, 4);

    assert_eq!(pipe.on_guest_recv(&mut buf).unwrap(), 8);
    assert_eq!(u64::from_le_bytes(buf), id.0);

    // The reply is delivered once.
    assert_eq!(pipe.on_guest_recv(&mut buf).unwrap(), 0);
}

#[test]
fn bad_token_is_rejected_without_queueing_a_reply() {
    let (service, _, _) = service_with_counter(AttributionPolicy::PipeAlways);
    let mut pipe = service.open(TransportKind::Stream);

    let err = pipe.on_guest_send(&99u32.to_le_bytes()).unwrap_err();
    assert_eq!(err, ControlPipeError::UnexpectedToken { token: 99 });

    let mut buf = [0u8; 8];
    assert_eq!(pipe.on_guest_recv(&mut buf).unwrap(), 0);
}

#[test]
fn short_messages_are_rejected() {
    let (service, _, _) = service_with_counter(AttributionPolicy::PipeAlways);
    let mut pipe = service.open(TransportKind::Stream);

    assert_eq!(
        pipe.on_guest_send(&[1, 2]).unwrap_err(),
        ControlPipeError::ShortMessage { len: 2 }
    );

    pipe.on_guest_send(&PROCESS_PIPE_CONFIRM_TOKEN.to_le_bytes())
        .unwrap();
    let mut tiny = [0u8; 4];
    assert_eq!(
        pipe.on_guest_recv(&mut tiny).unwrap_err(),
        ControlPipeError::ShortReceiveBuffer { len: 4 }
    );
}

#[test]
fn close_triggers_cleanup_exactly_once() {
    let (service, tracker, cleanups) = service_with_counter(AttributionPolicy::PipeAlways);
    let mut pipe = service.open(TransportKind::Stream);
    let id = pipe.process_id().unwrap();

    pipe.on_guest_close();
    pipe.on_guest_close();

    assert_eq!(cleanups.load(Ordering::SeqCst), 1);
    assert!(!tracker.is_live(id));
    assert!(pipe.is_closed());
}

#[test]
fn virtio_gpu_transport_defers_attribution() {
    let (service, tracker, cleanups) = service_with_counter(AttributionPolicy::DeferVirtioGpu);
    let mut pipe = service.open(TransportKind::VirtioGpu);

    assert_eq!(pipe.process_id(), None);
    assert_eq!(tracker.live_count(), 0);

    // The handshake carries no id on this transport.
    pipe.on_guest_send(&PROCESS_PIPE_CONFIRM_TOKEN.to_le_bytes())
        .unwrap();
    let mut buf = [0u8; 8];
    assert_eq!(pipe.on_guest_recv(&mut buf).unwrap(), 0);

    pipe.on_guest_close();
    assert_eq!(cleanups.load(Ordering::SeqCst), 0);
}

#[test]
fn pipe_always_policy_assigns_on_virtio_gpu_too() {
    let (service, tracker, _) = service_with_counter(AttributionPolicy::PipeAlways);
    let pipe = service.open(TransportKind::VirtioGpu);
    let id = pipe.process_id().expect("policy makes the pipe authoritative");
    assert!(tracker.is_live(id));
}

#[test]
fn creation_hook_fires_on_open_and_on_load() {
    let created: Arc<Mutex<Vec<ProcessId>>> = Arc::new(Mutex::new(Vec::new()));
    let tracker = Arc::new(ProcessTracker::new(|_| {}));
    let service = {
        let created = Arc::clone(&created);
        ControlPipeService::new(Arc::clone(&tracker), AttributionPolicy::PipeAlways, move |id| {
            created.lock().unwrap().push(id)
        })
    };

    let mut pipe = service.open(TransportKind::Stream);
    let id = pipe.process_id().unwrap();
    pipe.on_guest_send(&PROCESS_PIPE_CONFIRM_TOKEN.to_le_bytes())
        .unwrap();

    let mut bytes = Vec::new();
    pipe.encode(&mut bytes).unwrap();

    let mut restored = service.load(&mut bytes.as_slice()).unwrap();
    assert_eq!(restored.process_id(), Some(id));

    // The pending reply survived the snapshot.
    let mut buf = [0u8; 8];
    assert_eq!(restored.on_guest_recv(&mut buf).unwrap(), 8);
    assert_eq!(u64::from_le_bytes(buf), id.0);

    assert_eq!(created.lock().unwrap().as_slice(), &[id, id]);
}
