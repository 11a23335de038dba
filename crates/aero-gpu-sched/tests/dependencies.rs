mod common;

use std::time::Duration;

use aero_gpu_sched::{
    Device, DeviceConfig, EngineClass, EngineId, FenceError, RequestState, Spinner, SubmitError,
    SwFence, Timeout, WaitError,
};
use common::{init_tracing, mock_request, LONG, T};

fn two_engine_device() -> Device {
    Device::new(DeviceConfig::with_instances(EngineClass::Compute, 2)).unwrap()
}

#[test]
fn cross_engine_dependency_orders_execution() {
    init_tracing();
    let device = two_engine_device();
    let first = device.create_context(EngineId(0)).unwrap();
    let second = device.create_context(EngineId(1)).unwrap();

    let spin = Spinner::new();
    let producer = first.create_request().unwrap();
    producer.set_batch(spin.batch()).unwrap();
    producer.add().unwrap();

    let consumer = second.create_request().unwrap();
    consumer.await_request(&producer).unwrap();
    consumer.add().unwrap();

    assert!(spin.wait_for_running(LONG));
    assert_eq!(consumer.wait(T), Err(WaitError::Timeout));
    assert_eq!(consumer.state(), RequestState::Added);

    spin.end();
    assert_eq!(consumer.wait(LONG), Ok(()));
    assert!(consumer.fence().timestamp() >= producer.fence().timestamp());
}

#[test]
fn failed_dependency_fails_without_executing() {
    init_tracing();
    let device = two_engine_device();
    let a = device.create_context(EngineId(0)).unwrap();
    let b = device.create_context(EngineId(1)).unwrap();

    let doomed = a.create_request().unwrap();
    let dependent = b.create_request().unwrap();
    dependent.await_request(&doomed).unwrap();
    dependent.add().unwrap();

    doomed.cancel().unwrap();
    assert_eq!(
        dependent.wait(LONG),
        Err(WaitError::Failed(FenceError::Cancelled))
    );
    assert_eq!(dependent.state(), RequestState::Cancelled);
    assert_eq!(device.stats().snapshot().requests_emitted, 0);

    // A later request on the same timeline is ordered after, not failed by, the failure.
    let next = b.create_request().unwrap();
    next.add().unwrap();
    assert_eq!(next.wait(LONG), Ok(()));
}

#[test]
fn plug_holds_submission_until_committed() {
    init_tracing();
    let device = two_engine_device();
    let ctx = device.create_context(EngineId(0)).unwrap();

    let plug = SwFence::new();
    let rq = ctx.create_request().unwrap();
    rq.await_sw_fence(&plug).unwrap();
    rq.add().unwrap();

    assert_eq!(rq.wait(T), Err(WaitError::Timeout));
    assert_eq!(ctx.engine().outstanding(), 1);
    plug.commit().unwrap();
    assert_eq!(rq.wait(LONG), Ok(()));
}

#[test]
fn await_misuse_is_rejected() {
    init_tracing();
    let device = two_engine_device();
    let ctx = device.create_context(EngineId(0)).unwrap();

    let earlier = ctx.create_request().unwrap();
    let rq = ctx.create_request().unwrap();
    let later = ctx.create_request().unwrap();

    assert_eq!(
        rq.await_fence(rq.fence()),
        Err(SubmitError::InvalidState("request cannot await itself"))
    );
    // Whatever is added after `rq` is ordered behind it on the timeline.
    for unadded in [&earlier, &later] {
        assert_eq!(
            rq.await_request(unadded),
            Err(SubmitError::InvalidState(
                "await on an unadded request of the same timeline"
            ))
        );
    }

    // Once added it is already ahead of `rq`.
    earlier.add().unwrap();
    rq.await_request(&earlier).unwrap();
    earlier.wait(LONG).unwrap();
    assert_eq!(
        earlier.await_fence(rq.fence()),
        Err(SubmitError::InvalidState("await after add"))
    );
    assert_eq!(
        earlier.cancel(),
        Err(SubmitError::InvalidState("cancel after add"))
    );
    assert_eq!(
        earlier.add(),
        Err(SubmitError::InvalidState("request already added"))
    );
    assert_eq!(
        earlier.set_batch(aero_gpu_sched::Batch::Empty),
        Err(SubmitError::InvalidState("batch set after add"))
    );
    let other_engine = device.engine(EngineId(1)).unwrap();
    assert_eq!(
        other_engine.submit_request(&earlier),
        Err(SubmitError::InvalidState("request belongs to another engine"))
    );
}

#[test]
fn dropping_an_unadded_request_cancels_it() {
    init_tracing();
    let device = two_engine_device();
    let ctx = device.create_context(EngineId(0)).unwrap();
    let other = device.create_context(EngineId(1)).unwrap();

    let abandoned = ctx.create_request().unwrap();
    let fence = abandoned.fence().clone();
    let dependent = other.create_request().unwrap();
    dependent.await_request(&abandoned).unwrap();
    dependent.add().unwrap();

    // Unadded requests hold nothing up on their own timeline.
    let successor = mock_request(&ctx, Duration::ZERO);
    successor.add().unwrap();
    assert_eq!(successor.wait(LONG), Ok(()));
    assert_eq!(dependent.wait(T / 2), Err(WaitError::Timeout));

    drop(abandoned);
    assert_eq!(
        fence.wait(Timeout::Poll),
        Err(WaitError::Failed(FenceError::Cancelled))
    );
    assert_eq!(
        dependent.wait(LONG),
        Err(WaitError::Failed(FenceError::Cancelled))
    );
    assert_eq!(device.stats().snapshot().requests_cancelled, 2);
}

#[test]
fn cancelled_request_cannot_be_added() {
    let device = two_engine_device();
    let ctx = device.create_context(EngineId(1)).unwrap();
    let rq = ctx.create_request().unwrap();
    rq.cancel().unwrap();
    assert_eq!(rq.add(), Err(SubmitError::InvalidState("request was cancelled")));
    assert_eq!(rq.state(), RequestState::Cancelled);
}
