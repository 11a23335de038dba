mod common;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use aero_gpu_sched::{Batch, Device, DeviceConfig, EngineClass, EngineConfig};
use common::LONG;
use proptest::prelude::*;

#[derive(Clone, Debug)]
enum Step {
    Empty,
    Delay(u64),
    Cancel,
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        4 => Just(Step::Empty),
        2 => (0u64..3).prop_map(Step::Delay),
        1 => Just(Step::Cancel),
    ]
}

/// Requests to create, as (context, step), and the order in which to add them.
fn plan() -> impl Strategy<Value = (Vec<(usize, Step)>, Vec<usize>)> {
    proptest::collection::vec((0usize..3, step()), 1..24).prop_flat_map(|requests| {
        let order: Vec<usize> = (0..requests.len()).collect();
        (Just(requests), Just(order).prop_shuffle())
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Whatever the mix of batches, contexts, engine parallelism and the order requests are added
    /// in relative to their creation, every added request terminates and each context's requests
    /// terminate in the order they were added.
    #[test]
    fn per_context_completion_follows_add_order(
        max_in_flight in 1usize..4,
        (requests, add_order) in plan(),
    ) {
        let config = DeviceConfig {
            engines: vec![EngineConfig {
                max_in_flight,
                ..EngineConfig::new(EngineClass::Render, 0)
            }],
            ..Default::default()
        };
        let device = Device::new(config).unwrap();
        let engine = &device.engines()[0];
        let contexts: Vec<_> = (0..3).map(|i| engine.create_context(&format!("p{i}"))).collect();

        // Everything is created up front, so creation order and add order disagree.
        let created: Vec<_> = requests
            .iter()
            .map(|(ctx_idx, _)| contexts[*ctx_idx].create_request().unwrap())
            .collect();

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut added = Vec::new();
        for (position, &idx) in add_order.iter().enumerate() {
            let rq = &created[idx];
            match &requests[idx].1 {
                Step::Cancel => {
                    rq.cancel().unwrap();
                    continue;
                }
                Step::Delay(ms) => rq.set_batch(Batch::Delay(Duration::from_millis(*ms))).unwrap(),
                Step::Empty => {}
            }

            let key = (rq.context_id(), position);
            let sink = Arc::clone(&order);
            rq.fence().add_callback(Box::new(move |_| sink.lock().unwrap().push(key)));
            rq.add().unwrap();
            added.push(rq.clone());
        }

        device.wait_for_idle(LONG).unwrap();
        for rq in &added {
            prop_assert!(rq.is_completed());
            prop_assert_eq!(rq.fence().error(), None);
        }

        let order = order.lock().unwrap().clone();
        let mut last: BTreeMap<u64, usize> = BTreeMap::new();
        for (ctx, position) in &order {
            if let Some(prev) = last.insert(*ctx, *position) {
                prop_assert!(
                    prev < *position,
                    "context {} completed add #{} after add #{}",
                    ctx,
                    position,
                    prev
                );
            }
        }
        prop_assert_eq!(order.len(), added.len());
        prop_assert_eq!(device.stats().snapshot().requests_added as usize, added.len());
    }
}
