//! Property-based tests for the reactive graph.
//!
//! Builds random DAGs of signals and computeds with a single effect on top,
//! applies random writes, and checks the results against a plain
//! re-evaluation of the same DAG.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use proptest::prelude::*;
use shelf_reactive::{Computed, Runtime, Signal};

/// Computed `i` reads the listed nodes; indices below `signals` are
/// signals, the rest are earlier computeds.
#[derive(Debug, Clone)]
struct Shape {
    signals: usize,
    computeds: Vec<Vec<usize>>,
}

fn shape() -> impl Strategy<Value = Shape> {
    (1usize..5, 1usize..8)
        .prop_flat_map(|(signals, computeds)| {
            let deps: Vec<_> = (0..computeds)
                .map(|i| prop::collection::vec(0..signals + i, 1..4))
                .collect();
            (Just(signals), deps)
        })
        .prop_map(|(signals, computeds)| Shape { signals, computeds })
}

fn writes() -> impl Strategy<Value = Vec<(usize, i64)>> {
    prop::collection::vec((0usize..64, -50i64..50), 1..12)
}

/// Expected value of every computed for the given signal values.
fn reference(shape: &Shape, signals: &[i64]) -> Vec<i64> {
    let mut values = signals.to_vec();
    for (i, deps) in shape.computeds.iter().enumerate() {
        let sum: i64 = deps.iter().map(|&d| values[d]).sum();
        values.push(sum + i as i64);
    }
    values.split_off(shape.signals)
}

struct Harness {
    rt: Runtime,
    signals: Vec<Signal<i64>>,
    runs: Vec<Rc<Cell<usize>>>,
    seen: Rc<RefCell<Vec<Vec<i64>>>>,
}

fn build(shape: &Shape) -> Harness {
    let rt = Runtime::new();
    let signals: Vec<Signal<i64>> = (0..shape.signals).map(|_| rt.signal(0)).collect();

    let mut readers: Vec<Rc<dyn Fn() -> i64>> = signals
        .iter()
        .map(|s| {
            let s = s.clone();
            Rc::new(move || s.get()) as Rc<dyn Fn() -> i64>
        })
        .collect();
    let mut runs = Vec::new();
    let mut computeds: Vec<Computed<i64>> = Vec::new();

    for (i, deps) in shape.computeds.iter().enumerate() {
        let inputs: Vec<_> = deps.iter().map(|&d| Rc::clone(&readers[d])).collect();
        let count = Rc::new(Cell::new(0));
        let computed = {
            let count = count.clone();
            rt.computed(move || {
                count.set(count.get() + 1);
                inputs.iter().map(|read| read()).sum::<i64>() + i as i64
            })
        };
        let handle = computed.clone();
        readers.push(Rc::new(move || handle.get()));
        runs.push(count);
        computeds.push(computed);
    }

    let seen = Rc::new(RefCell::new(Vec::new()));
    {
        let seen = seen.clone();
        let _effect = rt.effect(move || {
            let values: Vec<i64> = computeds.iter().map(Computed::get).collect();
            seen.borrow_mut().push(values);
        });
    }

    Harness {
        rt,
        signals,
        runs,
        seen,
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Every flush leaves each computed equal to a fresh evaluation, runs
    /// each computed at most once, and runs the effect at most once.
    #[test]
    fn flushes_are_glitch_free(shape in shape(), writes in writes()) {
        let h = build(&shape);
        let mut truth = vec![0i64; shape.signals];
        prop_assert_eq!(h.seen.borrow().last().cloned(), Some(reference(&shape, &truth)));

        for (index, value) in writes {
            let index = index % shape.signals;
            for runs in &h.runs {
                runs.set(0);
            }
            let effect_runs_before = h.seen.borrow().len();

            h.signals[index].set(value);
            truth[index] = value;
            prop_assert!(h.rt.flush().is_ok());

            for (i, runs) in h.runs.iter().enumerate() {
                prop_assert!(runs.get() <= 1, "computed {} ran {} times", i, runs.get());
            }
            prop_assert!(h.seen.borrow().len() <= effect_runs_before + 1);
            prop_assert_eq!(h.seen.borrow().last().cloned(), Some(reference(&shape, &truth)));
            prop_assert!(h.rt.check_invariants().is_ok());
            prop_assert!(!h.rt.is_flush_pending());
        }
    }

    /// Any number of writes inside one batch costs a single effect run.
    #[test]
    fn batched_writes_run_the_effect_once(shape in shape(), writes in writes()) {
        let h = build(&shape);
        let mut truth = vec![0i64; shape.signals];

        h.rt.batch(|| {
            for &(index, value) in &writes {
                let index = index % shape.signals;
                h.signals[index].set(value);
                truth[index] = value;
            }
        });
        prop_assert!(h.rt.run_until_idle().is_ok());

        prop_assert!(h.seen.borrow().len() <= 2);
        prop_assert_eq!(h.seen.borrow().last().cloned(), Some(reference(&shape, &truth)));
    }
}
