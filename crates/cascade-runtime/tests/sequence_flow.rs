//! End-to-end sequence flow
//!
//! An interval ticks in the global strata and arms a two-stage sequence;
//! the first stage holds a wait timer that hands off to the second stage,
//! which completes and retires the sequence. Everything runs through the
//! public construction path (factories, timing base, tolerance).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cascade_ir::{Edge, EdgeKind, Handle, Node as NodeDecl, ParamValue, Program, Sequence, Stage, Strata};
use cascade_runtime::{build_nodes, time, Context, Node, NodeFactory, Result, Scheduler};

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

struct EntryNode;

impl Node for EntryNode {
    fn next(&mut self, ctx: &mut Context) {
        ctx.activate_stage();
    }

    fn is_output_truthy(&self, _param: &cascade_ir::ParamName) -> bool {
        false
    }
}

struct ProbeNode {
    runs: Arc<AtomicUsize>,
}

impl Node for ProbeNode {
    fn next(&mut self, _ctx: &mut Context) {
        self.runs.fetch_add(1, Ordering::Relaxed);
    }

    fn is_output_truthy(&self, _param: &cascade_ir::ParamName) -> bool {
        false
    }
}

struct TestFactory {
    probe_runs: Arc<AtomicUsize>,
}

impl NodeFactory for TestFactory {
    fn create(&mut self, decl: &cascade_ir::Node) -> Result<Option<Box<dyn Node>>> {
        match decl.kind.as_str() {
            "entry" => Ok(Some(Box::new(EntryNode))),
            "probe" => Ok(Some(Box::new(ProbeNode {
                runs: Arc::clone(&self.probe_runs),
            }))),
            _ => Ok(None),
        }
    }
}

fn fill_and_drain_program() -> Program {
    Program {
        nodes: vec![
            NodeDecl::new("tick", "interval")
                .with_config("period", ParamValue::I64(ms(100).as_nanos() as i64)),
            NodeDecl::new("entry_main_fill", "entry"),
            NodeDecl::new("wait_fill", "wait")
                .with_config("duration", ParamValue::I64(ms(300).as_nanos() as i64)),
            NodeDecl::new("entry_main_drain", "entry"),
            NodeDecl::new("drain_probe", "probe"),
        ],
        edges: vec![
            Edge {
                source: Handle::new("tick", "output"),
                target: Handle::new("entry_main_fill", "input"),
                kind: EdgeKind::OneShot,
            },
            Edge {
                source: Handle::new("wait_fill", "output"),
                target: Handle::new("entry_main_drain", "input"),
                kind: EdgeKind::OneShot,
            },
        ],
        strata: Strata(vec![
            vec!["tick".into()],
            vec!["entry_main_fill".into()],
        ]),
        sequences: vec![Sequence {
            key: "main".into(),
            stages: vec![
                Stage {
                    key: "fill".into(),
                    strata: Strata(vec![
                        vec!["wait_fill".into()],
                        vec!["entry_main_drain".into()],
                    ]),
                },
                Stage {
                    key: "drain".into(),
                    strata: Strata(vec![vec!["drain_probe".into()]]),
                },
            ],
        }],
    }
}

#[test]
fn interval_arms_sequence_and_wait_walks_it_to_completion() {
    let probe_runs = Arc::new(AtomicUsize::new(0));
    let program = fill_and_drain_program();

    let mut timers = time::Factory::new();
    let mut extras = TestFactory {
        probe_runs: Arc::clone(&probe_runs),
    };
    let nodes = build_nodes(&program, &mut [&mut timers, &mut extras]).expect("all types handled");

    // gcd(100ms, 300ms) = 100ms; tolerance is half of that
    assert_eq!(timers.base_interval(), Some(ms(100)));
    let tolerance = time::tolerance(timers.base_interval());
    assert_eq!(tolerance, ms(50));

    let mut scheduler = Scheduler::new(program, nodes).expect("valid program");
    scheduler.set_tolerance(tolerance);
    scheduler.init();

    // first tick fires the interval, whose one-shot arms the fill stage
    scheduler.next(ms(0));
    assert_eq!(
        scheduler.active_stage_of(&"main".into()),
        Some(&"fill".into())
    );
    assert_eq!(probe_runs.load(Ordering::Relaxed), 0);

    // the wait timer holds the stage until its duration elapses
    scheduler.next(ms(100));
    scheduler.next(ms(200));
    assert_eq!(
        scheduler.active_stage_of(&"main".into()),
        Some(&"fill".into())
    );
    assert_eq!(probe_runs.load(Ordering::Relaxed), 0);

    // the wait fires, hands off to drain, and drain runs in the same
    // cycle; drain is terminal with nothing pending, so the sequence
    // retires at the end of that cycle
    scheduler.next(ms(300));
    assert_eq!(probe_runs.load(Ordering::Relaxed), 1);
    assert!(!scheduler.is_sequence_active(&"main".into()));

    // the interval keeps ticking, but its one-shot fired for the lifetime
    // of the program: the sequence never re-arms
    scheduler.next(ms(400));
    scheduler.next(ms(500));
    scheduler.next(ms(600));
    assert_eq!(probe_runs.load(Ordering::Relaxed), 1);
    assert!(!scheduler.is_sequence_active(&"main".into()));
}
