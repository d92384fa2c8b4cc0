//! End-to-end properties of the runtime: serialization, queue discipline,
//! batching, yield, suspension, and kill semantics.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    thread,
    time::Duration,
};
use turnstile_runtime::{
    value, Call, DeadActor, Executor, Flags, ManualExecutor, PostError, Promise, RegistryBuilder,
    Rejected, Ret, Runtime, SignatureId, Suspension, Target, Task, Value,
};

/// The simplest real-thread supply: one thread per submitted task.
struct SpawningExecutor;

impl Executor for SpawningExecutor {
    fn execute(&self, task: Task) -> Result<(), Rejected> {
        thread::spawn(task);
        Ok(())
    }
}

struct Exclusive {
    direct: SignatureId,
    chained: SignatureId,
    busy: Arc<AtomicBool>,
    runs: Arc<AtomicUsize>,
    violations: Arc<AtomicUsize>,
}

impl Exclusive {
    fn enter(
        busy: &Arc<AtomicBool>,
        runs: &Arc<AtomicUsize>,
        violations: &Arc<AtomicUsize>,
    ) {
        if busy.swap(true, Ordering::SeqCst) {
            violations.fetch_add(1, Ordering::SeqCst);
        }
        // Widen the race window.
        thread::sleep(Duration::from_micros(50));
        busy.store(false, Ordering::SeqCst);
        runs.fetch_add(1, Ordering::SeqCst);
    }
}

impl Target for Exclusive {
    fn invoke(&mut self, call: Call) -> Ret {
        if call.signature == self.direct {
            Exclusive::enter(&self.busy, &self.runs, &self.violations);
            return Ret::unit();
        }
        assert_eq!(call.signature, self.chained);
        // Suspend on an already-done dependency: the continuation still has
        // to queue like any other request and must serialize too.
        let done: Promise<Value> = Promise::new();
        done.complete(value(()));
        let busy = self.busy.clone();
        let runs = self.runs.clone();
        let violations = self.violations.clone();
        Ret::Suspended(Suspension::join(vec![done], move |_| {
            Exclusive::enter(&busy, &runs, &violations);
            Ret::unit()
        }))
    }
}

#[test]
fn no_two_invocations_overlap_under_concurrent_posting() {
    let _ = tracing_subscriber::fmt::try_init();
    let mut signatures = RegistryBuilder::new();
    let direct = signatures.declare("direct", 0, Flags::default());
    let chained = signatures.declare("chained", 0, Flags::default());

    let busy = Arc::new(AtomicBool::new(false));
    let runs = Arc::new(AtomicUsize::new(0));
    let violations = Arc::new(AtomicUsize::new(0));
    let runtime = Runtime::new(Arc::new(SpawningExecutor));
    let spawned = runtime
        .spawn(
            "exclusive",
            signatures.build(),
            Box::new(Exclusive {
                direct,
                chained,
                busy,
                runs: runs.clone(),
                violations: violations.clone(),
            }),
        )
        .unwrap();

    let posters: Vec<_> = (0..8)
        .map(|poster| {
            let actor = spawned.actor.clone();
            thread::spawn(move || {
                let mut cells = Vec::new();
                for i in 0..25 {
                    let signature = if (poster + i) % 2 == 0 { direct } else { chained };
                    cells.push(actor.post(signature, vec![]).unwrap());
                }
                for cell in cells {
                    cell.get().unwrap();
                }
            })
        })
        .collect();
    for poster in posters {
        poster.join().unwrap();
    }

    assert_eq!(violations.load(Ordering::SeqCst), 0);
    assert_eq!(runs.load(Ordering::SeqCst), 200);
}

struct OrderRecorder {
    order: Arc<Mutex<Vec<String>>>,
}

impl Target for OrderRecorder {
    fn invoke(&mut self, call: Call) -> Ret {
        let args = call.args.into_single();
        let name = args[0].downcast_ref::<&'static str>().unwrap();
        self.order.lock().unwrap().push(name.to_string());
        Ret::unit()
    }
}

#[test]
fn jump_queue_items_overtake_ordinary_ones_in_post_order() {
    let mut signatures = RegistryBuilder::new();
    let ordinary = signatures.declare("ordinary", 1, Flags::default());
    let jumpy = signatures.declare("jumpy", 1, Flags::default().jump_queue());

    let executor = Arc::new(ManualExecutor::new());
    let runtime = Runtime::new(executor.clone());
    let order = Arc::new(Mutex::new(Vec::new()));
    let spawned = runtime
        .spawn(
            "ordering",
            signatures.build(),
            Box::new(OrderRecorder { order: order.clone() }),
        )
        .unwrap();

    spawned.actor.post(ordinary, vec![value("i")]).unwrap();
    spawned.actor.post(jumpy, vec![value("j1")]).unwrap();
    spawned.actor.post(jumpy, vec![value("j2")]).unwrap();
    executor.run_until_idle();

    assert_eq!(*order.lock().unwrap(), ["j1", "j2", "i"]);
}

struct Summer {
    sum: SignatureId,
    batches: Arc<Mutex<Vec<usize>>>,
}

impl Target for Summer {
    fn invoke(&mut self, call: Call) -> Ret {
        assert_eq!(call.signature, self.sum);
        let positions = call.args.into_batched();
        let column = &positions[0];
        self.batches.lock().unwrap().push(column.len());
        let total: u64 = column
            .iter()
            .map(|v| *v.downcast_ref::<u64>().unwrap())
            .sum();
        Ret::value(total)
    }
}

#[test]
fn batch_members_collapse_and_share_the_aggregate_result() {
    let mut signatures = RegistryBuilder::new();
    let sum = signatures.declare("sum", 1, Flags::default().batched());

    let executor = Arc::new(ManualExecutor::new());
    let runtime = Runtime::new(executor.clone());
    let batches = Arc::new(Mutex::new(Vec::new()));
    let spawned = runtime
        .spawn(
            "summer",
            signatures.build(),
            Box::new(Summer {
                sum,
                batches: batches.clone(),
            }),
        )
        .unwrap();
    executor.run_until_idle();

    let cells: Vec<_> = (1..=3u64)
        .map(|n| spawned.actor.post(sum, vec![value(n)]).unwrap())
        .collect();
    executor.run_until_idle();

    // One batch of three; every caller observes the aggregate.
    assert_eq!(*batches.lock().unwrap(), [3]);
    for cell in cells {
        assert_eq!(*cell.get().unwrap().downcast_ref::<u64>().unwrap(), 6);
    }
}

struct Yielder {
    lazy: SignatureId,
    eager: SignatureId,
    actor: Option<turnstile_runtime::Actor>,
    lazy_runs: Arc<AtomicUsize>,
    eager_runs: Arc<AtomicUsize>,
    interrupted: Arc<AtomicBool>,
}

impl Target for Yielder {
    fn init(&mut self, actor: &turnstile_runtime::Actor) -> Ret {
        self.actor = Some(actor.clone());
        Ret::unit()
    }

    fn invoke(&mut self, call: Call) -> Ret {
        if call.signature == self.eager {
            self.eager_runs.fetch_add(1, Ordering::SeqCst);
            return Ret::unit();
        }
        assert_eq!(call.signature, self.lazy);
        self.lazy_runs.fetch_add(1, Ordering::SeqCst);
        let args = call.args.into_single();
        let provoke = *args[0].downcast_ref::<bool>().unwrap();
        if provoke {
            // An impatient post while this yielding call is in flight sends
            // the cooperative interrupt.
            let actor = self.actor.as_ref().unwrap();
            actor.post(self.eager, vec![]).unwrap();
            if call.cancel.is_cancelled() {
                self.interrupted.store(true, Ordering::SeqCst);
            }
        }
        Ret::unit()
    }
}

struct YieldHarness {
    executor: Arc<ManualExecutor>,
    spawned: turnstile_runtime::Spawned,
    lazy: SignatureId,
    eager: SignatureId,
    lazy_runs: Arc<AtomicUsize>,
    eager_runs: Arc<AtomicUsize>,
    interrupted: Arc<AtomicBool>,
}

fn yielder_setup() -> YieldHarness {
    let mut signatures = RegistryBuilder::new();
    let lazy = signatures.declare("lazy", 1, Flags::default().yielding());
    let eager = signatures.declare("eager", 0, Flags::default());
    let executor = Arc::new(ManualExecutor::new());
    let runtime = Runtime::new(executor.clone());
    let lazy_runs = Arc::new(AtomicUsize::new(0));
    let eager_runs = Arc::new(AtomicUsize::new(0));
    let interrupted = Arc::new(AtomicBool::new(false));
    let spawned = runtime
        .spawn(
            "yielder",
            signatures.build(),
            Box::new(Yielder {
                lazy,
                eager,
                actor: None,
                lazy_runs: lazy_runs.clone(),
                eager_runs: eager_runs.clone(),
                interrupted: interrupted.clone(),
            }),
        )
        .unwrap();
    executor.run_until_idle();
    YieldHarness {
        executor,
        spawned,
        lazy,
        eager,
        lazy_runs,
        eager_runs,
        interrupted,
    }
}

#[test]
fn queued_yield_work_is_skipped_when_impatient_work_waits() {
    let h = yielder_setup();
    let lazy_cell = h.spawned.actor.post(h.lazy, vec![value(false)]).unwrap();
    h.spawned.actor.post(h.eager, vec![]).unwrap();
    h.executor.run_until_idle();

    // The yielding call was judged at dequeue time and never executed.
    assert!(lazy_cell.is_cancelled());
    assert_eq!(h.lazy_runs.load(Ordering::SeqCst), 0);
    assert_eq!(h.eager_runs.load(Ordering::SeqCst), 1);
}

#[test]
fn yield_work_runs_normally_without_impatient_competition() {
    let h = yielder_setup();
    let lazy_cell = h.spawned.actor.post(h.lazy, vec![value(false)]).unwrap();
    h.executor.run_until_idle();

    assert!(!lazy_cell.is_cancelled());
    lazy_cell.get().unwrap();
    assert_eq!(h.lazy_runs.load(Ordering::SeqCst), 1);
}

#[test]
fn in_flight_yield_work_sees_the_cooperative_interrupt() {
    let h = yielder_setup();
    let lazy_cell = h.spawned.actor.post(h.lazy, vec![value(true)]).unwrap();
    h.executor.run_until_idle();

    // The signal arrived while the call was in flight, so the signal wins.
    assert!(h.interrupted.load(Ordering::SeqCst));
    assert!(lazy_cell.is_cancelled());
    assert_eq!(h.eager_runs.load(Ordering::SeqCst), 1);
}

struct SelfKiller {
    boom: SignatureId,
    actor: Option<turnstile_runtime::Actor>,
}

impl Target for SelfKiller {
    fn init(&mut self, actor: &turnstile_runtime::Actor) -> Ret {
        self.actor = Some(actor.clone());
        Ret::unit()
    }

    fn invoke(&mut self, call: Call) -> Ret {
        if call.signature == self.boom {
            self.actor.as_ref().unwrap().kill();
            // Killing forces the interrupt on the in-flight invocation,
            // unconditionally.
            assert!(call.cancel.is_cancelled());
            return Ret::value("computed anyway");
        }
        Ret::unit()
    }
}

#[test]
fn kill_cancels_queued_work_and_interrupts_the_in_flight_call() {
    let mut signatures = RegistryBuilder::new();
    let boom = signatures.declare("boom", 0, Flags::default());
    let plain = signatures.declare("plain", 0, Flags::default());

    let executor = Arc::new(ManualExecutor::new());
    let runtime = Runtime::new(executor.clone());
    let spawned = runtime
        .spawn(
            "victim",
            signatures.build(),
            Box::new(SelfKiller { boom, actor: None }),
        )
        .unwrap();
    executor.run_until_idle();

    let in_flight = spawned.actor.post(boom, vec![]).unwrap();
    let queued_a = spawned.actor.post(plain, vec![]).unwrap();
    let queued_b = spawned.actor.post(plain, vec![]).unwrap();
    executor.run_until_idle();

    // The interrupted call's computed value is discarded.
    assert!(in_flight.is_cancelled());
    assert!(queued_a.is_cancelled());
    assert!(queued_b.is_cancelled());
    assert!(matches!(
        spawned.actor.post(plain, vec![]),
        Err(PostError::DeadActor(DeadActor))
    ));
}

struct Suspender {
    join_two: SignatureId,
    relay: SignatureId,
    chain: SignatureId,
    deps: Arc<Mutex<Vec<Promise<Value>>>>,
}

impl Target for Suspender {
    fn invoke(&mut self, call: Call) -> Ret {
        let deps = self.deps.lock().unwrap().clone();
        if call.signature == self.join_two {
            return Ret::Suspended(Suspension::join(deps, |deps| {
                let total: u64 = deps
                    .iter()
                    .map(|dep| {
                        *dep.try_outcome()
                            .unwrap()
                            .into_result()
                            .unwrap()
                            .downcast_ref::<u64>()
                            .unwrap()
                    })
                    .sum();
                Ret::value(total)
            }));
        }
        if call.signature == self.relay {
            return Ret::Suspended(Suspension::delegate(deps[0].clone()));
        }
        assert_eq!(call.signature, self.chain);
        let second = deps[1].clone();
        Ret::Suspended(Suspension::join(vec![deps[0].clone()], move |_| {
            // Not done yet: suspend again on the second dependency.
            Ret::Suspended(Suspension::delegate(second))
        }))
    }
}

struct SuspendHarness {
    executor: Arc<ManualExecutor>,
    spawned: turnstile_runtime::Spawned,
    join_two: SignatureId,
    relay: SignatureId,
    chain: SignatureId,
    deps: Vec<Promise<Value>>,
}

fn suspend_setup() -> SuspendHarness {
    let mut signatures = RegistryBuilder::new();
    let join_two = signatures.declare("join_two", 0, Flags::default());
    let relay = signatures.declare("relay", 0, Flags::default());
    let chain = signatures.declare("chain", 0, Flags::default());
    let executor = Arc::new(ManualExecutor::new());
    let runtime = Runtime::new(executor.clone());
    let deps: Vec<Promise<Value>> = vec![Promise::new(), Promise::new()];
    let spawned = runtime
        .spawn(
            "suspender",
            signatures.build(),
            Box::new(Suspender {
                join_two,
                relay,
                chain,
                deps: Arc::new(Mutex::new(deps.clone())),
            }),
        )
        .unwrap();
    executor.run_until_idle();
    SuspendHarness {
        executor,
        spawned,
        join_two,
        relay,
        chain,
        deps,
    }
}

#[test]
fn join_resolves_only_after_every_dependency() {
    let h = suspend_setup();
    let cell = h.spawned.actor.post(h.join_two, vec![]).unwrap();
    h.executor.run_until_idle();
    assert!(!cell.is_done());

    h.deps[0].complete(value(4u64));
    h.executor.run_until_idle();
    // One of two dependencies done: still waiting for the rest.
    assert!(!cell.is_done());

    h.deps[1].complete(value(5u64));
    h.executor.run_until_idle();
    assert_eq!(*cell.get().unwrap().downcast_ref::<u64>().unwrap(), 9);
}

#[test]
fn join_result_is_independent_of_resolution_order() {
    let h = suspend_setup();
    let cell = h.spawned.actor.post(h.join_two, vec![]).unwrap();
    h.executor.run_until_idle();

    h.deps[1].complete(value(5u64));
    h.executor.run_until_idle();
    assert!(!cell.is_done());

    h.deps[0].complete(value(4u64));
    h.executor.run_until_idle();
    assert_eq!(*cell.get().unwrap().downcast_ref::<u64>().unwrap(), 9);
}

#[test]
fn delegation_returns_the_dependency_value_verbatim() {
    let h = suspend_setup();
    let cell = h.spawned.actor.post(h.relay, vec![]).unwrap();
    h.executor.run_until_idle();
    assert!(!cell.is_done());

    h.deps[0].complete(value("payload"));
    h.executor.run_until_idle();
    assert_eq!(
        *cell.get().unwrap().downcast_ref::<&'static str>().unwrap(),
        "payload"
    );
}

#[test]
fn a_continuation_may_suspend_again() {
    let h = suspend_setup();
    let cell = h.spawned.actor.post(h.chain, vec![]).unwrap();
    h.executor.run_until_idle();

    h.deps[0].complete(value(1u64));
    h.executor.run_until_idle();
    // The continuation re-suspended on the second dependency.
    assert!(!cell.is_done());

    h.deps[1].complete(value(2u64));
    h.executor.run_until_idle();
    assert_eq!(*cell.get().unwrap().downcast_ref::<u64>().unwrap(), 2);
}

#[test]
fn killing_the_actor_fails_pending_continuations() {
    let h = suspend_setup();
    let cell = h.spawned.actor.post(h.relay, vec![]).unwrap();
    h.executor.run_until_idle();
    assert!(!cell.is_done());

    h.spawned.actor.kill();
    h.deps[0].complete(value(1u64));
    h.executor.run_until_idle();

    match cell.get() {
        Err(turnstile_runtime::GetError::Failed(failure)) => {
            assert!(failure.downcast_ref::<DeadActor>().is_some());
        }
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("unexpected value"),
    }
}

#[test]
fn posted_tasks_queue_like_invocations_but_skip_the_target() {
    let mut signatures = RegistryBuilder::new();
    let ordinary = signatures.declare("ordinary", 1, Flags::default());
    let executor = Arc::new(ManualExecutor::new());
    let runtime = Runtime::new(executor.clone());
    let order = Arc::new(Mutex::new(Vec::new()));
    let spawned = runtime
        .spawn(
            "tasks",
            signatures.build(),
            Box::new(OrderRecorder { order: order.clone() }),
        )
        .unwrap();

    spawned.actor.post(ordinary, vec![value("first")]).unwrap();
    let task_order = order.clone();
    let task_cell = spawned
        .actor
        .post_task(move || {
            task_order.lock().unwrap().push("task".to_string());
            Ret::value(11u8)
        })
        .unwrap();
    spawned.actor.post(ordinary, vec![value("second")]).unwrap();
    executor.run_until_idle();

    assert_eq!(*order.lock().unwrap(), ["first", "task", "second"]);
    assert_eq!(*task_cell.get().unwrap().downcast_ref::<u8>().unwrap(), 11);
}
