//! Integration Tests for the Incremental Graph
//!
//! These tests verify that atoms, derivations, lenses, sources, transactions
//! and reactors work together correctly through the public API only.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use ripple_core::{Derivable, Error, Graph, GraphConfig, Result, SourceHooks, SourceTrigger, State};
use tracing_subscriber::EnvFilter;

/// Route engine events to the test output when `RUST_LOG` is set.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Collect every value a node delivers.
fn record<T: Clone + 'static>(
    node: &Derivable<T>,
) -> (Rc<RefCell<Vec<T>>>, ripple_core::Subscription) {
    let seen = Rc::new(RefCell::new(Vec::new()));
    let log = Rc::clone(&seen);
    let subscription = node.react(move |value| log.borrow_mut().push(value));
    (seen, subscription)
}

/// Test that a derivation follows the atom it reads.
#[test]
fn derivation_follows_its_atom() {
    init_tracing();
    let graph = Graph::new();
    let a = graph.atom(1);
    let d = a.derive(|v| Ok(v * 2));

    assert_eq!(d.get(), Ok(2));
    a.set(2).unwrap();
    assert_eq!(d.get(), Ok(4));
}

/// Test that a transaction notifies once, with the final value.
#[test]
fn transaction_notifies_once_with_final_value() {
    init_tracing();
    let graph = Graph::new();
    let a = graph.atom(1);
    let (seen, _subscription) = record(&a);
    assert_eq!(*seen.borrow(), vec![1]);

    graph
        .transact(|| {
            a.set(2)?;
            a.set(3)
        })
        .unwrap();

    assert_eq!(*seen.borrow(), vec![1, 3]);
}

/// Test that an aborted inner transaction restores the outer one's write.
#[test]
fn inner_abort_restores_outer_state() {
    init_tracing();
    let graph = Graph::new();
    let a = graph.atom("initial");

    graph
        .transact(|| {
            a.set("outer")?;
            let inner = graph.transact(|| {
                a.set("inner")?;
                Err::<(), _>(Error::msg("abort"))
            });
            assert_eq!(inner, Err(Error::msg("abort")));
            assert_eq!(a.get(), Ok("outer"));
            Ok::<_, Error>(())
        })
        .unwrap();

    assert_eq!(a.get(), Ok("outer"));
}

/// Test that setting a plucked entry to its current value leaves the base
/// untouched.
#[test]
fn plucked_no_op_write_keeps_base_version() {
    init_tracing();
    let graph = Graph::new();
    let base = graph.atom(HashMap::from([("k", "v")]));
    let entry = base.pluck("k");
    let version = base.version();

    entry.set("v").unwrap();

    assert_eq!(base.version(), version);
    assert_eq!(entry.get(), Ok("v"));
}

/// Test that an unresolved atom makes its derivations unresolved until set.
#[test]
fn unresolved_propagates_until_set() {
    init_tracing();
    let graph = Graph::new();
    let a = graph.unresolved_atom::<i32>();
    let d = a.derive(|v| Ok(v + 1));

    assert!(!d.is_resolved());
    assert_eq!(d.get(), Err(Error::Unresolved));

    a.set(1).unwrap();
    assert_eq!(d.get(), Ok(2));
}

/// Test that a derivation over final inputs becomes final and lets go of them.
#[test]
fn derivation_over_final_inputs_becomes_final() {
    init_tracing();
    let graph = Graph::new();
    let x = graph.atom(1);
    let y = graph.atom(2);
    let sum = x.derive_with(y.clone(), |x, y| Ok(x + y));
    let (seen, subscription) = record(&sum);
    assert_eq!(x.observer_count(), 1);

    x.set_final(1).unwrap();
    assert!(!sum.is_final());

    y.set_final(2).unwrap();
    assert_eq!(sum.get(), Ok(3));
    assert!(sum.is_final());
    assert!(sum.dependencies().is_empty());
    assert_eq!(x.observer_count(), 0);
    assert_eq!(y.observer_count(), 0);

    // A final node never changes again, so its reactor has nothing left to do.
    assert!(!subscription.is_active());
    assert_eq!(*seen.borrow(), vec![3]);
    assert_eq!(x.set(5), Err(Error::Finalized(x.id())));
}

/// Test that finality earned inside an aborted transaction is not lost.
#[test]
fn finality_survives_an_aborted_transaction() {
    init_tracing();
    let graph = Graph::new();
    let a = graph.constant(1);
    let b = graph.constant(2);
    let sum = a.derive_with(b.clone(), |a, b| Ok(a + b));

    let outcome: Result<()> = graph.transact(|| {
        sum.react(|_| {}).detach();
        Err(Error::msg("rolled back"))
    });

    assert_eq!(outcome, Err(Error::msg("rolled back")));
    assert!(sum.is_final());
    assert!(sum.dependencies().is_empty());
    assert_eq!(a.observer_count(), 0);
    assert_eq!(b.observer_count(), 0);
    assert_eq!(sum.get(), Ok(3));

    // A rolled-back set_final is still undone.
    let x = graph.atom(1);
    let doubled = x.derive(|x| Ok(x * 2));
    let _subscription = doubled.react(|_| {});
    let outcome: Result<()> = graph.transact(|| {
        x.set_final(4)?;
        Err(Error::msg("rolled back"))
    });

    assert!(outcome.is_err());
    assert!(!x.is_final());
    assert!(!doubled.is_final());
    assert_eq!(x.observer_count(), 1);
    assert_eq!(doubled.get(), Ok(2));
}

/// Test that writing an equal value changes nothing observable.
#[test]
fn idempotent_set_is_silent() {
    let graph = Graph::new();
    let a = graph.atom(7);
    let (seen, _subscription) = record(&a);
    let version = a.version();

    a.set(7).unwrap();

    assert_eq!(a.version(), version);
    assert_eq!(*seen.borrow(), vec![7]);
}

/// Test that accepted writes always move the version forward.
#[test]
fn versions_only_move_forward() {
    let graph = Graph::new();
    let a = graph.atom(0);
    let mut last = a.version();

    for n in 1..20 {
        a.set(n).unwrap();
        assert!(a.version() > last);
        last = a.version();
    }
}

/// Test that nested transactions roll back exactly at every depth.
#[test]
fn rollback_at_depth() {
    let graph = Graph::new();
    let a = graph.atom(0);
    let b = graph.atom(0);
    let total = a.derive_with(b.clone(), |a, b| Ok(a + b));
    let (seen, _subscription) = record(&total);

    let result = graph.transact(|| {
        a.set(1)?;
        graph.transact(|| {
            b.set(2)?;
            graph.transact(|| {
                a.set(3)?;
                b.set(4)?;
                Ok::<_, Error>(())
            })?;
            assert_eq!(total.get(), Ok(7));
            Err::<(), _>(Error::msg("undo the middle"))
        })?;
        Ok::<_, Error>(())
    });

    assert_eq!(result, Err(Error::msg("undo the middle")));
    assert_eq!(a.get(), Ok(0));
    assert_eq!(b.get(), Ok(0));
    assert_eq!(total.get(), Ok(0));
    assert_eq!(*seen.borrow(), vec![0]);
}

/// Test that a rolled-back inner scope still lets the outer commit the rest.
#[test]
fn partial_rollback_commits_surviving_writes() {
    let graph = Graph::new();
    let a = graph.atom(0);
    let b = graph.atom(0);
    let (seen_a, _sub_a) = record(&a);
    let (seen_b, _sub_b) = record(&b);

    graph
        .transact(|| {
            a.set(1)?;
            let _ = graph.transact(|| {
                b.set(1)?;
                Err::<(), _>(Error::msg("drop b"))
            });
            Ok::<_, Error>(())
        })
        .unwrap();

    assert_eq!(*seen_a.borrow(), vec![0, 1]);
    assert_eq!(*seen_b.borrow(), vec![0]);
}

/// Test that a derivation depends on exactly what it read last time.
#[test]
fn dependencies_follow_branches() {
    let graph = Graph::new();
    let flag = graph.atom(true);
    let x = graph.atom("x");
    let y = graph.atom("y");
    let pick = {
        let (flag, x, y) = (flag.clone(), x.clone(), y.clone());
        graph.derive(move || if flag.get()? { x.get() } else { y.get() })
    };
    let (seen, _subscription) = record(&pick);

    assert_eq!(pick.dependencies(), vec![flag.id(), x.id()]);
    assert!(x.is_connected());
    assert!(!y.is_connected());

    flag.set(false).unwrap();
    assert_eq!(pick.dependencies(), vec![flag.id(), y.id()]);
    assert!(!x.is_connected());
    assert!(y.is_connected());

    x.set("ignored").unwrap();
    y.set("why").unwrap();
    assert_eq!(*seen.borrow(), vec!["x", "y", "why"]);
}

/// Test that a diamond recomputes its bottom once per change.
#[test]
fn diamond_recomputes_once() {
    let graph = Graph::new();
    let a = graph.atom(1);
    let left = a.map(|v| v + 1);
    let right = a.map(|v| v * 10);
    let runs = Rc::new(Cell::new(0));
    let bottom = {
        let runs = Rc::clone(&runs);
        left.derive_with(right.clone(), move |l, r| {
            runs.set(runs.get() + 1);
            Ok(l + r)
        })
    };
    let (seen, _subscription) = record(&bottom);

    a.set(2).unwrap();

    assert_eq!(*seen.borrow(), vec![12, 23]);
    assert_eq!(runs.get(), 2);
}

/// Test that an unchanged intermediate result stops propagation.
#[test]
fn equal_intermediate_values_cut_off_propagation() {
    let graph = Graph::new();
    let a = graph.atom(3);
    let parity = a.map(|v| v % 2);
    let runs = Rc::new(Cell::new(0));
    let label = {
        let runs = Rc::clone(&runs);
        parity.map(move |p| {
            runs.set(runs.get() + 1);
            if p == 0 { "even" } else { "odd" }
        })
    };
    let _subscription = label.react(|_| {});

    a.set(5).unwrap();
    a.set(7).unwrap();

    assert_eq!(runs.get(), 1);
    assert_eq!(label.get(), Ok("odd"));
}

/// Test that nodes disconnect as soon as their last observer goes away.
#[test]
fn dropping_the_subscription_disconnects_the_chain() {
    let graph = Graph::new();
    let a = graph.atom(1);
    let b = a.map(|v| v + 1);
    let c = b.map(|v| v * 2);

    let subscription = c.react(|_| {});
    assert!(a.is_connected() && b.is_connected() && c.is_connected());
    assert_eq!(graph.active_reactors(), 1);

    drop(subscription);
    assert!(!a.is_connected());
    assert!(!b.is_connected());
    assert!(!c.is_connected());
    assert_eq!(a.observer_count(), 0);
    assert_eq!(graph.active_reactors(), 0);
}

/// Test that autoCache nodes stay connected until the tick boundary.
#[test]
fn auto_cached_nodes_disconnect_on_flush() {
    let graph = Graph::new();
    let a = graph.atom(1);
    let cached = a.map(|v| v * 3).auto_cache();

    let subscription = cached.react(|_| {});
    drop(subscription);

    assert!(cached.is_connected());
    assert_eq!(graph.pending_disconnects(), 1);

    assert_eq!(graph.flush_pending_disconnects(), 1);
    assert!(!cached.is_connected());
    assert!(!a.is_connected());
    assert_eq!(graph.pending_disconnects(), 0);
}

/// Test that a new observer inside the grace period cancels the disconnect.
#[test]
fn auto_cached_nodes_survive_a_quick_resubscribe() {
    let graph = Graph::new();
    let a = graph.atom(1);
    let cached = a.map(|v| v * 3).auto_cache();

    drop(cached.react(|_| {}));
    let _again = cached.react(|_| {});

    assert_eq!(graph.flush_pending_disconnects(), 0);
    assert!(cached.is_connected());
}

/// Test that the commit-time flush option clears the batch without a tick.
#[test]
fn commit_flush_option_disconnects_after_transactions() {
    let graph = Graph::with_config(GraphConfig {
        flush_disconnects_on_commit: true,
        ..GraphConfig::default()
    });
    let a = graph.atom(1);
    let cached = a.map(|v| v + 1).auto_cache();

    drop(cached.react(|_| {}));
    assert!(cached.is_connected());

    a.set(2).unwrap();
    assert!(!cached.is_connected());
}

/// Test that self-reference is reported as a cycle instead of overflowing.
#[test]
fn cycles_are_rejected() {
    init_tracing();
    let graph = Graph::new();
    let slot: Rc<RefCell<Option<Derivable<i32>>>> = Rc::new(RefCell::new(None));
    let looping = {
        let slot = Rc::clone(&slot);
        graph.derive(move || {
            let this = slot.borrow().clone();
            match this {
                Some(this) => this.get().map(|v| v + 1),
                None => Ok(0),
            }
        })
    };
    *slot.borrow_mut() = Some(looping.clone());

    assert_eq!(looping.get(), Err(Error::Cycle(looping.id())));
    slot.borrow_mut().take();
}

/// Test that mutual recursion between two derivations is a cycle too.
#[test]
fn mutual_cycles_are_rejected() {
    let graph = Graph::new();
    let slot: Rc<RefCell<Option<Derivable<i32>>>> = Rc::new(RefCell::new(None));
    let first = {
        let slot = Rc::clone(&slot);
        graph.derive(move || {
            let second = slot.borrow().clone();
            second.map_or(Ok(0), |second| second.get())
        })
    };
    let second = first.map(|v| v + 1);
    *slot.borrow_mut() = Some(second.clone());

    assert_eq!(first.get(), Err(Error::Cycle(first.id())));
    assert!(second.is_errored());
    slot.borrow_mut().take();
}

/// Test that errors are cached and recovered from.
#[test]
fn errors_are_cached_until_inputs_change() {
    let graph = Graph::new();
    let input = graph.atom(-1);
    let runs = Rc::new(Cell::new(0));
    let checked = {
        let runs = Rc::clone(&runs);
        input.derive(move |v| {
            runs.set(runs.get() + 1);
            if v < 0 {
                Err(Error::msg("negative"))
            } else {
                Ok(v)
            }
        })
    };
    let errors = Rc::new(RefCell::new(Vec::new()));
    let _subscription = {
        let errors = Rc::clone(&errors);
        checked.react_with(
            |_| {},
            ripple_core::ReactorOptions::new()
                .on_error(move |error| errors.borrow_mut().push(error)),
        )
    };

    assert_eq!(checked.get(), Err(Error::msg("negative")));
    assert_eq!(checked.get(), Err(Error::msg("negative")));
    assert_eq!(runs.get(), 1);

    input.set(4).unwrap();
    assert_eq!(checked.get(), Ok(4));
    assert_eq!(*errors.borrow(), vec![Error::msg("negative")]);
}

/// Test that a reactor without an error handler stops on failure.
#[test]
fn unhandled_errors_stop_the_reactor() {
    init_tracing();
    let graph = Graph::new();
    let input = graph.atom(1);
    let checked = input.derive(|v| if v == 0 { Err(Error::msg("zero")) } else { Ok(10 / v) });
    let (seen, subscription) = record(&checked);

    input.set(0).unwrap();
    assert!(!subscription.is_active());

    input.set(2).unwrap();
    assert_eq!(*seen.borrow(), vec![10]);
}

/// Test the reactor gates working together.
#[test]
fn reactor_gates() {
    let graph = Graph::new();
    let value = graph.atom(0);
    let ready = graph.atom(false);
    let paused = graph.atom(false);
    let done = graph.atom(false);
    let seen = Rc::new(RefCell::new(Vec::new()));

    let subscription = {
        let seen = Rc::clone(&seen);
        value.react_with(
            move |v| seen.borrow_mut().push(v),
            ripple_core::ReactorOptions::new()
                .from(ready.clone())
                .when(paused.map(|p| !p))
                .until(done.clone()),
        )
    };

    value.set(1).unwrap();
    ready.set(true).unwrap();
    value.set(2).unwrap();
    paused.set(true).unwrap();
    value.set(3).unwrap();
    paused.set(false).unwrap();
    done.set(true).unwrap();
    value.set(4).unwrap();

    assert_eq!(*seen.borrow(), vec![1, 2, 3]);
    assert!(!subscription.is_active());
}

/// Test that reactions can write back into the graph.
#[test]
fn reactions_may_write_to_other_atoms() {
    let graph = Graph::new();
    let celsius = graph.atom(0.0_f64);
    let display = graph.atom(String::new());
    let _sync = {
        let display = display.clone();
        celsius.react(move |c| {
            let _ = display.set(format!("{c:.1}°C"));
        })
    };
    let (seen, _subscription) = record(&display);

    celsius.set(21.5).unwrap();
    assert_eq!(display.get().unwrap(), "21.5°C");
    assert_eq!(seen.borrow().last().map(String::as_str), Some("21.5°C"));
}

/// Test that a reactor feeding itself is cut off by the pass budget.
#[test]
fn runaway_reactors_hit_the_budget() {
    init_tracing();
    let graph = Graph::with_config(GraphConfig {
        max_reactions_per_pass: 5,
        ..GraphConfig::default()
    });
    let a = graph.atom(0);
    let runs = Rc::new(Cell::new(0));
    let _subscription = {
        let (writer, runs) = (a.clone(), Rc::clone(&runs));
        a.react(move |v| {
            runs.set(runs.get() + 1);
            let _ = writer.set(v + 1);
        })
    };

    assert_eq!(runs.get(), 5);
    assert_eq!(a.get(), Ok(5));
}

/// A producer driven by hand.
#[derive(Default)]
struct Ticker {
    now: Cell<u64>,
    trigger: RefCell<Option<SourceTrigger>>,
    connects: Cell<usize>,
}

impl Ticker {
    fn advance(&self) {
        self.now.set(self.now.get() + 1);
        let trigger = self.trigger.borrow().clone();
        if let Some(trigger) = trigger {
            trigger.check_for_changes();
        }
    }
}

struct TickerHooks(Rc<Ticker>);

impl SourceHooks<u64> for TickerHooks {
    fn calculate(&self) -> Result<u64> {
        Ok(self.0.now.get())
    }

    fn on_connect(&self, trigger: SourceTrigger) {
        self.0.connects.set(self.0.connects.get() + 1);
        *self.0.trigger.borrow_mut() = Some(trigger);
    }

    fn on_disconnect(&self) {
        self.0.trigger.borrow_mut().take();
    }
}

/// Test that a source pushes into derivations while connected.
#[test]
fn sources_feed_the_graph() {
    let graph = Graph::new();
    let ticker = Rc::new(Ticker::default());
    let clock = graph.source(TickerHooks(Rc::clone(&ticker)));
    let even = clock.map(|t| t % 2 == 0);
    let (seen, subscription) = record(&even);

    ticker.advance();
    ticker.advance();
    ticker.advance();
    assert_eq!(*seen.borrow(), vec![true, false, true, false]);
    assert_eq!(ticker.connects.get(), 1);

    drop(subscription);
    assert!(ticker.trigger.borrow().is_none());

    ticker.advance();
    assert_eq!(clock.get(), Ok(4));
}

/// Test that source changes made in a rolled-back transaction are undone.
#[test]
fn source_changes_roll_back() {
    let graph = Graph::new();
    let ticker = Rc::new(Ticker::default());
    let clock = graph.source(TickerHooks(Rc::clone(&ticker)));
    let _subscription = clock.react(|_| {});

    let result = graph.transact(|| {
        ticker.advance();
        assert_eq!(clock.get(), Ok(1));
        Err::<(), _>(Error::msg("rewind"))
    });

    assert!(result.is_err());
    assert_eq!(clock.state(), State::Value(0));
}

/// Test that a lens update inside a transaction is visible to its readers
/// only after commit.
#[test]
fn lens_writes_join_transactions() {
    let graph = Graph::new();
    let name = graph.atom("ada".to_string());
    let upper = name.map_with_reverse(|n| n.to_uppercase(), |n| n.to_lowercase());
    let (seen, _subscription) = record(&upper);

    graph
        .transact(|| {
            upper.set("GRACE".to_string())?;
            upper.set("ALAN".to_string())
        })
        .unwrap();

    assert_eq!(name.get().unwrap(), "alan");
    assert_eq!(*seen.borrow(), vec!["ADA".to_string(), "ALAN".to_string()]);
}

/// Test that untracked reads do not become dependencies.
#[test]
fn untracked_reads_are_not_dependencies() {
    let graph = Graph::new();
    let a = graph.atom(1);
    let b = graph.atom(2);
    let sum = {
        let (a, b, handle) = (a.clone(), b.clone(), graph.clone());
        graph.derive(move || Ok(a.get()? + handle.untracked(|| b.get())?))
    };

    assert_eq!(sum.get(), Ok(3));
    assert_eq!(sum.dependencies(), vec![a.id()]);
}

/// Test that nodes are released once every handle is gone.
#[test]
fn dropped_nodes_leave_the_registry() {
    let graph = Graph::new();
    let a = graph.atom(1);
    let before = graph.node_count();

    {
        let doubled = a.map(|v| v * 2);
        let _subscription = doubled.react(|_| {});
        assert_eq!(graph.node_count(), before + 2);
    }

    assert_eq!(graph.node_count(), before);
    assert!(!a.is_connected());
}
