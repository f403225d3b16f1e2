use std::cell::{Cell, RefCell};
use std::io::Write;
use std::net::{TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use lightev::{Event, EventFlags, EventQueue, LoopFlags, QueueConfig, TimerHandler};

use log::debug;

#[test]
fn timers_fire_in_deadline_order() {
    let _ = env_logger::try_init();
    let queue = EventQueue::new().unwrap();

    let order = Rc::new(RefCell::new(Vec::new()));

    let slow = {
        let order = order.clone();
        Event::new_timer(&queue, EventFlags::NONE, TimerHandler::new(move || {
            order.borrow_mut().push("slow");
        }))
    };
    let fast = {
        let order = order.clone();
        Event::new_timer(&queue, EventFlags::NONE, TimerHandler::new(move || {
            order.borrow_mut().push("fast");
        }))
    };

    slow.add_timeout(Duration::from_millis(60)).unwrap();
    fast.add_timeout(Duration::from_millis(10)).unwrap();

    queue.dispatch().unwrap();
    assert_eq!(*order.borrow(), ["fast", "slow"]);
}

#[test]
fn persistent_timer_repeats_until_removed() {
    let _ = env_logger::try_init();
    let queue = EventQueue::new().unwrap();

    let ticks = Rc::new(Cell::new(0u32));
    let tick = {
        let ticks = ticks.clone();
        Event::new_timer(&queue, EventFlags::PERSIST, TimerHandler::new(move || {
            ticks.set(ticks.get() + 1);
        }))
    };
    tick.add_timeout(Duration::from_millis(5)).unwrap();

    queue.dispatch_timeout(Duration::from_millis(100)).unwrap();
    debug!("ticks: {}", ticks.get());
    assert!(ticks.get() >= 3, "persistent timer fired {} times", ticks.get());

    tick.remove();
    assert_eq!(queue.num_events(), 0);
}

#[test]
fn rearming_is_idempotent() {
    let queue = EventQueue::new().unwrap();

    let timer = Event::new_timer(&queue, EventFlags::NONE, TimerHandler::new(|| {}));
    timer.add_timeout(Duration::from_secs(10)).unwrap();
    timer.add_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(queue.num_events(), 1);
    assert!(timer.pending(EventFlags::TIMEOUT));
    assert!(timer.time_remaining().unwrap() <= Duration::from_secs(10));

    timer.remove();
    assert_eq!(queue.num_events(), 0);
    assert!(!timer.pending(EventFlags::TIMEOUT));
}

#[test]
fn inline_event_never_created_is_harmless() {
    let slot = lightev::InlineEvent::default();
    assert!(slot.is_empty());
    slot.remove();
    drop(slot);
}

#[test]
fn priorities_run_low_numbers_first() {
    let _ = env_logger::try_init();
    let queue = QueueConfig::new().priorities(4).build().unwrap();
    assert_eq!(queue.num_priorities(), 4);

    let order = Rc::new(RefCell::new(Vec::new()));

    let late = {
        let order = order.clone();
        Event::new_timer(&queue, EventFlags::NONE, TimerHandler::new(move || {
            order.borrow_mut().push(3);
        }))
    };
    late.set_priority(3);

    let early = {
        let order = order.clone();
        Event::new_timer(&queue, EventFlags::NONE, TimerHandler::new(move || {
            order.borrow_mut().push(0);
        }))
    };

    // activate in reverse priority order; dispatch must reorder
    late.active(EventFlags::TIMEOUT);
    early.active(EventFlags::TIMEOUT);

    queue.run_loop(LoopFlags::ONCE).unwrap();
    assert_eq!(*order.borrow(), [0, 3]);
}

#[test]
fn break_stops_the_loop_and_is_reported() {
    let queue = Rc::new(EventQueue::new().unwrap());

    let tick = Event::new_timer(&queue, EventFlags::PERSIST, {
        let queue = queue.clone();
        TimerHandler::new(move || queue.break_loop())
    });
    tick.add_timeout(Duration::from_millis(1)).unwrap();

    let started = Instant::now();
    queue.dispatch().unwrap();
    assert!(queue.stopped());
    assert!(started.elapsed() < Duration::from_secs(5));

    // a run that drains normally clears the flag
    tick.remove();
    queue.once(None, || {}).unwrap();
    queue.dispatch().unwrap();
    assert!(!queue.stopped());
}

#[test]
fn dispatch_timeout_returns_once_work_drains() {
    let _ = env_logger::try_init();
    let queue = EventQueue::new().unwrap();

    let ran = Rc::new(Cell::new(false));
    {
        let ran = ran.clone();
        queue.once(None, move || ran.set(true)).unwrap();
    }

    // the limit is an upper bound, not a running time
    let started = Instant::now();
    let drained = queue.dispatch_timeout(Duration::from_millis(500)).unwrap();

    assert!(ran.get());
    assert!(drained, "the loop drained, no break fired");
    assert!(
        started.elapsed() < Duration::from_millis(200),
        "an empty queue must not wait out the limit"
    );
    assert_eq!(queue.num_events(), 0);
}

#[test]
fn once_fd_fires_on_readable() {
    let _ = env_logger::try_init();
    let queue = EventQueue::new().unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let peer = std::thread::spawn(move || {
        let (mut sock, _) = listener.accept().unwrap();
        sock.write_all(b"x").unwrap();
        sock
    });

    let conn = TcpStream::connect(addr).unwrap();
    conn.set_nonblocking(true).unwrap();

    let fired = Rc::new(Cell::new(EventFlags::NONE));
    {
        let fired = fired.clone();
        queue
            .once_fd(conn.as_raw_fd(), EventFlags::READ, None, move |_, what| {
                fired.set(what);
            })
            .unwrap();
    }

    queue.dispatch().unwrap();
    assert!(fired.get().contains(EventFlags::READ));
    let _ = peer.join().unwrap();
}

#[test]
fn once_runs_immediately_without_delay() {
    let queue = EventQueue::new().unwrap();

    let ran = Rc::new(Cell::new(false));
    {
        let ran = ran.clone();
        queue.once(None, move || ran.set(true)).unwrap();
    }
    queue.dispatch().unwrap();
    assert!(ran.get());
}

#[test]
fn waker_injects_work_from_another_thread() {
    let _ = env_logger::try_init();
    let queue = QueueConfig::new().enable_threads().build().unwrap();
    let waker = queue.waker();

    let hits = Arc::new(AtomicUsize::new(0));
    let injector = {
        let hits = hits.clone();
        std::thread::spawn(move || {
            for _ in 0..3 {
                let hits = hits.clone();
                assert!(waker.defer(move || {
                    hits.fetch_add(1, Ordering::SeqCst);
                }));
            }
        })
    };
    injector.join().unwrap();

    queue.dispatch().unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}

#[test]
fn deferred_panic_reaches_the_error_sink() {
    let _ = env_logger::try_init();
    let queue = QueueConfig::new().enable_threads().build().unwrap();
    let waker = queue.waker();

    let payloads = Rc::new(RefCell::new(Vec::new()));
    {
        let payloads = payloads.clone();
        queue.set_error_sink(move |p| payloads.borrow_mut().push(p));
    }

    std::thread::spawn(move || {
        waker.defer(|| panic!("worker exploded"));
    })
    .join()
    .unwrap();

    queue.dispatch().unwrap();

    let payloads = payloads.borrow();
    assert_eq!(payloads.len(), 1);
    assert_eq!(
        payloads[0].downcast_ref::<&str>(),
        Some(&"worker exploded")
    );
}

#[test]
fn once_to_runs_on_the_target_queue() {
    let _ = env_logger::try_init();
    let source = EventQueue::new().unwrap();
    let target = QueueConfig::new().enable_threads().build().unwrap();
    let waker = target.waker();

    let payloads = Rc::new(RefCell::new(Vec::new()));
    {
        let payloads = payloads.clone();
        target.set_error_sink(move |p| payloads.borrow_mut().push(p));
    }

    let hits = Arc::new(AtomicUsize::new(0));
    {
        let hits = hits.clone();
        source
            .once_to(&waker, None, move || {
                hits.fetch_add(1, Ordering::SeqCst);
                panic!("handoff exploded");
            })
            .unwrap();
    }

    // the source dispatch only hands the closure over
    source.dispatch().unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 0);

    // the target runs it, and owns the panic
    target.dispatch().unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    let payloads = payloads.borrow();
    assert_eq!(payloads.len(), 1);
    assert_eq!(
        payloads[0].downcast_ref::<&str>(),
        Some(&"handoff exploded")
    );
}

#[test]
fn once_to_reports_a_dead_target() {
    let _ = env_logger::try_init();
    let source = EventQueue::new().unwrap();

    let target = QueueConfig::new().enable_threads().build().unwrap();
    let waker = target.waker();
    drop(target);

    let reported = Rc::new(Cell::new(0u32));
    {
        let reported = reported.clone();
        source.set_error_sink(move |_| reported.set(reported.get() + 1));
    }

    source.once_to(&waker, None, || {}).unwrap();
    source.dispatch().unwrap();
    assert_eq!(reported.get(), 1);
}

#[test]
fn defer_on_a_dead_queue_returns_false() {
    let queue = QueueConfig::new().enable_threads().build().unwrap();
    let waker = queue.waker();
    drop(queue);
    assert!(!waker.defer(|| {}));
}
