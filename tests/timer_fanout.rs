//! End-to-end scenario: four one-shot timers at staggered deadlines;
//! polling partway through only the earlier ones should have fired, in
//! deadline order.

use std::time::Duration;

use loomio::eventq::EventQ;

#[test]
fn timers_fire_in_deadline_order_not_registration_order() {
    let mut q: EventQ<&'static str> = EventQ::with_capacity(16).unwrap();

    q.add_timer(Duration::from_millis(30), "c").unwrap();
    q.add_timer(Duration::from_millis(10), "a").unwrap();
    q.add_timer(Duration::from_millis(40), "d").unwrap();
    q.add_timer(Duration::from_millis(20), "b").unwrap();

    std::thread::sleep(Duration::from_millis(25));

    let mut seen = Vec::new();
    let mut record = |t: &&'static str| seen.push(*t);
    let n = q.poll(Some(&mut record)).unwrap();

    assert_eq!(n, 2);
    assert_eq!(seen, vec!["a", "b"]);

    std::thread::sleep(Duration::from_millis(20));
    seen.clear();
    let mut record = |t: &&'static str| seen.push(*t);
    let n = q.poll(Some(&mut record)).unwrap();
    assert_eq!(n, 2);
    assert_eq!(seen, vec!["c", "d"]);
}
