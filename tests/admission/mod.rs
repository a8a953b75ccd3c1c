use std::sync::{Arc, Barrier};
use std::thread;
use ttyjail::admission::{AdmissionConfig, AdmissionController, RejectReason};
use ttyjail::types::JailError;

fn controller(max_connections: u64, once: bool) -> AdmissionController {
    AdmissionController::new(AdmissionConfig {
        max_connections,
        max_weight: 0,
        once,
    })
}

#[test]
fn test_max_connections_two() {
    let admission = controller(2, false);

    let first = admission.try_admit(1).expect("first session should be admitted");
    let second = admission.try_admit(1).expect("second session should be admitted");
    assert_eq!(admission.active_connections(), 2);

    let rejected = admission.try_admit(1).unwrap_err();
    assert_eq!(rejected.reason, RejectReason::TooManyConnections);
    assert_eq!(
        rejected.to_string(),
        "exceeding max number of connections (connections: 3, weight: 3)"
    );
    // the failed attempt does not disturb the two admitted sessions
    assert_eq!(admission.active_connections(), 2);
    assert_eq!(admission.active_weight(), 2);

    drop(first);
    let third = admission.try_admit(1).expect("a slot was freed");
    assert_eq!(third.connections_at_admission(), 2);

    drop(second);
    drop(third);
    assert_eq!(admission.active_connections(), 0);
    assert_eq!(admission.active_weight(), 0);
}

#[test]
fn test_once_mode_admits_exactly_one() {
    const ATTEMPTS: usize = 16;
    let admission = controller(0, true);
    let barrier = Arc::new(Barrier::new(ATTEMPTS));

    let handles: Vec<_> = (0..ATTEMPTS)
        .map(|_| {
            let admission = admission.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                admission.try_admit(1)
            })
        })
        .collect();

    let results: Vec<_> = handles
        .into_iter()
        .map(|h| h.join().expect("admit thread panicked"))
        .collect();

    let accepted = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(accepted, 1);
    for rejected in results.iter().filter_map(|r| r.as_ref().err()) {
        assert_eq!(rejected.reason, RejectReason::ShuttingDown);
    }
    // rejected attempts never touched the counters
    assert_eq!(admission.active_connections(), 1);
}

#[test]
fn test_concurrent_churn_never_leaks() {
    let admission = AdmissionController::new(AdmissionConfig {
        max_connections: 4,
        max_weight: 6,
        once: false,
    });
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let admission = admission.clone();
            thread::spawn(move || {
                let mut admitted = 0u32;
                for _ in 0..200 {
                    if let Ok(ticket) = admission.try_admit(fastrand::u64(1..4)) {
                        assert!(ticket.connections_at_admission() <= 4);
                        assert!(ticket.weight_at_admission() <= 6);
                        admitted += 1;
                    }
                }
                admitted
            })
        })
        .collect();

    let admitted: u32 = handles
        .into_iter()
        .map(|h| h.join().expect("churn thread panicked"))
        .sum();
    assert!(admitted > 0);
    assert_eq!(admission.active_connections(), 0);
    assert_eq!(admission.active_weight(), 0);
}

#[test]
fn test_rejection_is_distinguishable() {
    let admission = controller(1, false);
    let _held = admission.try_admit(1).unwrap();

    let err: JailError = admission.try_admit(1).unwrap_err().into();
    assert!(err.is_rejection());
    assert!(!JailError::Spawn("boom".to_string()).is_rejection());
}
