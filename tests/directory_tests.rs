use quarry::error::SchedulerError;
use quarry::scheduler::ShiftbossDirectory;

#[test]
fn capacity_round_trip() {
    let mut directory = ShiftbossDirectory::new();
    let index = directory.add_shiftboss(7, 3);

    assert_eq!(directory.len(), 1);
    assert_eq!(directory.client_id(index).unwrap(), 7);
    assert_eq!(directory.capacity(index).unwrap(), 3);
    assert!(!directory.has_reached_capacity(index).unwrap());

    for _ in 0..3 {
        directory.increment_queued(index).unwrap();
    }
    assert_eq!(directory.num_queued(index).unwrap(), 3);
    assert!(directory.has_reached_capacity(index).unwrap());
    assert!(!directory.has_available_capacity());

    for _ in 0..3 {
        directory.decrement_queued(index).unwrap();
    }
    assert_eq!(directory.num_queued(index).unwrap(), 0);
    assert!(!directory.has_reached_capacity(index).unwrap());
    assert!(directory.has_available_capacity());
}

#[test]
fn decrement_below_zero_is_an_error() {
    let mut directory = ShiftbossDirectory::new();
    let index = directory.add_shiftboss(1, 2);

    assert!(matches!(
        directory.decrement_queued(index),
        Err(SchedulerError::QueuedCountUnderflow(0))
    ));
}

#[test]
fn unknown_index_is_an_error() {
    let directory = ShiftbossDirectory::new();
    assert!(matches!(
        directory.capacity(4),
        Err(SchedulerError::UnknownShiftboss(4))
    ));
}

#[test]
fn least_loaded_prefers_emptier_workers() {
    let mut directory = ShiftbossDirectory::new();
    let a = directory.add_shiftboss(1, 2);
    let b = directory.add_shiftboss(2, 2);

    directory.increment_queued(a).unwrap();
    assert_eq!(directory.least_loaded_below_capacity(), Some(b));

    directory.increment_queued(b).unwrap();
    directory.increment_queued(b).unwrap();
    // b is full; a still has one slot.
    assert_eq!(directory.least_loaded_below_capacity(), Some(a));

    directory.increment_queued(a).unwrap();
    assert_eq!(directory.least_loaded_below_capacity(), None);
}

#[test]
fn add_queued_counts_in_bulk() {
    let mut directory = ShiftbossDirectory::new();
    let index = directory.add_shiftboss(9, 10);

    directory.add_queued(index, 4).unwrap();
    assert_eq!(directory.num_queued(index).unwrap(), 4);
    directory.decrement_queued(index).unwrap();
    assert_eq!(directory.num_queued(index).unwrap(), 3);
}
