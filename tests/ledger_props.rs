use chrono::Utc;
use proptest::prelude::*;
use std::collections::BTreeSet;

use seat_engine::models::{BookingId, LedgerEntry, ScreeningId, SeatId, SeatState};

#[derive(Debug, Clone)]
enum Op {
    Hold(usize, BTreeSet<u32>),
    Confirm(usize, BTreeSet<u32>),
    Release(usize, BTreeSet<u32>),
}

fn op() -> impl Strategy<Value = Op> {
    let seats = prop::collection::btree_set(0u32..8, 1..4);
    prop_oneof![
        (0usize..4, seats.clone()).prop_map(|(h, s)| Op::Hold(h, s)),
        (0usize..4, seats.clone()).prop_map(|(h, s)| Op::Confirm(h, s)),
        (0usize..4, seats).prop_map(|(h, s)| Op::Release(h, s)),
    ]
}

fn seat_ids(raw: &BTreeSet<u32>) -> BTreeSet<SeatId> {
    raw.iter().map(|n| SeatId::from_position(0, *n)).collect()
}

proptest! {
    #[test]
    fn ledger_invariants_hold_under_any_sequence(ops in prop::collection::vec(op(), 1..60)) {
        let holders: Vec<BookingId> = (0..4).map(|_| BookingId::new()).collect();
        let mut entry = LedgerEntry::grid(ScreeningId(1), 1, 8);
        let expiry = Utc::now();

        for op in ops {
            let before = entry.clone();
            match op {
                Op::Hold(h, raw) => {
                    let seats = seat_ids(&raw);
                    match entry.hold(&seats, holders[h], expiry) {
                        Ok(()) => {
                            for seat in &seats {
                                prop_assert_eq!(entry.state_of(seat).and_then(SeatState::holder), Some(holders[h]));
                            }
                        }
                        Err(_) => prop_assert_eq!(&entry, &before),
                    }
                }
                Op::Confirm(h, raw) => {
                    let seats = seat_ids(&raw);
                    match entry.confirm(&seats, holders[h]) {
                        Ok(()) => {
                            for seat in &seats {
                                prop_assert_eq!(entry.state_of(seat), Some(&SeatState::Booked { holder: holders[h] }));
                            }
                        }
                        Err(_) => prop_assert_eq!(&entry, &before),
                    }
                }
                Op::Release(h, raw) => {
                    let seats = seat_ids(&raw);
                    let freed = entry.release(&seats, holders[h]);
                    for seat in &seats {
                        prop_assert_ne!(entry.state_of(seat).and_then(SeatState::holder), Some(holders[h]));
                    }
                    for (seat, state) in &before.seat_states {
                        if !freed.contains(seat) {
                            prop_assert_eq!(entry.state_of(seat), Some(state));
                        }
                    }
                }
            }

            prop_assert!(entry.within_capacity());
            let a = entry.availability();
            prop_assert_eq!(a.free + a.held + a.booked, a.capacity);
        }
    }
}
