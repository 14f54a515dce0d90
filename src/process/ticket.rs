//! Lottery-ticket priority inheritance.
//!
//! Each process holds a ticket balance; `transfer` lends tickets from one
//! process to another (e.g. a thread blocked on a held futex lends its
//! tickets to the holder so the holder gets scheduled sooner), and `release`
//! is the exact inverse. Records live in a single global arena so both
//! endpoints can reference a transfer by index without holding a pointer
//! into each other's ledger.

use crate::process::task::ProcId;
use alloc::vec::Vec;
use spin::Mutex;

pub struct TicketRecord {
    pub source: ProcId,
    pub target: ProcId,
    pub amount: u32,
}

struct Arena {
    records: Vec<Option<TicketRecord>>,
}

static ARENA: Mutex<Arena> = Mutex::new(Arena { records: Vec::new() });

/// A process's ticket balance plus the set of transfers it's party to, by
/// arena index. `lended` are transfers this process is the source of;
/// `borrowed` are transfers this process is the target of.
pub struct TicketLedger {
    pub tickets: u32,
    pub lended: Vec<usize>,
    pub borrowed: Vec<usize>,
}

impl TicketLedger {
    pub fn new(initial: u32) -> Self {
        Self { tickets: initial, lended: Vec::new(), borrowed: Vec::new() }
    }
}

/// Lend `amount` tickets from `source` to `target`, clamped to what `source`
/// actually holds. Returns the arena index recording the transfer, to be
/// handed back to `release` later.
pub fn transfer(
    source: &mut TicketLedger,
    source_id: ProcId,
    target: &mut TicketLedger,
    target_id: ProcId,
    amount: u32,
) -> usize {
    let amount = amount.min(source.tickets);
    source.tickets -= amount;
    target.tickets += amount;

    let mut arena = ARENA.lock();
    let idx = arena.records.len();
    arena.records.push(Some(TicketRecord { source: source_id, target: target_id, amount }));
    source.lended.push(idx);
    target.borrowed.push(idx);
    idx
}

/// Undo a transfer: remove the record from both ledgers' index lists and
/// move the tickets back to the source.
pub fn release(source: &mut TicketLedger, target: &mut TicketLedger, idx: usize) {
    let mut arena = ARENA.lock();
    if let Some(record) = arena.records[idx].take() {
        source.lended.retain(|&i| i != idx);
        target.borrowed.retain(|&i| i != idx);
        source.tickets += record.amount;
        target.tickets -= record.amount;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_moves_tickets_and_release_is_exact_inverse() {
        let mut a = TicketLedger::new(1000);
        let mut b = TicketLedger::new(1000);
        let idx = transfer(&mut a, 1, &mut b, 2, 300);
        assert_eq!(a.tickets, 700);
        assert_eq!(b.tickets, 1300);
        assert_eq!(a.lended, alloc::vec![idx]);
        assert_eq!(b.borrowed, alloc::vec![idx]);

        release(&mut a, &mut b, idx);
        assert_eq!(a.tickets, 1000);
        assert_eq!(b.tickets, 1000);
        assert!(a.lended.is_empty());
        assert!(b.borrowed.is_empty());
    }

    #[test]
    fn transfer_clamps_to_available_balance() {
        let mut a = TicketLedger::new(100);
        let mut b = TicketLedger::new(0);
        transfer(&mut a, 1, &mut b, 2, 5000);
        assert_eq!(a.tickets, 0);
        assert_eq!(b.tickets, 100);
    }
}
