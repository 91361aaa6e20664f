//! Property-based tests for territory.
//!
//! Random sequences of claims, overclaims, deaths, membership changes and
//! disbands over a small grid; after every step each chunk must have at
//! most one owner and the claim index must equal the union of the
//! factions' claim sets.

mod common;

use std::collections::HashMap;

use common::{Server, chunk};
use factions_core::config::FactionsConfig;
use factions_core::id::FactionId;
use factions_core::test_utils::player;
use proptest::prelude::*;

const PLAYERS: u128 = 6;
const GRID: i32 = 4;

#[derive(Debug, Clone)]
enum Op {
    Found(u128),
    Join(u128, u128),
    Leave(u128),
    Disband(u128),
    Claim(u128, i32, i32),
    Unclaim(u128, i32, i32),
    Overclaim(u128, i32, i32),
    Die(u128),
    Tick,
}

fn arb_ops(max_ops: usize) -> impl Strategy<Value = Vec<Op>> {
    let p = 1..=PLAYERS;
    let c = 0..GRID;
    proptest::collection::vec(
        prop_oneof![
            2 => p.clone().prop_map(Op::Found),
            1 => (p.clone(), p.clone()).prop_map(|(a, b)| Op::Join(a, b)),
            1 => p.clone().prop_map(Op::Leave),
            1 => p.clone().prop_map(Op::Disband),
            6 => (p.clone(), c.clone(), c.clone()).prop_map(|(a, x, z)| Op::Claim(a, x, z)),
            2 => (p.clone(), c.clone(), c.clone()).prop_map(|(a, x, z)| Op::Unclaim(a, x, z)),
            3 => (p.clone(), c.clone(), c.clone()).prop_map(|(a, x, z)| Op::Overclaim(a, x, z)),
            2 => p.prop_map(Op::Die),
            1 => Just(Op::Tick),
        ],
        1..=max_ops,
    )
}

fn small_factions() -> FactionsConfig {
    let mut config = FactionsConfig::default();
    config.power.power_per_claim = 2.0;
    config.claims.max_claims = 8;
    config
}

fn apply(server: &Server, op: &Op, step: usize) {
    let f = &server.factions;
    let registry = f.registry();
    match *op {
        Op::Found(n) => {
            let _ = f.create_faction(player(n), &format!("p{n}"), &format!("Clan{n}x{step}"));
        }
        Op::Join(n, host) => {
            if let Some(id) = registry.faction_id_of(&player(host)) {
                let _ = registry.add_member(id, player(n), &format!("p{n}"));
            }
        }
        Op::Leave(n) => {
            let _ = registry.leave(player(n));
        }
        Op::Disband(n) => {
            let _ = f.disband(player(n));
        }
        Op::Claim(n, x, z) => {
            let _ = f.claim(player(n), chunk(x, z));
        }
        Op::Unclaim(n, x, z) => {
            let _ = f.unclaim(player(n), chunk(x, z));
        }
        Op::Overclaim(n, x, z) => {
            let _ = f.overclaim(player(n), chunk(x, z));
        }
        Op::Die(n) => {
            f.player_died(player(n));
        }
        Op::Tick => {
            f.player_joined(player(1), "p1");
            f.tick();
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Index and claim sets agree after every operation.
    #[test]
    fn claim_index_matches_faction_claims(ops in arb_ops(60)) {
        let server = Server::with_config(small_factions());
        for (step, op) in ops.iter().enumerate() {
            apply(&server, op, step);
            let f = &server.factions;
            prop_assert_eq!(f.claims().verify(f.registry()), Vec::new(), "after {:?}", op);
        }
        server.assert_consistent();
    }

    /// No chunk is ever listed by two factions.
    #[test]
    fn chunks_are_exclusive(ops in arb_ops(60)) {
        let server = Server::with_config(small_factions());
        for (step, op) in ops.iter().enumerate() {
            apply(&server, op, step);
        }
        let mut owners: HashMap<_, FactionId> = HashMap::new();
        for faction in server.factions.registry().all() {
            for chunk in faction.claims.keys() {
                let previous = owners.insert(chunk.clone(), faction.id);
                prop_assert!(previous.is_none(), "{} listed twice", chunk);
            }
        }
        for (chunk, id) in &owners {
            prop_assert_eq!(server.factions.claims().owner(chunk), Some(*id));
        }
    }

    /// Claims never exceed the configured ceiling, whatever the power.
    #[test]
    fn claim_ceiling_holds(ops in arb_ops(80)) {
        let server = Server::with_config(small_factions());
        for (step, op) in ops.iter().enumerate() {
            apply(&server, op, step);
        }
        for faction in server.factions.registry().all() {
            prop_assert!(faction.claim_count() <= 8);
            prop_assert_eq!(faction.leader_count(), 1);
        }
    }

    /// Rebuilding the index from the records reproduces it exactly.
    #[test]
    fn rebuild_reproduces_index(ops in arb_ops(40)) {
        let server = Server::with_config(small_factions());
        for (step, op) in ops.iter().enumerate() {
            apply(&server, op, step);
        }
        let f = &server.factions;
        let before: Vec<_> = f.registry().all().iter()
            .map(|x| (x.id, f.claims().claims_of(&x.id)))
            .collect();
        let report = f.claims().build_index(f.registry());
        prop_assert_eq!(report.conflicts, 0);
        for (id, chunks) in before {
            prop_assert_eq!(f.claims().claims_of(&id), chunks);
        }
    }
}
