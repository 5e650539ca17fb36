//! Parallel move resolution.
//!
//! Exchanging arguments between calling conventions means performing a set of moves "all at
//! once": every move must read its source before any move overwrites that source. Since sources
//! and destinations overlap (e.g. `x0 -> x1, x1 -> x0`), we have to sequence the moves, and break
//! any cycles with a scratch register.

use std::fmt::Debug;

/// A value location.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Loc<R> {
    Reg(R),
    /// The word at `base + off`.
    Stack { base: R, off: i32 },
}

/// What is being moved: this selects the instructions and the scratch register class used.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MoveKind {
    Int,
    F32,
    F64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Move<R> {
    pub src: Loc<R>,
    pub dst: Loc<R>,
    pub kind: MoveKind,
}

impl<R> Move<R> {
    pub fn new(src: Loc<R>, dst: Loc<R>, kind: MoveKind) -> Self {
        Self { src, dst, kind }
    }
}

/// Order the unordered set of `moves` so that no location is overwritten before every move
/// reading it has executed. Self-moves are dropped. Cycles are broken by copying one location in
/// the cycle to `scratch(kind)`, which must not be a source or destination of any move.
///
/// # Panics
///
/// If two moves have the same destination.
pub fn resolve<R, F>(moves: &[Move<R>], scratch: F) -> Vec<Move<R>>
where
    R: Copy + Debug + PartialEq,
    F: Fn(MoveKind) -> R,
{
    let mut pending = moves
        .iter()
        .filter(|m| m.src != m.dst)
        .copied()
        .collect::<Vec<_>>();
    for (i, m) in pending.iter().enumerate() {
        if pending[i + 1..].iter().any(|n| n.dst == m.dst) {
            panic!("Duplicate parallel move destination {:?}", m.dst);
        }
    }
    for kind in [MoveKind::Int, MoveKind::F32, MoveKind::F64] {
        let s = Loc::Reg(scratch(kind));
        assert!(
            !moves.iter().any(|m| m.src == s || m.dst == s),
            "Scratch register {s:?} is used by a parallel move"
        );
    }

    let mut ordered = Vec::with_capacity(pending.len() + 1);
    while !pending.is_empty() {
        // A move is ready if no other pending move still needs to read its destination.
        match pending
            .iter()
            .position(|m| !pending.iter().any(|n| n.src == m.dst))
        {
            Some(i) => ordered.push(pending.remove(i)),
            None => {
                // Every pending destination is still to be read, so the pending moves are all on
                // cycles. Park the value at one destination in a scratch register and redirect
                // its reader there: this cycle is then a chain.
                let blocked = pending[0].dst;
                let kind = pending.iter().find(|n| n.src == blocked).unwrap().kind;
                let tmp = Loc::Reg(scratch(kind));
                ordered.push(Move::new(blocked, tmp, kind));
                for n in pending.iter_mut() {
                    if n.src == blocked {
                        n.src = tmp;
                    }
                }
            }
        }
    }
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const ISCRATCH: u8 = 100;
    const FSCRATCH: u8 = 101;
    const SP: u8 = 31;

    fn scratch(kind: MoveKind) -> u8 {
        match kind {
            MoveKind::Int => ISCRATCH,
            MoveKind::F32 | MoveKind::F64 => FSCRATCH,
        }
    }

    /// Execute `ordered` on a machine where every location starts with a distinct value and check
    /// that each of `moves` delivered its source's original value to its destination.
    fn check(moves: &[Move<u8>], ordered: &[Move<u8>]) {
        let mut state = HashMap::new();
        let mut init = |l: Loc<u8>| {
            let n = state.len();
            *state.entry(l).or_insert(n)
        };
        let orig = moves
            .iter()
            .map(|m| (m.dst, init(m.src)))
            .collect::<Vec<_>>();
        for m in moves {
            init(m.dst);
        }
        for m in ordered {
            let v = state[&m.src];
            state.insert(m.dst, v);
        }
        for (dst, v) in orig {
            assert_eq!(state[&dst], v, "{moves:?} ordered as {ordered:?}");
        }
    }

    /// How many cycles of length > 1 do `moves` contain?
    fn cycles(moves: &[Move<u8>]) -> usize {
        let src_of = |l: Loc<u8>| moves.iter().find(|m| m.dst == l && m.src != l).map(|m| m.src);
        let mut seen = Vec::new();
        let mut n = 0;
        for m in moves {
            let mut cur = m.dst;
            let mut path = vec![cur];
            while let Some(s) = src_of(cur) {
                if s == m.dst {
                    if !path.iter().any(|x| seen.contains(x)) {
                        n += 1;
                        seen.extend(path);
                    }
                    break;
                }
                if path.contains(&s) || path.len() > moves.len() {
                    break;
                }
                path.push(s);
                cur = s;
            }
        }
        n
    }

    #[test]
    fn swap() {
        let moves = [
            Move::new(Loc::Reg(0), Loc::Reg(1), MoveKind::Int),
            Move::new(Loc::Reg(1), Loc::Reg(0), MoveKind::Int),
        ];
        let ordered = resolve(&moves, scratch);
        assert_eq!(ordered.len(), 3);
        assert_eq!(ordered[0].dst, Loc::Reg(ISCRATCH));
        check(&moves, &ordered);
    }

    #[test]
    fn chain_and_self_moves() {
        let moves = [
            Move::new(Loc::Reg(2), Loc::Reg(2), MoveKind::Int),
            Move::new(Loc::Reg(0), Loc::Reg(1), MoveKind::Int),
            Move::new(Loc::Reg(1), Loc::Reg(2), MoveKind::Int),
        ];
        let ordered = resolve(&moves, scratch);
        assert_eq!(
            ordered,
            vec![
                Move::new(Loc::Reg(1), Loc::Reg(2), MoveKind::Int),
                Move::new(Loc::Reg(0), Loc::Reg(1), MoveKind::Int),
            ]
        );
    }

    #[test]
    fn float_cycles_use_float_scratch() {
        let moves = [
            Move::new(Loc::Reg(10), Loc::Reg(11), MoveKind::F64),
            Move::new(Loc::Reg(11), Loc::Reg(10), MoveKind::F64),
            Move::new(Loc::Reg(0), Loc::Reg(1), MoveKind::Int),
            Move::new(Loc::Reg(1), Loc::Reg(0), MoveKind::Int),
        ];
        let ordered = resolve(&moves, scratch);
        assert_eq!(ordered.len(), 6);
        assert!(ordered
            .iter()
            .any(|m| m.dst == Loc::Reg(FSCRATCH) && m.kind == MoveKind::F64));
        assert!(ordered
            .iter()
            .any(|m| m.dst == Loc::Reg(ISCRATCH) && m.kind == MoveKind::Int));
        check(&moves, &ordered);
    }

    #[test]
    #[should_panic(expected = "Duplicate parallel move destination")]
    fn duplicate_destination() {
        resolve(
            &[
                Move::new(Loc::Reg(0), Loc::Reg(2), MoveKind::Int),
                Move::new(Loc::Reg(1), Loc::Reg(2), MoveKind::Int),
            ],
            scratch,
        );
    }

    #[test]
    #[should_panic(expected = "is used by a parallel move")]
    fn scratch_in_use() {
        resolve(
            &[Move::new(Loc::Reg(ISCRATCH), Loc::Reg(2), MoveKind::Int)],
            scratch,
        );
    }

    #[test]
    fn exhaustive() {
        // Every possible assignment of a source (or nothing) to each of five destinations, mixing
        // registers and stack slots: permutations, fan-outs, chains, and cycles.
        let locs = [
            Loc::Reg(0),
            Loc::Reg(1),
            Loc::Reg(2),
            Loc::Stack { base: SP, off: 0 },
            Loc::Stack { base: SP, off: 8 },
        ];
        let n = locs.len() + 1;
        for mut code in 0..n.pow(u32::try_from(locs.len()).unwrap()) {
            let mut moves = Vec::new();
            for dst in locs {
                let src = code % n;
                code /= n;
                if src < locs.len() {
                    moves.push(Move::new(locs[src], dst, MoveKind::Int));
                }
            }
            let ordered = resolve(&moves, scratch);
            check(&moves, &ordered);
            let real = moves.iter().filter(|m| m.src != m.dst).count();
            assert_eq!(ordered.len(), real + cycles(&moves), "{moves:?}");
        }
    }
}
