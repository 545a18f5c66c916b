//! Skip set for generic bodies.
//!
//! Instructions that only feed user-provided derivative decorations (directly,
//! or through other such instructions) are not transcribed.

use crate::ir::{InstId, Module, Opcode};
use hashbrown::HashSet;

/// Ordinary instructions of `body` whose every use is a derivative decoration
/// or sits inside another skipped instruction.
pub fn compute_skip_set(module: &Module, body: InstId) -> HashSet<InstId> {
    let insts = module.ordinary_insts(body);
    let mut skip = HashSet::new();
    loop {
        let mut changed = false;
        for &inst in &insts {
            if skip.contains(&inst) {
                continue;
            }
            let uses = module.uses(inst);
            if uses.is_empty() {
                continue;
            }
            if uses.iter().all(|&user| is_skipped_use(module, user, body, &skip)) {
                skip.insert(inst);
                changed = true;
            }
        }
        if !changed {
            return skip;
        }
    }
}

fn is_skipped_use(module: &Module, user: InstId, body: InstId, skip: &HashSet<InstId>) -> bool {
    if matches!(module.op(user), Opcode::ForwardDerivative | Opcode::BackwardDerivative) {
        return true;
    }
    let mut cur = Some(user);
    while let Some(inst) = cur {
        if inst == body {
            return false;
        }
        if skip.contains(&inst) {
            return true;
        }
        cur = module.parent(inst);
    }
    false
}
