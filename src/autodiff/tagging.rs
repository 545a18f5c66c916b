//! Role tags on transcribed instructions.

use super::transcriber::Transcriber;
use crate::ir::{Builder, InstId, Opcode};

impl Transcriber<'_> {
    /// Tag the pair produced for `orig` unless its rule already did.
    ///
    /// Types and literals are shared across the module and never tagged.
    pub(crate) fn tag_transcribed(&mut self, orig: InstId, primal: InstId, diff: Option<InstId>) {
        let m = &*self.module;
        let untaggable = |inst: InstId| m.has_autodiff_tag(inst) || m.is_literal(inst) || m.is_type(inst);

        let tag_primal = primal != orig && Some(primal) != diff && !untaggable(primal);
        let Some(diff) = diff else {
            if tag_primal {
                self.builder_at_root().mark_primal(primal);
            }
            return;
        };
        if matches!(m.op(diff), Opcode::Func | Opcode::Generic | Opcode::Block) {
            if tag_primal {
                self.builder_at_root().mark_primal(primal);
            }
            return;
        }

        let name = (m.name_hint(diff).is_none() && !m.is_type(diff))
            .then(|| m.name_hint(primal))
            .flatten()
            .map(|name| format!("{}{name}", self.options.diff_name_prefix));
        let tag_diff = !untaggable(diff);
        let primal_ty = m.ty(primal);

        let mut b = self.builder_at_root();
        if tag_primal {
            b.mark_primal(primal);
        }
        if let Some(name) = &name {
            b.add_name_hint(diff, name);
        }
        if tag_diff {
            if primal != diff {
                b.mark_differential(diff, primal_ty);
            } else {
                b.mark_mixed(diff, primal_ty);
            }
        }
    }

    /// Decorations attach to their target regardless of the cursor.
    fn builder_at_root(&mut self) -> Builder<'_> {
        Builder::at_module(&mut *self.module)
    }
}
