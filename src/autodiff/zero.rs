//! Zero differentials.

use super::transcriber::Transcriber;
use crate::core::{DiagnosticKind, TranscribeError, TranscribeResult};
use crate::ir::{Builder, InsertLoc, InstId, Opcode};

impl Transcriber<'_> {
    /// Emit the additive identity of the differential of `ty`.
    ///
    /// The result is typed with `differentiate_type(ty)`. Returns `None` after
    /// diagnosing an internal error when no zero can be produced.
    pub fn zero_of(&mut self, loc: InsertLoc, ty: InstId) -> TranscribeResult<Option<InstId>> {
        let primal_ty = self.find_or_transcribe_primal(loc, ty)?;
        let Some(diff_ty) = self.differentiate_type(loc, ty)? else {
            if matches!(self.module.op(primal_ty), Opcode::IntType | Opcode::UIntType) {
                return Ok(Some(self.builder(loc).get_int_value(primal_ty, 0)));
            }
            self.diagnose(
                ty,
                DiagnosticKind::InternalError,
                format!("could not generate zero value for non-differentiable type {ty}"),
            );
            return Ok(None);
        };

        match self.module.op(diff_ty) {
            Opcode::InterfaceType => {
                let mut b = Builder::new(&mut *self.module, loc);
                let null = b.null_differential();
                let Some(null_witness) = self.conformance.null_differential_witness(&mut b) else {
                    let null_ty = b.get_type(Opcode::NullDifferentialType, &[]);
                    return Err(TranscribeError::MissingWitness { ty: null_ty });
                };
                let packed = b.emit(Opcode::MakeExistential, Some(diff_ty), &[null, null_witness]);
                b.mark_differential(packed, Some(primal_ty));
                return Ok(Some(packed));
            }
            Opcode::DiffPairType | Opcode::DiffPtrPairType => {
                let value = self
                    .module
                    .operand(diff_ty, 0)
                    .ok_or_else(|| self.unexpected(diff_ty, "pair type without a value type"))?;
                let Some(zero) = self.zero_of(loc, value)? else {
                    return Ok(None);
                };
                let mut b = self.builder(loc);
                let pair = b.emit_make_pair(diff_ty, zero, zero);
                b.mark_differential(pair, Some(primal_ty));
                return Ok(Some(pair));
            }
            _ => {}
        }

        if self.module.op(primal_ty) == Opcode::ArrayType {
            let element = self
                .module
                .operand(primal_ty, 0)
                .ok_or_else(|| self.unexpected(primal_ty, "array type without an element type"))?;
            let Some(zero) = self.zero_of(loc, element)? else {
                return Ok(None);
            };
            let mut b = self.builder(loc);
            let array = b.emit(Opcode::MakeArrayFromElement, Some(diff_ty), &[zero]);
            b.mark_differential(array, Some(primal_ty));
            return Ok(Some(array));
        }

        let mut b = Builder::new(&mut *self.module, loc);
        match self.conformance.zero_method_for_type(&mut b, primal_ty) {
            Some(zero_fn) => {
                let zero = b.emit_call(diff_ty, zero_fn, &[]);
                b.mark_differential(zero, Some(primal_ty));
                Ok(Some(zero))
            }
            None => {
                self.diagnose(
                    ty,
                    DiagnosticKind::InternalError,
                    format!("no zero constructor registered for {ty}"),
                );
                Ok(None)
            }
        }
    }
}
