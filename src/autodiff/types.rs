//! Differential type computation.
//!
//! `differentiate_type` is the memoized entry point: it goes through the
//! transcriber's differential map so every type is differentiated once.
//! `differentiate_type_impl` holds the structural rules.

use super::conformance::Capability;
use super::transcriber::Transcriber;
use crate::core::{TranscribeError, TranscribeResult};
use crate::ir::{Builder, InsertLoc, InstId, Opcode};

impl Transcriber<'_> {
    /// Differential type of `ty`, or `None` when `ty` is not differentiable.
    pub fn differentiate_type(&mut self, loc: InsertLoc, ty: InstId) -> TranscribeResult<Option<InstId>> {
        let m = &*self.module;
        if m.has_decoration(ty, Opcode::NoDiff) {
            return Ok(None);
        }
        match m.op(ty) {
            // An existential differentiates to the capability interface it extends.
            Opcode::InterfaceType => {
                return Ok(self
                    .conformance
                    .capability_of_interface(m, ty)
                    .and_then(|cap| self.conformance.capability_interface(cap)));
            }
            Opcode::AssociatedType => {
                return Err(self.unexpected(ty, "associated type reached during type differentiation"));
            }
            _ => {}
        }

        let primal = self.lookup_primal(loc, ty, Some(ty)).unwrap_or(ty);
        if self.is_type_param(primal) {
            let mut b = Builder::new(&mut *self.module, loc);
            return Ok(self.conformance.differential_for_type(&mut b, primal));
        }
        self.find_or_transcribe_diff(loc, ty)
    }

    fn is_type_param(&self, inst: InstId) -> bool {
        let m = &*self.module;
        m.op(inst) == Opcode::Param && m.ty(inst).is_some_and(|t| m.op(t) == Opcode::TypeKind)
    }

    pub(crate) fn type_operand(&self, ty: InstId, index: usize) -> TranscribeResult<InstId> {
        self.module
            .operand(ty, index)
            .ok_or_else(|| self.unexpected(ty, "type is missing an operand"))
    }

    /// Structural differentiation of one type, without memoization.
    pub(crate) fn differentiate_type_impl(&mut self, loc: InsertLoc, ty: InstId) -> TranscribeResult<Option<InstId>> {
        let primal = self.lookup_primal(loc, ty, Some(ty)).unwrap_or(ty);
        let op = self.module.op(primal);
        match op {
            _ if op.is_pointer_like() => {
                let pointee = self.type_operand(primal, 0)?;
                let Some(diff_pointee) = self.differentiate_type(loc, pointee)? else {
                    return Ok(None);
                };
                Ok(Some(self.builder(loc).get_type(op, &[diff_pointee])))
            }
            Opcode::ArrayType => {
                let element = self.type_operand(primal, 0)?;
                let count = self.type_operand(primal, 1)?;
                let Some(diff_element) = self.differentiate_type(loc, element)? else {
                    return Ok(None);
                };
                Ok(Some(self.builder(loc).array_type(diff_element, count)))
            }
            Opcode::DiffPairType | Opcode::DiffPtrPairType => {
                let value = self.type_operand(primal, 0)?;
                let Some(diff_value) = self.differentiate_type(loc, value)? else {
                    return Ok(None);
                };
                Ok(Some(self.diff_pair_type(loc, diff_value)?))
            }
            Opcode::FuncType => Ok(Some(self.differentiate_func_type(loc, primal)?)),
            Opcode::TupleType | Opcode::TypePack => {
                let elements = self.module.operands(primal).to_vec();
                let mut diff_elements = Vec::with_capacity(elements.len());
                for element in elements {
                    let diff = match self.differentiate_type(loc, element)? {
                        Some(diff) => diff,
                        None => self.builder(loc).void_type(),
                    };
                    diff_elements.push(diff);
                }
                Ok(Some(self.builder(loc).get_type(op, &diff_elements)))
            }
            Opcode::OptionalType => {
                let inner = self.type_operand(primal, 0)?;
                let Some(diff_inner) = self.differentiate_type(loc, inner)? else {
                    return Ok(None);
                };
                Ok(Some(self.builder(loc).get_type(op, &[diff_inner])))
            }
            Opcode::NullDifferentialType => Ok(Some(primal)),
            _ => {
                let mut b = Builder::new(&mut *self.module, loc);
                Ok(self.conformance.differential_for_type(&mut b, primal))
            }
        }
    }

    /// Forward-mode signature: differentiable parameter and result types become pairs.
    pub fn differentiate_func_type(&mut self, loc: InsertLoc, func_ty: InstId) -> TranscribeResult<InstId> {
        let result = self
            .module
            .func_type_result(func_ty)
            .ok_or_else(|| self.unexpected(func_ty, "function type without a result"))?;
        let params = self.module.func_type_params(func_ty).to_vec();

        let mut diff_params = Vec::with_capacity(params.len());
        for param in params {
            let primal = self.find_or_transcribe_primal(loc, param)?;
            diff_params.push(self.param_pass_type(loc, primal)?.unwrap_or(primal));
        }
        let primal_result = self.find_or_transcribe_primal(loc, result)?;
        let diff_result = self
            .try_diff_pair_type(loc, primal_result)?
            .unwrap_or(primal_result);
        Ok(self.builder(loc).func_type(diff_result, &diff_params))
    }

    /// How a parameter of `primal_ty` travels in a derivative signature.
    ///
    /// Differentiable values travel as pairs. A pointer-like parameter whose
    /// pointee is differentiable travels as the same wrapper around the
    /// pointee's pair, so writes through it carry derivatives too.
    pub fn param_pass_type(&mut self, loc: InsertLoc, primal_ty: InstId) -> TranscribeResult<Option<InstId>> {
        if let Some(pair) = self.try_diff_pair_type(loc, primal_ty)? {
            return Ok(Some(pair));
        }
        let op = self.module.op(primal_ty);
        if !op.is_pointer_like() {
            return Ok(None);
        }
        let pointee = self.type_operand(primal_ty, 0)?;
        let Some(pointee_pair) = self.try_diff_pair_type(loc, pointee)? else {
            return Ok(None);
        };
        Ok(Some(self.builder(loc).get_type(op, &[pointee_pair])))
    }

    /// Pair type carrying a value of `primal_ty` and its differential.
    pub fn diff_pair_type(&mut self, loc: InsertLoc, primal_ty: InstId) -> TranscribeResult<InstId> {
        let mut b = Builder::new(&mut *self.module, loc);
        for cap in Capability::ALL {
            if let Some(witness) = self.conformance.lookup_conformance(&mut b, primal_ty, cap) {
                let op = match cap {
                    Capability::Value => Opcode::DiffPairType,
                    Capability::Pointer => Opcode::DiffPtrPairType,
                };
                return Ok(b.get_type(op, &[primal_ty, witness]));
            }
        }
        Err(TranscribeError::MissingWitness { ty: primal_ty })
    }

    /// Like [`Self::diff_pair_type`], but `None` for non-differentiable types.
    pub fn try_diff_pair_type(&mut self, loc: InsertLoc, primal_ty: InstId) -> TranscribeResult<Option<InstId>> {
        if self.module.has_decoration(primal_ty, Opcode::NoDiff) {
            return Ok(None);
        }
        let differentiable = {
            let mut b = Builder::new(&mut *self.module, loc);
            self.conformance.is_differentiable(&mut b, primal_ty).is_some()
        };
        if !differentiable {
            return Ok(None);
        }
        self.diff_pair_type(loc, primal_ty).map(Some)
    }
}
