// This module holds the per-opcode forward rules. Each rule receives one original
// instruction and emits its primal clone plus, where the instruction is differentiable,
// the instruction(s) computing its differential at the same cursor. Rules never
// transcribe the instruction they are handling; operands are resolved on demand
// through find_or_transcribe_primal / find_or_transcribe_diff. A rule returns None
// when the opcode has no rule at all, letting the dispatcher fall back to type
// differentiation or report the instruction as not differentiable.

//! Per-opcode forward-mode rules.

use super::transcriber::{InstPair, Transcriber, DIFFERENTIABILITY_MARKERS};
use crate::core::TranscribeResult;
use crate::ir::{InsertLoc, InstId, Opcode};

/// A temporary pair passed in place of a pointer argument, with the
/// pointers its halves are copied back into after the call.
struct PairSlot {
    slot: InstId,
    pair_ty: InstId,
    primal_ptr: InstId,
    primal_ty: InstId,
    diff_ptr: Option<InstId>,
    diff_ty: InstId,
}

impl Transcriber<'_> {
    pub(crate) fn transcribe_by_opcode(
        &mut self,
        loc: InsertLoc,
        inst: InstId,
    ) -> TranscribeResult<Option<InstPair>> {
        let pair = match self.module.op(inst) {
            Opcode::IntLit | Opcode::FloatLit | Opcode::BoolLit | Opcode::NullDifferential => {
                InstPair::primal_only(self.maybe_clone_for_primal(loc, inst))
            }
            Opcode::StructKey
            | Opcode::StructField
            | Opcode::InterfaceRequirement
            | Opcode::WitnessTable
            | Opcode::WitnessTableEntry => InstPair::primal_only(self.maybe_clone_for_primal(loc, inst)),

            Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div => self.transcribe_binary(loc, inst)?,
            Opcode::Neg => self.transcribe_neg(loc, inst)?,

            Opcode::Less
            | Opcode::Greater
            | Opcode::Equal
            | Opcode::IntCast
            | Opcode::MakeDiffPair
            | Opcode::GetPrimal
            | Opcode::GetDiff
            | Opcode::MakeExistential
            | Opcode::ForwardDifferentiate => InstPair::primal_only(self.clone_primal(loc, inst)?),

            Opcode::GetField => self.transcribe_get_field(loc, inst)?,
            Opcode::GetElement => self.transcribe_get_element(loc, inst)?,
            Opcode::MakeStruct => self.transcribe_make_struct(loc, inst)?,
            Opcode::MakeArray => self.transcribe_make_array(loc, inst)?,
            Opcode::MakeArrayFromElement => self.transcribe_array_from_element(loc, inst)?,

            Opcode::Var => self.transcribe_var(loc, inst)?,
            Opcode::Load => self.transcribe_load(loc, inst)?,
            Opcode::Store => self.transcribe_store(loc, inst)?,

            Opcode::Call => self.transcribe_call(loc, inst)?,
            Opcode::Specialize => self.transcribe_specialize(loc, inst)?,

            Opcode::Branch => self.transcribe_branch(loc, inst)?,
            Opcode::CondBranch => self.transcribe_cond_branch(loc, inst)?,

            Opcode::Intrinsic if self.module.has_decoration(inst, Opcode::NoDiff) => {
                InstPair::primal_only(self.clone_primal(loc, inst)?)
            }
            _ => return Ok(None),
        };
        Ok(Some(pair))
    }

    /// Emit a copy of `inst` over primal operands.
    pub(crate) fn clone_primal(&mut self, loc: InsertLoc, inst: InstId) -> TranscribeResult<InstId> {
        let op = self.module.op(inst);
        let ty = match self.module.ty(inst) {
            Some(ty) => Some(self.find_or_transcribe_primal(loc, ty)?),
            None => None,
        };
        let mut operands = Vec::with_capacity(self.module.operands(inst).len());
        for operand in self.module.operands(inst).to_vec() {
            operands.push(self.find_or_transcribe_primal(loc, operand)?);
        }
        let payload = self.module.payload(inst).clone();
        let name = self.module.name_hint(inst).map(str::to_string);

        let mut b = self.builder(loc);
        b.set_source_loc(b.module().loc(inst));
        let primal = b.emit_with_payload(op, ty, &operands, payload);
        if let Some(name) = &name {
            b.add_name_hint(primal, name);
        }
        Ok(primal)
    }

    fn result_diff_type(&mut self, loc: InsertLoc, inst: InstId) -> TranscribeResult<Option<InstId>> {
        match self.module.ty(inst) {
            Some(ty) => self.differentiate_type(loc, ty),
            None => Ok(None),
        }
    }

    fn operand_of(&self, inst: InstId, index: usize) -> TranscribeResult<InstId> {
        self.module
            .operand(inst, index)
            .ok_or_else(|| self.unexpected(inst, "missing operand"))
    }

    fn transcribe_binary(&mut self, loc: InsertLoc, inst: InstId) -> TranscribeResult<InstPair> {
        let op = self.module.op(inst);
        let lhs = self.operand_of(inst, 0)?;
        let rhs = self.operand_of(inst, 1)?;
        let primal = self.clone_primal(loc, inst)?;
        let Some(diff_ty) = self.result_diff_type(loc, inst)? else {
            return Ok(InstPair::primal_only(primal));
        };
        let d_lhs = self.find_or_transcribe_diff(loc, lhs)?;
        let d_rhs = self.find_or_transcribe_diff(loc, rhs)?;
        if d_lhs.is_none() && d_rhs.is_none() {
            return Ok(InstPair::primal_only(primal));
        }
        let p_lhs = self.find_or_transcribe_primal(loc, lhs)?;
        let p_rhs = self.find_or_transcribe_primal(loc, rhs)?;

        let mut b = self.builder(loc);
        b.set_source_loc(b.module().loc(inst));
        let ty = Some(diff_ty);
        let diff = match (op, d_lhs, d_rhs) {
            (Opcode::Add | Opcode::Sub, Some(da), Some(db)) => b.emit(op, ty, &[da, db]),
            (Opcode::Add | Opcode::Sub, Some(da), None) => da,
            (Opcode::Add, None, Some(db)) => db,
            (Opcode::Sub, None, Some(db)) => b.emit(Opcode::Neg, ty, &[db]),
            // d(a*b) = da*b + a*db
            (Opcode::Mul, da, db) => {
                let left = da.map(|da| b.emit(Opcode::Mul, ty, &[da, p_rhs]));
                let right = db.map(|db| b.emit(Opcode::Mul, ty, &[p_lhs, db]));
                match (left, right) {
                    (Some(l), Some(r)) => b.emit(Opcode::Add, ty, &[l, r]),
                    (Some(term), None) | (None, Some(term)) => term,
                    (None, None) => return Ok(InstPair::primal_only(primal)),
                }
            }
            // d(a/b) = (da*b - a*db) / (b*b)
            (Opcode::Div, da, db) => {
                let left = da.map(|da| b.emit(Opcode::Mul, ty, &[da, p_rhs]));
                let right = db.map(|db| b.emit(Opcode::Mul, ty, &[p_lhs, db]));
                let numerator = match (left, right) {
                    (Some(l), Some(r)) => b.emit(Opcode::Sub, ty, &[l, r]),
                    (Some(l), None) => l,
                    (None, Some(r)) => b.emit(Opcode::Neg, ty, &[r]),
                    (None, None) => return Ok(InstPair::primal_only(primal)),
                };
                let denominator = b.emit(Opcode::Mul, ty, &[p_rhs, p_rhs]);
                b.emit(Opcode::Div, ty, &[numerator, denominator])
            }
            _ => return Ok(InstPair::primal_only(primal)),
        };
        Ok(InstPair::new(primal, diff))
    }

    fn transcribe_neg(&mut self, loc: InsertLoc, inst: InstId) -> TranscribeResult<InstPair> {
        let operand = self.operand_of(inst, 0)?;
        let primal = self.clone_primal(loc, inst)?;
        let (Some(diff_ty), Some(d_operand)) = (
            self.result_diff_type(loc, inst)?,
            self.find_or_transcribe_diff(loc, operand)?,
        ) else {
            return Ok(InstPair::primal_only(primal));
        };
        let diff = self.builder(loc).emit(Opcode::Neg, Some(diff_ty), &[d_operand]);
        Ok(InstPair::new(primal, diff))
    }

    fn transcribe_get_field(&mut self, loc: InsertLoc, inst: InstId) -> TranscribeResult<InstPair> {
        let base = self.operand_of(inst, 0)?;
        let key = self.operand_of(inst, 1)?;
        let primal = self.clone_primal(loc, inst)?;

        let diff_key = self
            .module
            .find_decoration(key, Opcode::DerivativeMember)
            .and_then(|deco| self.module.operand(deco, 0));
        let Some(diff_key) = diff_key else {
            return Ok(InstPair::primal_only(primal));
        };
        let Some(d_base) = self.find_or_transcribe_diff(loc, base)? else {
            return Ok(InstPair::primal_only(primal));
        };
        let Some(diff_ty) = self.result_diff_type(loc, inst)? else {
            return Ok(InstPair::primal_only(primal));
        };
        let diff_key = self.find_or_transcribe_primal(loc, diff_key)?;
        let diff = self
            .builder(loc)
            .emit(Opcode::GetField, Some(diff_ty), &[d_base, diff_key]);
        Ok(InstPair::new(primal, diff))
    }

    fn transcribe_get_element(&mut self, loc: InsertLoc, inst: InstId) -> TranscribeResult<InstPair> {
        let base = self.operand_of(inst, 0)?;
        let index = self.operand_of(inst, 1)?;
        let primal = self.clone_primal(loc, inst)?;
        let Some(d_base) = self.find_or_transcribe_diff(loc, base)? else {
            return Ok(InstPair::primal_only(primal));
        };
        let Some(diff_ty) = self.result_diff_type(loc, inst)? else {
            return Ok(InstPair::primal_only(primal));
        };
        let p_index = self.find_or_transcribe_primal(loc, index)?;
        let diff = self
            .builder(loc)
            .emit(Opcode::GetElement, Some(diff_ty), &[d_base, p_index]);
        Ok(InstPair::new(primal, diff))
    }

    fn transcribe_make_array(&mut self, loc: InsertLoc, inst: InstId) -> TranscribeResult<InstPair> {
        let elements = self.module.operands(inst).to_vec();
        let primal = self.clone_primal(loc, inst)?;
        let Some(diff_ty) = self.result_diff_type(loc, inst)? else {
            return Ok(InstPair::primal_only(primal));
        };

        let mut diffs = Vec::with_capacity(elements.len());
        for &element in &elements {
            diffs.push(self.find_or_transcribe_diff(loc, element)?);
        }
        if diffs.iter().all(Option::is_none) {
            return Ok(InstPair::primal_only(primal));
        }
        let mut diff_elements = Vec::with_capacity(elements.len());
        for (&element, diff) in elements.iter().zip(diffs) {
            let diff = match diff {
                Some(diff) => diff,
                None => match self.zero_of_value(loc, element)? {
                    Some(zero) => zero,
                    None => return Ok(InstPair::primal_only(primal)),
                },
            };
            diff_elements.push(diff);
        }
        let diff = self
            .builder(loc)
            .emit(Opcode::MakeArray, Some(diff_ty), &diff_elements);
        Ok(InstPair::new(primal, diff))
    }

    fn struct_field_keys(&self, ty: InstId) -> Vec<InstId> {
        if self.module.op(ty) != Opcode::StructType {
            return Vec::new();
        }
        self.module
            .children(ty)
            .iter()
            .filter(|&&field| self.module.op(field) == Opcode::StructField)
            .filter_map(|&field| self.module.operand(field, 0))
            .collect()
    }

    /// Builds the differential struct from the differentials of the members
    /// whose keys carry a derivative member.
    fn transcribe_make_struct(&mut self, loc: InsertLoc, inst: InstId) -> TranscribeResult<InstPair> {
        let keys = self
            .module
            .ty(inst)
            .map(|ty| self.struct_field_keys(ty))
            .unwrap_or_default();
        let values = self.module.operands(inst).to_vec();
        let primal = self.clone_primal(loc, inst)?;
        let Some(diff_ty) = self.result_diff_type(loc, inst)? else {
            return Ok(InstPair::primal_only(primal));
        };

        let mut members = Vec::with_capacity(values.len());
        for (&key, &value) in keys.iter().zip(&values) {
            let diff_key = self
                .module
                .find_decoration(key, Opcode::DerivativeMember)
                .and_then(|deco| self.module.operand(deco, 0));
            let Some(diff_key) = diff_key else {
                continue;
            };
            let diff = self.find_or_transcribe_diff(loc, value)?;
            members.push((diff_key, value, diff));
        }
        if members.iter().all(|&(_, _, diff)| diff.is_none()) {
            return Ok(InstPair::primal_only(primal));
        }

        // A concrete differential struct fixes the member order.
        let diff_keys = self.struct_field_keys(diff_ty);
        if !diff_keys.is_empty() {
            let mut ordered = Vec::with_capacity(diff_keys.len());
            for diff_key in diff_keys {
                let Some(&member) = members.iter().find(|&&(k, _, _)| k == diff_key) else {
                    log::trace!("{inst}: differential member {diff_key} has no source");
                    return Ok(InstPair::primal_only(primal));
                };
                ordered.push(member);
            }
            members = ordered;
        }

        let mut diff_values = Vec::with_capacity(members.len());
        for (_, value, diff) in members {
            let diff = match diff {
                Some(diff) => diff,
                None => match self.zero_of_value(loc, value)? {
                    Some(zero) => zero,
                    None => return Ok(InstPair::primal_only(primal)),
                },
            };
            diff_values.push(diff);
        }
        let diff = self
            .builder(loc)
            .emit(Opcode::MakeStruct, Some(diff_ty), &diff_values);
        Ok(InstPair::new(primal, diff))
    }

    fn transcribe_array_from_element(&mut self, loc: InsertLoc, inst: InstId) -> TranscribeResult<InstPair> {
        let element = self.operand_of(inst, 0)?;
        let primal = self.clone_primal(loc, inst)?;
        let (Some(diff_ty), Some(d_element)) = (
            self.result_diff_type(loc, inst)?,
            self.find_or_transcribe_diff(loc, element)?,
        ) else {
            return Ok(InstPair::primal_only(primal));
        };
        let diff = self
            .builder(loc)
            .emit(Opcode::MakeArrayFromElement, Some(diff_ty), &[d_element]);
        Ok(InstPair::new(primal, diff))
    }

    /// Zero differential for the type of `value`.
    fn zero_of_value(&mut self, loc: InsertLoc, value: InstId) -> TranscribeResult<Option<InstId>> {
        match self.module.ty(value) {
            Some(ty) => self.zero_of(loc, ty),
            None => Ok(None),
        }
    }

    fn transcribe_var(&mut self, loc: InsertLoc, inst: InstId) -> TranscribeResult<InstPair> {
        let primal = self.clone_primal(loc, inst)?;
        let Some(diff_ty) = self.result_diff_type(loc, inst)? else {
            return Ok(InstPair::primal_only(primal));
        };
        let diff = self.builder(loc).emit(Opcode::Var, Some(diff_ty), &[]);
        Ok(InstPair::new(primal, diff))
    }

    fn transcribe_load(&mut self, loc: InsertLoc, inst: InstId) -> TranscribeResult<InstPair> {
        let ptr = self.operand_of(inst, 0)?;
        let primal = self.clone_primal(loc, inst)?;
        let Some(d_ptr) = self.find_or_transcribe_diff(loc, ptr)? else {
            return Ok(InstPair::primal_only(primal));
        };
        let Some(diff_ty) = self.result_diff_type(loc, inst)? else {
            return Ok(InstPair::primal_only(primal));
        };
        let diff = self.builder(loc).emit(Opcode::Load, Some(diff_ty), &[d_ptr]);
        Ok(InstPair::new(primal, diff))
    }

    fn transcribe_store(&mut self, loc: InsertLoc, inst: InstId) -> TranscribeResult<InstPair> {
        let ptr = self.operand_of(inst, 0)?;
        let value = self.operand_of(inst, 1)?;
        let primal = self.clone_primal(loc, inst)?;
        let Some(d_ptr) = self.find_or_transcribe_diff(loc, ptr)? else {
            return Ok(InstPair::primal_only(primal));
        };
        let d_value = match self.find_or_transcribe_diff(loc, value)? {
            Some(diff) => diff,
            None => match self.zero_of_value(loc, value)? {
                Some(zero) => zero,
                None => return Ok(InstPair::primal_only(primal)),
            },
        };
        let diff = self.builder(loc).emit(Opcode::Store, None, &[d_ptr, d_value]);
        Ok(InstPair::new(primal, diff))
    }

    /// The callable to invoke in derivative code for `callee`, if any.
    fn differential_callee(&mut self, loc: InsertLoc, callee: InstId) -> TranscribeResult<Option<InstId>> {
        let m = &*self.module;
        if let Some(derivative) = m
            .find_decoration(callee, Opcode::ForwardDerivative)
            .and_then(|deco| m.operand(deco, 0))
        {
            return self.find_or_transcribe_primal(loc, derivative).map(Some);
        }
        match m.op(callee) {
            Opcode::Func => {
                let differentiable = DIFFERENTIABILITY_MARKERS
                    .iter()
                    .any(|&op| m.has_decoration(callee, op));
                if differentiable {
                    self.find_or_transcribe_diff(loc, callee)
                } else {
                    Ok(None)
                }
            }
            Opcode::Specialize | Opcode::LookupWitness => self.find_or_transcribe_diff(loc, callee),
            _ => Ok(None),
        }
    }

    fn transcribe_call(&mut self, loc: InsertLoc, inst: InstId) -> TranscribeResult<InstPair> {
        let callee = self.operand_of(inst, 0)?;
        let args = self.module.operands(inst)[1..].to_vec();
        let Some(diff_callee) = self.differential_callee(loc, callee)? else {
            log::trace!("{inst}: callee {callee} has no derivative");
            return Ok(InstPair::primal_only(self.clone_primal(loc, inst)?));
        };

        let callee_ty = self.module.ty(callee);
        let param_tys: Vec<InstId> = callee_ty
            .map(|t| self.module.func_type_params(t).to_vec())
            .unwrap_or_default();
        let result_ty = self
            .module
            .ty(inst)
            .ok_or_else(|| self.unexpected(inst, "call without a result type"))?;

        let mut diff_args = Vec::with_capacity(args.len());
        let mut write_backs = Vec::new();
        for (i, &arg) in args.iter().enumerate() {
            let primal_arg = self.find_or_transcribe_primal(loc, arg)?;
            let Some(param_ty) = param_tys.get(i).copied().or_else(|| self.module.ty(arg)) else {
                diff_args.push(primal_arg);
                continue;
            };
            let primal_param_ty = self.find_or_transcribe_primal(loc, param_ty)?;
            let Some(pass_ty) = self.param_pass_type(loc, primal_param_ty)? else {
                diff_args.push(primal_arg);
                continue;
            };
            if self.module.op(pass_ty).is_pointer_like() {
                let Some(slot) = self.pair_slot_argument(loc, arg, primal_arg, primal_param_ty, pass_ty)? else {
                    return Ok(InstPair::primal_only(self.clone_primal(loc, inst)?));
                };
                diff_args.push(slot.slot);
                write_backs.push(slot);
                continue;
            }
            let diff_arg = match self.find_or_transcribe_diff(loc, arg)? {
                Some(diff) => diff,
                None => match self.zero_of(loc, param_ty)? {
                    Some(zero) => zero,
                    None => return Ok(InstPair::primal_only(self.clone_primal(loc, inst)?)),
                },
            };
            let mut b = self.builder(loc);
            let pair = b.emit_make_pair(pass_ty, primal_arg, diff_arg);
            b.mark_mixed(pair, Some(pass_ty));
            diff_args.push(pair);
        }

        let primal_result_ty = self.find_or_transcribe_primal(loc, result_ty)?;
        let Some(pair_ty) = self.try_diff_pair_type(loc, primal_result_ty)? else {
            let mut b = self.builder(loc);
            b.set_source_loc(b.module().loc(inst));
            let call = b.emit_call(primal_result_ty, diff_callee, &diff_args);
            self.write_back_pair_slots(loc, &write_backs);
            return Ok(InstPair::primal_only(call));
        };
        let diff_result_ty = self
            .differentiate_type(loc, result_ty)?
            .ok_or_else(|| self.unexpected(inst, "pair result without a differential type"))?;

        let name = self.module.name_hint(inst).map(str::to_string);
        let mut b = self.builder(loc);
        b.set_source_loc(b.module().loc(inst));
        let call = b.emit_call(pair_ty, diff_callee, &diff_args);
        b.mark_mixed(call, Some(pair_ty));
        let primal = b.emit(Opcode::GetPrimal, Some(primal_result_ty), &[call]);
        b.mark_primal(primal);
        let diff = b.emit(Opcode::GetDiff, Some(diff_result_ty), &[call]);
        b.mark_differential(diff, Some(primal_result_ty));
        if let Some(name) = &name {
            b.add_name_hint(primal, name);
        }
        self.write_back_pair_slots(loc, &write_backs);
        Ok(InstPair::new(primal, diff))
    }

    /// Copies the value behind a pointer argument and its differential into a
    /// fresh pair slot the derivative callee can write through.
    fn pair_slot_argument(
        &mut self,
        loc: InsertLoc,
        arg: InstId,
        primal_arg: InstId,
        primal_param_ty: InstId,
        slot_ty: InstId,
    ) -> TranscribeResult<Option<PairSlot>> {
        let pointee = self.type_operand(primal_param_ty, 0)?;
        let pair_ty = self.type_operand(slot_ty, 0)?;
        let diff_pointee = self
            .differentiate_type(loc, pointee)?
            .ok_or_else(|| self.unexpected(arg, "pair pointee without a differential type"))?;

        let diff_ptr = self.find_or_transcribe_diff(loc, arg)?;
        let diff_value = match diff_ptr {
            Some(ptr) => {
                let mut b = self.builder(loc);
                let value = b.emit(Opcode::Load, Some(diff_pointee), &[ptr]);
                b.mark_differential(value, Some(pointee));
                value
            }
            None => match self.zero_of(loc, pointee)? {
                Some(zero) => zero,
                None => return Ok(None),
            },
        };

        let mut b = self.builder(loc);
        let primal_value = b.emit(Opcode::Load, Some(pointee), &[primal_arg]);
        b.mark_primal(primal_value);
        let slot = b.emit(Opcode::Var, Some(slot_ty), &[]);
        b.mark_mixed(slot, Some(slot_ty));
        let pair = b.emit_make_pair(pair_ty, primal_value, diff_value);
        b.mark_mixed(pair, Some(pair_ty));
        let store = b.emit(Opcode::Store, None, &[slot, pair]);
        b.mark_mixed(store, None);
        Ok(Some(PairSlot {
            slot,
            pair_ty,
            primal_ptr: primal_arg,
            primal_ty: pointee,
            diff_ptr,
            diff_ty: diff_pointee,
        }))
    }

    fn write_back_pair_slots(&mut self, loc: InsertLoc, slots: &[PairSlot]) {
        let mut b = self.builder(loc);
        for s in slots {
            let pair = b.emit(Opcode::Load, Some(s.pair_ty), &[s.slot]);
            b.mark_mixed(pair, Some(s.pair_ty));
            let primal = b.emit(Opcode::GetPrimal, Some(s.primal_ty), &[pair]);
            b.mark_primal(primal);
            let store = b.emit(Opcode::Store, None, &[s.primal_ptr, primal]);
            b.mark_primal(store);
            if let Some(diff_ptr) = s.diff_ptr {
                let diff = b.emit(Opcode::GetDiff, Some(s.diff_ty), &[pair]);
                b.mark_differential(diff, Some(s.primal_ty));
                let store = b.emit(Opcode::Store, None, &[diff_ptr, diff]);
                b.mark_differential(store, None);
            }
        }
    }

    fn transcribe_specialize(&mut self, loc: InsertLoc, inst: InstId) -> TranscribeResult<InstPair> {
        let base = self.operand_of(inst, 0)?;
        let primal = self.clone_primal(loc, inst)?;

        let m = &*self.module;
        let user_derivative = match m.op(base) {
            Opcode::Generic => m.innermost_return_value(base),
            _ => Some(base),
        }
        .and_then(|inner| m.find_decoration(inner, Opcode::ForwardDerivative))
        .and_then(|deco| m.operand(deco, 0));
        let diff_base = match user_derivative {
            Some(derivative) => Some(self.find_or_transcribe_primal(loc, derivative)?),
            None => self.find_or_transcribe_diff(loc, base)?,
        };
        let Some(diff_base) = diff_base else {
            return Ok(InstPair::primal_only(primal));
        };

        let diff_ty = match self.module.ty(inst) {
            Some(ty) if self.module.op(ty) == Opcode::FuncType => self.differentiate_type(loc, ty)?,
            Some(ty) => Some(self.find_or_transcribe_primal(loc, ty)?),
            None => None,
        };
        let mut operands = vec![diff_base];
        operands.extend_from_slice(&self.module.operands(primal)[1..]);
        let diff = self.builder(loc).emit(Opcode::Specialize, diff_ty, &operands);
        Ok(InstPair::new(primal, diff))
    }

    fn transcribe_branch(&mut self, loc: InsertLoc, inst: InstId) -> TranscribeResult<InstPair> {
        let target = self.operand_of(inst, 0)?;
        let args = self.module.operands(inst)[1..].to_vec();
        let diff_target = self
            .lookup_differential(target, None)
            .ok_or_else(|| self.unexpected(inst, "branch target has no differential block"))?;
        let target_params = self.module.params(target);

        let mut diff_args = Vec::with_capacity(args.len() * 2);
        for (&arg, &param) in args.iter().zip(&target_params) {
            let primal_arg = self.find_or_transcribe_primal(loc, arg)?;
            diff_args.push(primal_arg);
            let Some(param_ty) = self.module.ty(param) else {
                continue;
            };
            if self.differentiate_type(loc, param_ty)?.is_none() {
                continue;
            }
            let diff_arg = match self.find_or_transcribe_diff(loc, arg)? {
                Some(diff) => diff,
                None => match self.zero_of(loc, param_ty)? {
                    Some(zero) => zero,
                    None => {
                        log::trace!("{inst}: no differential for branch argument {arg}");
                        return Ok(InstPair::primal_only(self.clone_primal(loc, inst)?));
                    }
                },
            };
            diff_args.push(diff_arg);
        }

        let mut operands = vec![diff_target];
        operands.extend(diff_args);
        let branch = self.builder(loc).emit(Opcode::Branch, None, &operands);
        Ok(InstPair::new(branch, branch))
    }

    fn transcribe_cond_branch(&mut self, loc: InsertLoc, inst: InstId) -> TranscribeResult<InstPair> {
        let cond = self.operand_of(inst, 0)?;
        let on_true = self.operand_of(inst, 1)?;
        let on_false = self.operand_of(inst, 2)?;
        let primal_cond = self.find_or_transcribe_primal(loc, cond)?;
        let mut targets = [on_true, on_false];
        for target in &mut targets {
            *target = self
                .lookup_differential(*target, None)
                .ok_or_else(|| self.unexpected(inst, "branch target has no differential block"))?;
        }
        let branch = self
            .builder(loc)
            .emit(Opcode::CondBranch, None, &[primal_cond, targets[0], targets[1]]);
        Ok(InstPair::new(branch, branch))
    }
}
