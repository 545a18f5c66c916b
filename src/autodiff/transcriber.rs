// This module implements the forward-mode transcriber core. A Transcriber is the explicit
// context of one differentiation pass: it borrows the module and the diagnostic sink,
// owns the conformance context, the primal/differential memo tables, the in-progress
// reentrancy guard and the skip set of the generic currently being transcribed. The
// entry point transcribe() drives the per-instruction state machine (Untranscribed →
// InProgress → Mapped), dispatches on the opcode to the handlers for functions, blocks,
// generics, parameters, witness lookups and returns, falls back to the per-opcode rules
// and then to type differentiation, and finally records and tags the resulting
// (primal, differential) pair. Operands are transcribed on demand through
// find_or_transcribe_primal / find_or_transcribe_diff, never in a separate pre-pass.

//! Forward-mode transcriber core.

use super::conformance::ConformanceContext;
use super::mapping::{InstMapping, MapOutcome};
use super::skip::compute_skip_set;
use crate::core::{
    DiagnosticKind, DiagnosticSink, TranscribeError, TranscribeOptions, TranscribeResult,
};
use crate::ir::{Builder, InsertLoc, InstId, Module, Opcode};
use hashbrown::HashSet;

/// Decorations that make a function eligible for differentiation.
pub const DIFFERENTIABILITY_MARKERS: [Opcode; 4] = [
    Opcode::ForwardDifferentiable,
    Opcode::BackwardDifferentiable,
    Opcode::ForwardDerivative,
    Opcode::BackwardDerivative,
];

/// Decorations copied from an original function onto its derivative.
const FORWARDED_DECORATIONS: [Opcode; 1] = [Opcode::ForceInline];

/// Primal and differential counterparts of one original instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstPair {
    pub primal: Option<InstId>,
    pub differential: Option<InstId>,
}

impl InstPair {
    pub fn new(primal: InstId, differential: impl Into<Option<InstId>>) -> Self {
        Self {
            primal: Some(primal),
            differential: differential.into(),
        }
    }

    pub fn primal_only(primal: InstId) -> Self {
        Self::new(primal, None)
    }

    pub fn none() -> Self {
        Self {
            primal: None,
            differential: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscriptionState {
    Untranscribed,
    InProgress,
    Mapped,
}

pub struct Transcriber<'a> {
    pub(crate) module: &'a mut Module,
    pub(crate) sink: &'a mut DiagnosticSink,
    pub(crate) conformance: ConformanceContext,
    pub(crate) maps: InstMapping,
    pub(crate) options: TranscribeOptions,
    in_progress: HashSet<InstId>,
    failed: HashSet<InstId>,
    skip: HashSet<InstId>,
}

impl<'a> Transcriber<'a> {
    pub fn new(module: &'a mut Module, sink: &'a mut DiagnosticSink) -> Self {
        Self::with_options(module, sink, TranscribeOptions::default())
    }

    pub fn with_options(
        module: &'a mut Module,
        sink: &'a mut DiagnosticSink,
        options: TranscribeOptions,
    ) -> Self {
        let conformance = ConformanceContext::new(module);
        Self {
            module,
            sink,
            conformance,
            maps: InstMapping::new(),
            options,
            in_progress: HashSet::new(),
            failed: HashSet::new(),
            skip: HashSet::new(),
        }
    }

    pub fn module(&self) -> &Module {
        &*self.module
    }

    pub fn mapping(&self) -> &InstMapping {
        &self.maps
    }

    pub fn conformance(&self) -> &ConformanceContext {
        &self.conformance
    }

    pub(crate) fn builder(&mut self, loc: InsertLoc) -> Builder<'_> {
        Builder::new(&mut *self.module, loc)
    }

    pub(crate) fn diagnose(&mut self, inst: InstId, kind: DiagnosticKind, message: String) {
        let loc = self.module.loc(inst);
        self.sink.diagnose(loc, kind, message);
    }

    pub(crate) fn unexpected(&self, inst: InstId, reason: &str) -> TranscribeError {
        TranscribeError::Unexpected {
            inst,
            reason: reason.to_string(),
        }
    }

    pub fn state(&self, orig: InstId) -> TranscriptionState {
        if self.maps.has_differential(orig) {
            TranscriptionState::Mapped
        } else if self.in_progress.contains(&orig) {
            TranscriptionState::InProgress
        } else {
            TranscriptionState::Untranscribed
        }
    }

    pub fn is_in_progress(&self, inst: InstId) -> bool {
        self.in_progress.contains(&inst)
    }

    pub(crate) fn map_primal(&mut self, orig: InstId, primal: InstId) {
        if let MapOutcome::Conflict { existing } = self.maps.map_primal(orig, primal) {
            self.diagnose(
                orig,
                DiagnosticKind::InternalError,
                format!("inconsistent primal mapping for {orig}: {existing} vs {primal}"),
            );
        }
    }

    pub(crate) fn map_differential(&mut self, orig: InstId, diff: Option<InstId>) -> TranscribeResult<()> {
        self.maps.map_differential(orig, diff)
    }

    /// Can `orig` stand in for itself at `loc` without cloning?
    fn can_reuse_as_primal(&self, loc: InsertLoc, orig: InstId) -> bool {
        let m = &*self.module;
        if matches!(m.op(orig), Opcode::Func | Opcode::Generic) {
            return true;
        }
        let Some(parent) = m.parent(orig) else {
            return true;
        };
        if parent == m.root() {
            return true;
        }
        let Some(scope) = loc.parent(m) else {
            return false;
        };
        if m.is_child_of(scope, parent) {
            return true;
        }
        // Entry-block parameters dominate everything in their function. Other
        // dominating values are not recognized.
        if m.op(orig) == Opcode::Param {
            if let Some(func) = m.parent(parent).filter(|&f| m.op(f) == Opcode::Func) {
                return m.first_block(func) == Some(parent) && m.is_child_of(scope, func);
            }
        }
        false
    }

    pub fn lookup_primal(&self, loc: InsertLoc, orig: InstId, default: Option<InstId>) -> Option<InstId> {
        if let Some(primal) = self.maps.lookup_primal(orig, None) {
            return Some(primal);
        }
        if self.can_reuse_as_primal(loc, orig) {
            return Some(orig);
        }
        default
    }

    pub fn lookup_differential(&self, orig: InstId, default: Option<InstId>) -> Option<InstId> {
        self.maps.lookup_differential(orig, default)
    }

    /// Structurally clone `orig` (and whatever it needs) unless a primal is already known.
    pub fn maybe_clone_for_primal(&mut self, loc: InsertLoc, orig: InstId) -> InstId {
        if let Some(primal) = self.lookup_primal(loc, orig, None) {
            return primal;
        }
        let op = self.module.op(orig);
        let ty = self.module.ty(orig).map(|t| self.maybe_clone_for_primal(loc, t));
        let operands: Vec<InstId> = self
            .module
            .operands(orig)
            .to_vec()
            .into_iter()
            .map(|operand| self.maybe_clone_for_primal(loc, operand))
            .collect();
        let payload = self.module.payload(orig).clone();

        let hoisted = op.is_type() && op.info().hoistable;
        let cloned = {
            let mut b = self.builder(loc);
            b.set_source_loc(b.module().loc(orig));
            if hoisted {
                b.get_type(op, &operands)
            } else {
                b.emit_with_payload(op, ty, &operands, payload)
            }
        };
        self.map_primal(orig, cloned);
        if hoisted {
            return cloned;
        }

        for child in self.module.children(orig).to_vec() {
            self.maybe_clone_for_primal(InsertLoc::Into(cloned), child);
        }
        for deco in self.module.decorations(orig).to_vec() {
            let deco_op = self.module.op(deco);
            if deco_op.is_autodiff_tag() {
                continue;
            }
            let operands: Vec<InstId> = self
                .module
                .operands(deco)
                .to_vec()
                .into_iter()
                .map(|operand| self.maybe_clone_for_primal(loc, operand))
                .collect();
            let payload = self.module.payload(deco).clone();
            self.builder(loc)
                .add_decoration_with_payload(cloned, deco_op, &operands, payload);
        }
        cloned
    }

    pub fn find_or_transcribe_primal(&mut self, loc: InsertLoc, orig: InstId) -> TranscribeResult<InstId> {
        if let Some(primal) = self.lookup_primal(loc, orig, None) {
            return Ok(primal);
        }
        if self.in_progress.contains(&orig) {
            return Err(TranscribeError::Reentrant { inst: orig });
        }
        self.transcribe(loc, orig)?;
        match self.lookup_primal(loc, orig, None) {
            Some(primal) => Ok(primal),
            // Transcription failed and was diagnosed; keep the primal program whole.
            None => Ok(self.maybe_clone_for_primal(loc, orig)),
        }
    }

    pub fn find_or_transcribe_diff(&mut self, loc: InsertLoc, orig: InstId) -> TranscribeResult<Option<InstId>> {
        self.transcribe(loc, orig)
    }

    /// Transcribe `orig` at `loc`, returning its differential.
    pub fn transcribe(&mut self, loc: InsertLoc, orig: InstId) -> TranscribeResult<Option<InstId>> {
        match self.state(orig) {
            TranscriptionState::Mapped => {
                if self.lookup_primal(loc, orig, None).is_none() {
                    return Err(self.unexpected(orig, "differential mapped without a primal"));
                }
                return Ok(self.maps.lookup_differential(orig, None));
            }
            TranscriptionState::InProgress => return Err(TranscribeError::Reentrant { inst: orig }),
            TranscriptionState::Untranscribed => {}
        }
        if self.failed.contains(&orig) {
            return Ok(None);
        }

        log::trace!("transcribing {orig} ({})", self.module.op(orig));
        self.in_progress.insert(orig);
        let result = self.transcribe_inst(loc, orig);
        self.in_progress.remove(&orig);
        let pair = result?;

        match (pair.primal, pair.differential) {
            (Some(primal), differential) => {
                self.map_primal(orig, primal);
                self.map_differential(orig, differential)?;
                self.tag_transcribed(orig, primal, differential);
                Ok(differential)
            }
            (None, Some(_)) => Err(self.unexpected(orig, "differential produced without a primal")),
            (None, None) => {
                self.failed.insert(orig);
                let op = self.module.op(orig);
                self.diagnose(
                    orig,
                    DiagnosticKind::CannotDifferentiate,
                    format!("instruction {orig} ({op}) cannot be differentiated"),
                );
                Ok(None)
            }
        }
    }

    /// Differentiate a function or generic function.
    ///
    /// Returns the primal (the original, which is reused) and its derivative,
    /// or no derivative when the function is not marked differentiable.
    pub fn transcribe_function(&mut self, func: InstId) -> TranscribeResult<(InstId, Option<InstId>)> {
        let op = self.module.op(func);
        if !matches!(op, Opcode::Func | Opcode::Generic) {
            return Err(self.unexpected(func, "only functions and generics can be differentiated"));
        }
        log::debug!(
            "differentiating {func} ({})",
            self.module.name_hint(func).unwrap_or("<anonymous>")
        );
        let loc = InsertLoc::Before(func);
        let diff = self.transcribe(loc, func)?;
        let primal = self.lookup_primal(loc, func, Some(func)).unwrap_or(func);
        log::debug!("differentiated {func}: primal {primal}, differential {diff:?}");
        Ok((primal, diff))
    }

    fn transcribe_inst(&mut self, loc: InsertLoc, orig: InstId) -> TranscribeResult<InstPair> {
        match self.module.op(orig) {
            Opcode::Func => self.transcribe_func(loc, orig),
            Opcode::Block => self.transcribe_block(loc, orig),
            Opcode::Generic => self.transcribe_generic(loc, orig),
            Opcode::Param => self.transcribe_param(loc, orig),
            Opcode::LookupWitness => self.transcribe_lookup_witness(loc, orig),
            Opcode::Return => self.transcribe_return(loc, orig),
            _ => {
                if let Some(pair) = self.transcribe_by_opcode(loc, orig)? {
                    return Ok(pair);
                }
                if self.module.is_type(orig) {
                    return self.transcribe_type(loc, orig);
                }
                Ok(InstPair::none())
            }
        }
    }

    /// Scope for derivative code derived from `orig`: next to it when global.
    fn header_loc(&self, loc: InsertLoc, orig: InstId) -> InsertLoc {
        if self.module.is_global(orig) {
            InsertLoc::Before(orig)
        } else {
            loc
        }
    }

    fn transcribe_func(&mut self, loc: InsertLoc, func: InstId) -> TranscribeResult<InstPair> {
        self.conformance.set_func(self.module, func);
        let loc = self.header_loc(loc, func);
        let func_ty = self
            .module
            .ty(func)
            .ok_or_else(|| self.unexpected(func, "function without a type"))?;
        let diff_ty = self.differentiate_func_type(loc, func_ty)?;

        let name = self
            .module
            .name_hint(func)
            .map(|name| format!("{}{name}", self.options.func_name_prefix));
        let forwarded: Vec<Opcode> = self
            .module
            .decorations(func)
            .iter()
            .map(|&d| self.module.op(d))
            .filter(|op| FORWARDED_DECORATIONS.contains(op))
            .collect();
        let diff_func = {
            let mut b = self.builder(loc);
            b.set_source_loc(b.module().loc(func));
            let diff_func = b.emit_container(Opcode::Func, Some(diff_ty));
            if let Some(name) = &name {
                b.add_name_hint(diff_func, name);
            }
            b.add_decoration(diff_func, Opcode::ForwardDifferentiable, &[]);
            for op in forwarded {
                b.add_decoration(diff_func, op, &[]);
            }
            diff_func
        };
        log::debug!("{func} -> {diff_func} ({})", name.as_deref().unwrap_or("<anonymous>"));

        // Register the header before the body so recursive references resolve to it.
        self.map_primal(func, func);
        self.map_differential(func, Some(diff_func))?;

        let blocks = self.module.blocks(func);
        let mut diff_blocks = Vec::with_capacity(blocks.len());
        for &block in &blocks {
            let diff_block = self.builder(loc).emit_block(diff_func);
            self.map_primal(block, diff_block);
            self.map_differential(block, Some(diff_block))?;
            diff_blocks.push(diff_block);
        }
        for (&block, &diff_block) in blocks.iter().zip(&diff_blocks) {
            self.transcribe_block(InsertLoc::Into(diff_block), block)?;
        }
        Ok(InstPair::new(func, diff_func))
    }

    fn transcribe_block(&mut self, loc: InsertLoc, block: InstId) -> TranscribeResult<InstPair> {
        let diff_block = match self.maps.lookup_differential(block, None) {
            Some(existing) => existing,
            None => {
                let parent = loc
                    .parent(self.module)
                    .ok_or_else(|| self.unexpected(block, "no scope to place the differential block"))?;
                let diff_block = self.builder(loc).emit_block(parent);
                self.map_primal(block, diff_block);
                self.map_differential(block, Some(diff_block))?;
                diff_block
            }
        };

        let inner = InsertLoc::Into(diff_block);
        for param in self.module.params(block) {
            self.transcribe(inner, param)?;
        }
        for inst in self.module.ordinary_insts(block) {
            if self.skip.contains(&inst) {
                log::trace!("skipping {inst}: only used by derivative decorations");
                continue;
            }
            self.transcribe(inner, inst)?;
        }
        Ok(InstPair::new(diff_block, diff_block))
    }

    fn transcribe_generic(&mut self, loc: InsertLoc, generic: InstId) -> TranscribeResult<InstPair> {
        let inner = self.module.innermost_return_value(generic);
        if let Some(func) = inner.filter(|&v| self.module.op(v) == Opcode::Func) {
            let differentiable = DIFFERENTIABILITY_MARKERS
                .iter()
                .any(|&op| self.module.has_decoration(func, op));
            if !differentiable {
                log::debug!("{generic} returns non-differentiable {func}; left unchanged");
                return Ok(InstPair::primal_only(generic));
            }
            self.conformance.set_func(self.module, func);
        }
        let body = self
            .module
            .first_block(generic)
            .ok_or_else(|| self.unexpected(generic, "generic without a body"))?;

        let loc = self.header_loc(loc, generic);
        let diff_ty = match self.module.ty(generic) {
            Some(ty) => self.find_or_transcribe_diff(loc, ty)?,
            None => None,
        };
        let name = self
            .module
            .name_hint(generic)
            .map(|name| format!("{}{name}", self.options.func_name_prefix));
        let (diff_generic, diff_body) = {
            let mut b = self.builder(loc);
            b.set_source_loc(b.module().loc(generic));
            let diff_generic = b.emit_container(Opcode::Generic, diff_ty);
            if let Some(name) = &name {
                b.add_name_hint(diff_generic, name);
            }
            let diff_body = b.emit_block(diff_generic);
            (diff_generic, diff_body)
        };
        log::debug!("{generic} -> {diff_generic}");

        self.map_primal(generic, generic);
        self.map_differential(generic, Some(diff_generic))?;
        self.map_primal(body, diff_body);
        self.map_differential(body, Some(diff_body))?;

        let skip = compute_skip_set(self.module, body);
        log::trace!("{generic}: {} instruction(s) in skip set", skip.len());
        let saved = std::mem::replace(&mut self.skip, skip);
        let result = self.transcribe_block(InsertLoc::Into(diff_body), body);
        self.skip = saved;
        result?;

        Ok(InstPair::new(generic, diff_generic))
    }

    fn transcribe_param(&mut self, loc: InsertLoc, param: InstId) -> TranscribeResult<InstPair> {
        let m = &*self.module;
        let block = m
            .parent(param)
            .ok_or_else(|| self.unexpected(param, "detached parameter"))?;
        let owner = m.parent(block);
        let owner_op = owner.map(|o| m.op(o));
        let is_entry = owner.and_then(|o| m.first_block(o)) == Some(block);
        let diff_block = loc
            .parent(m)
            .ok_or_else(|| self.unexpected(param, "no block to place the parameter"))?;

        match owner_op {
            Some(Opcode::Generic) => self.transcribe_generic_param(loc, diff_block, param),
            Some(Opcode::Func) if is_entry => self.transcribe_func_param(loc, diff_block, param),
            _ => self.transcribe_block_param(loc, diff_block, param),
        }
    }

    /// Generic type and witness parameters are cloned, never differentiated.
    fn transcribe_generic_param(
        &mut self,
        loc: InsertLoc,
        diff_block: InstId,
        param: InstId,
    ) -> TranscribeResult<InstPair> {
        let ty = match self.module.ty(param) {
            Some(ty) => Some(self.find_or_transcribe_primal(loc, ty)?),
            None => None,
        };
        let name = self.module.name_hint(param).map(str::to_string);
        let cloned = {
            let mut b = self.builder(loc);
            let cloned = b.emit_param(diff_block, ty);
            if let Some(name) = &name {
                b.add_name_hint(cloned, name);
            }
            cloned
        };
        self.map_primal(param, cloned);
        self.resolve_pending_conformances();
        Ok(InstPair::primal_only(cloned))
    }

    /// Re-register dictionary entries whose type and witness now have primals.
    fn resolve_pending_conformances(&mut self) {
        let entries = self.conformance.pending_entries().to_vec();
        for (ty, witness) in entries {
            let (Some(primal_ty), Some(primal_witness)) = (
                self.maps.lookup_primal(ty, None),
                self.maps.lookup_primal(witness, None),
            ) else {
                continue;
            };
            if let Some(cap) = self.conformance.capability_of_witness(self.module, primal_witness) {
                self.conformance.register(primal_ty, cap, primal_witness);
            }
        }
    }

    /// Forward calling convention: a differentiable parameter arrives as a pair.
    fn transcribe_func_param(
        &mut self,
        loc: InsertLoc,
        diff_block: InstId,
        param: InstId,
    ) -> TranscribeResult<InstPair> {
        let ty = self
            .module
            .ty(param)
            .ok_or_else(|| self.unexpected(param, "parameter without a type"))?;
        let primal_ty = self.find_or_transcribe_primal(loc, ty)?;
        let name = self.module.name_hint(param).map(str::to_string);

        let Some(pair_ty) = self.param_pass_type(loc, primal_ty)? else {
            let mut b = self.builder(loc);
            let cloned = b.emit_param(diff_block, Some(primal_ty));
            if let Some(name) = &name {
                b.add_name_hint(cloned, name);
            }
            return Ok(InstPair::primal_only(cloned));
        };
        let diff_ty = self
            .differentiate_type(loc, ty)?
            .ok_or_else(|| self.unexpected(param, "pair type without a differential type"))?;

        // For pointer-like parameters both views address halves of the pointee pair.
        let mut b = self.builder(loc);
        let pair_param = b.emit_param(diff_block, Some(pair_ty));
        b.mark_mixed(pair_param, Some(pair_ty));
        let primal = b.emit(Opcode::GetPrimal, Some(primal_ty), &[pair_param]);
        b.mark_primal(primal);
        let diff = b.emit(Opcode::GetDiff, Some(diff_ty), &[pair_param]);
        b.mark_differential(diff, Some(primal_ty));
        if let Some(name) = &name {
            b.add_name_hint(pair_param, &format!("{name}_pair"));
            b.add_name_hint(primal, name);
        }
        Ok(InstPair::new(primal, diff))
    }

    /// Phi-like parameters get a companion differential parameter.
    fn transcribe_block_param(
        &mut self,
        loc: InsertLoc,
        diff_block: InstId,
        param: InstId,
    ) -> TranscribeResult<InstPair> {
        let ty = self
            .module
            .ty(param)
            .ok_or_else(|| self.unexpected(param, "parameter without a type"))?;
        let primal_ty = self.find_or_transcribe_primal(loc, ty)?;
        let diff_ty = self.differentiate_type(loc, ty)?;
        let name = self.module.name_hint(param).map(str::to_string);

        let mut b = self.builder(loc);
        let primal = b.emit_param(diff_block, Some(primal_ty));
        if let Some(name) = &name {
            b.add_name_hint(primal, name);
        }
        let diff = diff_ty.map(|diff_ty| {
            let diff = b.emit_param(diff_block, Some(diff_ty));
            b.mark_differential(diff, Some(primal_ty));
            diff
        });
        Ok(InstPair::new(primal, diff))
    }

    fn transcribe_lookup_witness(&mut self, loc: InsertLoc, lookup: InstId) -> TranscribeResult<InstPair> {
        let m = &*self.module;
        let (Some(table), Some(key), Some(ty)) = (m.operand(lookup, 0), m.operand(lookup, 1), m.ty(lookup))
        else {
            return Err(self.unexpected(lookup, "malformed witness lookup"));
        };
        let primal_table = self.find_or_transcribe_primal(loc, table)?;
        let primal_key = self.find_or_transcribe_primal(loc, key)?;
        let primal_ty = self.find_or_transcribe_primal(loc, ty)?;
        let primal = self
            .builder(loc)
            .emit_lookup_witness(primal_ty, primal_table, primal_key);

        let m = &*self.module;
        let interface = m
            .ty(primal_table)
            .filter(|&t| m.op(t) == Opcode::WitnessTableType)
            .and_then(|t| m.operand(t, 0))
            .filter(|&i| m.op(i) == Opcode::InterfaceType);
        let Some(interface) = interface else {
            return Ok(InstPair::primal_only(primal));
        };

        // Requirements of the capability interfaces are type-level data.
        let is_capability = [
            self.conformance.capability_interface(super::Capability::Value),
            self.conformance.capability_interface(super::Capability::Pointer),
        ]
        .contains(&Some(interface));
        if is_capability {
            return Ok(InstPair::new(primal, primal));
        }

        match m.op(primal_ty) {
            Opcode::WitnessTableType => {
                let differentiable = m
                    .operand(primal_ty, 0)
                    .and_then(|i| self.conformance.capability_of_interface(m, i))
                    .is_some();
                if !differentiable {
                    return Ok(InstPair::primal_only(primal));
                }
                let mut b = Builder::new(&mut *self.module, loc);
                b.mark_primal(primal);
                let diff = self.conformance.extract_differential_witness(&mut b, primal);
                if let Some(diff) = diff {
                    b.mark_primal(diff);
                }
                return Ok(InstPair::new(primal, diff));
            }
            Opcode::TypeKind => {
                let mut b = Builder::new(&mut *self.module, loc);
                let diff = self.conformance.differential_for_type(&mut b, primal);
                return Ok(InstPair::new(primal, diff));
            }
            _ => {}
        }

        let Some(diff_key) = self.conformance.derivative_requirement(m, key) else {
            return Ok(InstPair::primal_only(primal));
        };
        let Some(req_ty) = self.conformance.requirement_type(m, interface, diff_key) else {
            return Ok(InstPair::primal_only(primal));
        };
        let primal_diff_key = self.find_or_transcribe_primal(loc, diff_key)?;
        let primal_req_ty = self.find_or_transcribe_primal(loc, req_ty)?;
        let diff = self
            .builder(loc)
            .emit_lookup_witness(primal_req_ty, primal_table, primal_diff_key);
        Ok(InstPair::new(primal, diff))
    }

    fn transcribe_return(&mut self, loc: InsertLoc, ret: InstId) -> TranscribeResult<InstPair> {
        let Some(value) = self.module.operand(ret, 0) else {
            let mut b = self.builder(loc);
            let primal_ret = b.emit(Opcode::Return, None, &[]);
            b.mark_mixed(primal_ret, None);
            return Ok(InstPair::primal_only(primal_ret));
        };

        // Returning a function, generic or type: differentiation happens at the
        // scope level rather than on a value.
        if matches!(
            self.module.op(value),
            Opcode::Func | Opcode::Generic | Opcode::StructType | Opcode::FuncType
        ) {
            let primal_value = self.find_or_transcribe_primal(loc, value)?;
            let diff_value = self.find_or_transcribe_diff(loc, value)?;
            let mut b = self.builder(loc);
            let diff_ret = b.emit_return(diff_value.unwrap_or(primal_value));
            b.mark_mixed(diff_ret, None);
            return Ok(match diff_value {
                Some(_) => InstPair::new(diff_ret, diff_ret),
                None => InstPair::primal_only(diff_ret),
            });
        }

        let ty = self
            .module
            .ty(value)
            .ok_or_else(|| self.unexpected(value, "returned value without a type"))?;
        let primal_ty = self.find_or_transcribe_primal(loc, ty)?;
        let primal_value = self.find_or_transcribe_primal(loc, value)?;

        if let Some(pair_ty) = self.try_diff_pair_type(loc, primal_ty)? {
            let diff_value = match self.find_or_transcribe_diff(loc, value)? {
                Some(diff) => Some(diff),
                None => self.zero_of(loc, ty)?,
            };
            if let Some(diff_value) = diff_value {
                let mut b = self.builder(loc);
                let pair = b.emit_make_pair(pair_ty, primal_value, diff_value);
                b.mark_mixed(pair, Some(pair_ty));
                let pair_ret = b.emit_return(pair);
                b.mark_mixed(pair_ret, Some(pair_ty));
                return Ok(InstPair::new(pair_ret, pair_ret));
            }
        }

        let mut b = self.builder(loc);
        let primal_ret = b.emit_return(primal_value);
        b.mark_mixed(primal_ret, None);
        Ok(InstPair::primal_only(primal_ret))
    }

    /// Types without an opcode rule: clone for the primal, differentiate structurally.
    fn transcribe_type(&mut self, loc: InsertLoc, ty: InstId) -> TranscribeResult<InstPair> {
        if let Some(generic) = self.generic_returning(ty) {
            if !self.in_progress.contains(&generic) {
                // Differentiating the generic differentiates `ty` through its return.
                self.in_progress.remove(&ty);
                let diff_generic = self.find_or_transcribe_diff(loc, generic);
                self.in_progress.insert(ty);
                if let Some(diff_generic) = diff_generic? {
                    if self.maps.has_differential(ty) {
                        let primal = self.maps.lookup_primal(ty, Some(ty)).unwrap_or(ty);
                        return Ok(InstPair::new(primal, self.maps.lookup_differential(ty, None)));
                    }
                    return Ok(InstPair::new(ty, self.module.return_value(diff_generic)));
                }
            }
        }
        let primal = self.maybe_clone_for_primal(loc, ty);
        let diff = self.differentiate_type_impl(loc, ty)?;
        Ok(InstPair::new(primal, diff))
    }

    /// The generic whose body returns `ty`, if any.
    fn generic_returning(&self, ty: InstId) -> Option<InstId> {
        let m = &*self.module;
        let generic = m.parent(m.parent(ty)?)?;
        (m.op(generic) == Opcode::Generic && m.return_value(generic) == Some(ty)).then_some(generic)
    }
}
