// This module implements the differentiable-type conformance context. It finds the two
// capability interfaces in a module (IDifferentiable for values, IDifferentiablePtrType
// for pointer-like types) through their known_builtin decorations, along with the
// requirement keys for the Differential associated type, the nested differential witness
// and the zero constructor. Conformances are recorded per (type, capability): global
// witness tables are registered when the context is created, and the diff_type_entry
// dictionary of a function is registered when the transcriber enters it. Lookups either
// read a concrete witness table entry or, for witnesses only known at run time (generic
// witness parameters), emit a lookup_witness at the builder cursor. Witnesses for arrays
// of conforming element types and for the null differential are synthesized on demand.

//! Differentiable-type conformance context.

use crate::ir::{Builder, InsertLoc, InstId, Module, Opcode};
use hashbrown::HashMap;

pub const VALUE_INTERFACE: &str = "IDifferentiable";
pub const POINTER_INTERFACE: &str = "IDifferentiablePtrType";
pub const DIFFERENTIAL_KEY: &str = "Differential";
pub const DIFFERENTIAL_WITNESS_KEY: &str = "DifferentialWitness";
pub const ZERO_KEY: &str = "dzero";

/// The two differentiability capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Value,
    Pointer,
}

impl Capability {
    pub const ALL: [Capability; 2] = [Capability::Value, Capability::Pointer];
}

#[derive(Debug, Clone, Copy)]
struct CapabilityInfo {
    interface: InstId,
    differential_key: Option<InstId>,
    differential_witness_key: Option<InstId>,
    zero_key: Option<InstId>,
}

impl CapabilityInfo {
    fn scan(module: &Module, interface: InstId) -> Self {
        let key_named = |name: &str| {
            module
                .children(interface)
                .iter()
                .filter(|&&req| module.op(req) == Opcode::InterfaceRequirement)
                .filter_map(|&req| module.operand(req, 0))
                .find(|&key| module.known_builtin(key) == Some(name))
        };
        Self {
            interface,
            differential_key: key_named(DIFFERENTIAL_KEY),
            differential_witness_key: key_named(DIFFERENTIAL_WITNESS_KEY),
            zero_key: key_named(ZERO_KEY),
        }
    }
}

#[derive(Debug, Default)]
pub struct ConformanceContext {
    value: Option<CapabilityInfo>,
    pointer: Option<CapabilityInfo>,
    witnesses: HashMap<(InstId, Capability), InstId>,
    /// Dictionary entries of the current function that mention local values.
    pending: Vec<(InstId, InstId)>,
}

impl ConformanceContext {
    pub fn new(module: &Module) -> Self {
        let mut ctx = Self::default();
        let globals = module.children(module.root());
        for &inst in globals {
            if module.op(inst) != Opcode::InterfaceType {
                continue;
            }
            match module.known_builtin(inst) {
                Some(VALUE_INTERFACE) => ctx.value = Some(CapabilityInfo::scan(module, inst)),
                Some(POINTER_INTERFACE) => ctx.pointer = Some(CapabilityInfo::scan(module, inst)),
                _ => {}
            }
        }
        for &inst in globals {
            if module.op(inst) != Opcode::WitnessTable {
                continue;
            }
            let (Some(ty), Some(cap)) = (module.operand(inst, 0), ctx.capability_of_witness(module, inst))
            else {
                continue;
            };
            ctx.witnesses.entry((ty, cap)).or_insert(inst);
        }
        log::debug!(
            "conformance context: value={:?} pointer={:?} witnesses={}",
            ctx.value.map(|c| c.interface),
            ctx.pointer.map(|c| c.interface),
            ctx.witnesses.len()
        );
        ctx
    }

    fn info(&self, cap: Capability) -> Option<&CapabilityInfo> {
        match cap {
            Capability::Value => self.value.as_ref(),
            Capability::Pointer => self.pointer.as_ref(),
        }
    }

    pub fn capability_interface(&self, cap: Capability) -> Option<InstId> {
        self.info(cap).map(|info| info.interface)
    }

    /// The capability an interface is, or inherits from.
    pub fn capability_of_interface(&self, module: &Module, interface: InstId) -> Option<Capability> {
        let mut stack = vec![interface];
        let mut seen = Vec::new();
        while let Some(cur) = stack.pop() {
            if seen.contains(&cur) {
                continue;
            }
            seen.push(cur);
            for cap in Capability::ALL {
                if self.capability_interface(cap) == Some(cur) {
                    return Some(cap);
                }
            }
            for &deco in module.decorations(cur) {
                if module.op(deco) == Opcode::Inherits {
                    stack.extend(module.operand(deco, 0));
                }
            }
        }
        None
    }

    /// Capability proven by a witness-table-typed value.
    pub fn capability_of_witness(&self, module: &Module, witness: InstId) -> Option<Capability> {
        let ty = module.ty(witness)?;
        if module.op(ty) != Opcode::WitnessTableType {
            return None;
        }
        self.capability_of_interface(module, module.operand(ty, 0)?)
    }

    pub fn register(&mut self, ty: InstId, cap: Capability, witness: InstId) {
        log::trace!("conformance {ty} : {cap:?} via {witness}");
        self.witnesses.insert((ty, cap), witness);
    }

    /// Register the differentiable-type dictionary of `func` and its enclosing scopes.
    pub fn set_func(&mut self, module: &Module, func: InstId) {
        self.pending.clear();
        let mut scope = Some(func);
        while let Some(cur) = scope {
            for &deco in module.decorations(cur) {
                if module.op(deco) != Opcode::DiffTypeEntry {
                    continue;
                }
                let (Some(ty), Some(witness)) = (module.operand(deco, 0), module.operand(deco, 1)) else {
                    continue;
                };
                if let Some(cap) = self.capability_of_witness(module, witness) {
                    self.register(ty, cap, witness);
                }
                if !module.is_global(ty) || !module.is_global(witness) {
                    self.pending.push((ty, witness));
                }
            }
            scope = module.parent(cur);
        }
    }

    pub fn pending_entries(&self) -> &[(InstId, InstId)] {
        &self.pending
    }

    /// Find the witness proving `ty` conforms to `cap`, synthesizing one if needed.
    pub fn lookup_conformance(&mut self, b: &mut Builder<'_>, ty: InstId, cap: Capability) -> Option<InstId> {
        if let Some(&witness) = self.witnesses.get(&(ty, cap)) {
            return Some(witness);
        }
        let witness = match b.module().op(ty) {
            Opcode::NullDifferentialType if cap == Capability::Value => self.synthesize_witness(b, ty, cap, ty)?,
            Opcode::ArrayType => {
                let m = b.module();
                let (element, count) = (m.operand(ty, 0)?, m.operand(ty, 1)?);
                let element_witness = self.lookup_conformance(b, element, cap)?;
                if b.module().op(element_witness) != Opcode::WitnessTable {
                    return None;
                }
                let diff_element = self.differential_for_type(b, element)?;
                let diff_array = Builder::at_module(b.module_mut()).array_type(diff_element, count);
                if !b.module().is_global(diff_array) {
                    return None;
                }
                self.synthesize_witness(b, ty, cap, diff_array)?
            }
            _ => return None,
        };
        self.register(ty, cap, witness);
        Some(witness)
    }

    fn synthesize_witness(
        &mut self,
        b: &mut Builder<'_>,
        ty: InstId,
        cap: Capability,
        differential: InstId,
    ) -> Option<InstId> {
        let info = *self.info(cap)?;
        let mut gb = Builder::at_module(b.module_mut());
        let table_ty = gb.witness_table_type(info.interface);
        let table = gb.emit(Opcode::WitnessTable, Some(table_ty), &[ty]);
        gb.set_insert_loc(InsertLoc::Into(table));
        if let Some(key) = info.differential_key {
            gb.emit(Opcode::WitnessTableEntry, None, &[key, differential]);
        }
        log::debug!("synthesized {cap:?} witness {table} for {ty}");
        Some(table)
    }

    pub fn is_differentiable(&mut self, b: &mut Builder<'_>, ty: InstId) -> Option<Capability> {
        Capability::ALL
            .into_iter()
            .find(|&cap| self.lookup_conformance(b, ty, cap).is_some())
    }

    /// Value of requirement `key` in `witness`, read directly or looked up at the cursor.
    fn witness_requirement(
        &self,
        b: &mut Builder<'_>,
        witness: InstId,
        key: InstId,
        result_ty: impl FnOnce(&mut Builder<'_>) -> Option<InstId>,
    ) -> Option<InstId> {
        let m = b.module();
        if m.op(witness) == Opcode::WitnessTable {
            return m
                .children(witness)
                .iter()
                .copied()
                .filter(|&e| m.op(e) == Opcode::WitnessTableEntry)
                .find(|&e| m.operand(e, 0) == Some(key))
                .and_then(|e| m.operand(e, 1));
        }
        let ty = result_ty(b)?;
        Some(b.emit_lookup_witness(ty, witness, key))
    }

    /// Differential type associated with `ty` through its conformance.
    pub fn differential_for_type(&mut self, b: &mut Builder<'_>, ty: InstId) -> Option<InstId> {
        if b.module().op(ty) == Opcode::NullDifferentialType {
            return Some(ty);
        }
        for cap in Capability::ALL {
            let Some(witness) = self.lookup_conformance(b, ty, cap) else {
                continue;
            };
            let key = self.info(cap)?.differential_key?;
            return self.witness_requirement(b, witness, key, |b| Some(b.type_kind()));
        }
        None
    }

    /// The registered zero constructor for `ty` (a function taking no arguments).
    pub fn zero_method_for_type(&mut self, b: &mut Builder<'_>, ty: InstId) -> Option<InstId> {
        let witness = self.lookup_conformance(b, ty, Capability::Value)?;
        let key = self.info(Capability::Value)?.zero_key?;
        if b.module().op(witness) == Opcode::WitnessTable {
            return self.witness_requirement(b, witness, key, |_| None);
        }
        let diff = self.differential_for_type(b, ty)?;
        let fn_ty = b.func_type(diff, &[]);
        Some(b.emit_lookup_witness(fn_ty, witness, key))
    }

    /// Witness that the differential type of `witness`'s type is itself differentiable.
    pub fn extract_differential_witness(&mut self, b: &mut Builder<'_>, witness: InstId) -> Option<InstId> {
        let cap = self.capability_of_witness(b.module(), witness)?;
        let info = *self.info(cap)?;
        let key = info.differential_witness_key?;
        self.witness_requirement(b, witness, key, |b| Some(b.witness_table_type(info.interface)))
    }

    /// The witness for the null differential, used when packing existential zeros.
    pub fn null_differential_witness(&mut self, b: &mut Builder<'_>) -> Option<InstId> {
        let null_ty = b.get_type(Opcode::NullDifferentialType, &[]);
        self.lookup_conformance(b, null_ty, Capability::Value)
    }

    /// Key of the derivative requirement declared for `key`, if any.
    pub fn derivative_requirement(&self, module: &Module, key: InstId) -> Option<InstId> {
        let deco = module.find_decoration(key, Opcode::DerivativeRequirement)?;
        module.operand(deco, 0)
    }

    /// Declared type of requirement `key` in `interface`.
    pub fn requirement_type(&self, module: &Module, interface: InstId, key: InstId) -> Option<InstId> {
        module
            .children(interface)
            .iter()
            .copied()
            .filter(|&req| module.op(req) == Opcode::InterfaceRequirement)
            .find(|&req| module.operand(req, 0) == Some(key))
            .and_then(|req| module.operand(req, 1))
    }
}
