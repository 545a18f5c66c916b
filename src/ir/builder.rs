//! Cursor-based instruction emission.
//!
//! A [`Builder`] borrows the module for the duration of a few emissions and
//! inserts new instructions at its [`InsertLoc`]. Types and literals are routed
//! through [`Builder::get_type`] and friends so structurally identical ones
//! share a handle.

use super::{HoistKey, InstId, Module, Opcode, Payload, Position, SourceLoc};

/// Insertion cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertLoc {
    /// Append to the end of the given parent.
    Into(InstId),
    /// Insert immediately before the given instruction.
    Before(InstId),
    /// Insert after the given instruction; advances past each emitted instruction.
    After(InstId),
}

impl InsertLoc {
    /// Scope that receives newly emitted instructions.
    pub fn parent(self, module: &Module) -> Option<InstId> {
        match self {
            InsertLoc::Into(parent) => Some(parent),
            InsertLoc::Before(inst) | InsertLoc::After(inst) => module.parent(inst),
        }
    }
}

pub struct Builder<'m> {
    module: &'m mut Module,
    loc: InsertLoc,
    source_loc: SourceLoc,
}

impl<'m> Builder<'m> {
    pub fn new(module: &'m mut Module, loc: InsertLoc) -> Self {
        Self {
            module,
            loc,
            source_loc: SourceLoc::default(),
        }
    }

    /// Builder that appends to module scope.
    pub fn at_module(module: &'m mut Module) -> Self {
        let root = module.root();
        Self::new(module, InsertLoc::Into(root))
    }

    pub fn loc(&self) -> InsertLoc {
        self.loc
    }

    pub fn set_insert_loc(&mut self, loc: InsertLoc) {
        self.loc = loc;
    }

    /// Source location stamped on everything emitted from now on.
    pub fn set_source_loc(&mut self, loc: SourceLoc) {
        self.source_loc = loc;
    }

    pub fn module(&self) -> &Module {
        self.module
    }

    pub fn module_mut(&mut self) -> &mut Module {
        self.module
    }

    fn insert_at_cursor(&mut self, id: InstId) {
        match self.loc {
            InsertLoc::Into(parent) => self.module.attach(id, parent, Position::End),
            InsertLoc::Before(anchor) => {
                let parent = self.module.parent(anchor).unwrap_or(self.module.root());
                self.module.attach(id, parent, Position::Before(anchor));
            }
            InsertLoc::After(anchor) => {
                let parent = self.module.parent(anchor).unwrap_or(self.module.root());
                self.module.attach(id, parent, Position::After(anchor));
                self.loc = InsertLoc::After(id);
            }
        }
    }

    pub fn emit(&mut self, op: Opcode, ty: Option<InstId>, operands: &[InstId]) -> InstId {
        self.emit_with_payload(op, ty, operands, Payload::None)
    }

    pub fn emit_with_payload(
        &mut self,
        op: Opcode,
        ty: Option<InstId>,
        operands: &[InstId],
        payload: Payload,
    ) -> InstId {
        debug_assert!(!op.is_decoration(), "use add_decoration for {op}");
        let id = self.module.create(op, ty, operands, payload);
        self.module.set_loc(id, self.source_loc);
        self.insert_at_cursor(id);
        id
    }

    /// Emit an instruction that owns children (functions, generics, structs).
    pub fn emit_container(&mut self, op: Opcode, ty: Option<InstId>) -> InstId {
        self.emit(op, ty, &[])
    }

    pub fn emit_block(&mut self, parent: InstId) -> InstId {
        let id = self.module.create(Opcode::Block, None, &[], Payload::None);
        self.module.set_loc(id, self.source_loc);
        self.module.attach(id, parent, Position::End);
        id
    }

    /// Append a parameter after the existing parameters of `block`.
    pub fn emit_param(&mut self, block: InstId, ty: Option<InstId>) -> InstId {
        let id = self.module.create(Opcode::Param, ty, &[], Payload::None);
        self.module.set_loc(id, self.source_loc);
        let position = match self.module.params(block).last() {
            Some(&last) => Position::After(last),
            None => Position::Start,
        };
        self.module.attach(id, block, position);
        id
    }

    /// Hoisted, deduplicated type construction.
    ///
    /// Types whose operands are all global live at module scope. Types that
    /// mention a local value (a generic parameter, say) are placed right after
    /// the innermost, latest such operand.
    pub fn get_type(&mut self, op: Opcode, operands: &[InstId]) -> InstId {
        self.get_hoisted(op, None, operands, Payload::None)
    }

    fn get_hoisted(
        &mut self,
        op: Opcode,
        ty: Option<InstId>,
        operands: &[InstId],
        payload: Payload,
    ) -> InstId {
        let key = HoistKey::new(op, ty, operands, &payload);
        if let Some(existing) = self.module.lookup_hoisted(&key) {
            return existing;
        }
        let id = self.module.create(op, ty, operands, payload);
        self.module.set_loc(id, self.source_loc);
        match self.local_anchor(operands.iter().copied().chain(ty)) {
            None => {
                let root = self.module.root();
                self.module.attach(id, root, Position::End);
            }
            Some((parent, position)) => self.module.attach(id, parent, position),
        }
        self.module.register_hoisted(key, id);
        id
    }

    fn local_anchor(&self, values: impl Iterator<Item = InstId>) -> Option<(InstId, Position)> {
        let m = &*self.module;
        let mut best: Option<(usize, usize, InstId)> = None;
        for value in values.filter(|&v| !m.is_global(v)) {
            let parent = m.parent(value)?;
            let depth = m.depth(value);
            let index = m.children(parent).iter().position(|&c| c == value).unwrap_or(0);
            if best.map_or(true, |(d, i, _)| (depth, index) > (d, i)) {
                best = Some((depth, index, value));
            }
        }
        let (_, _, anchor) = best?;
        let parent = m.parent(anchor)?;
        if m.op(anchor) == Opcode::Param {
            let first_ordinary = m.ordinary_insts(parent).first().copied();
            Some((parent, first_ordinary.map_or(Position::End, Position::Before)))
        } else {
            Some((parent, Position::After(anchor)))
        }
    }

    pub fn void_type(&mut self) -> InstId {
        self.get_type(Opcode::VoidType, &[])
    }

    pub fn int_type(&mut self) -> InstId {
        self.get_type(Opcode::IntType, &[])
    }

    pub fn float_type(&mut self) -> InstId {
        self.get_type(Opcode::FloatType, &[])
    }

    pub fn bool_type(&mut self) -> InstId {
        self.get_type(Opcode::BoolType, &[])
    }

    pub fn type_kind(&mut self) -> InstId {
        self.get_type(Opcode::TypeKind, &[])
    }

    pub fn array_type(&mut self, element: InstId, count: InstId) -> InstId {
        self.get_type(Opcode::ArrayType, &[element, count])
    }

    pub fn func_type(&mut self, result: InstId, params: &[InstId]) -> InstId {
        let mut operands = Vec::with_capacity(params.len() + 1);
        operands.push(result);
        operands.extend_from_slice(params);
        self.get_type(Opcode::FuncType, &operands)
    }

    pub fn witness_table_type(&mut self, interface: InstId) -> InstId {
        self.get_type(Opcode::WitnessTableType, &[interface])
    }

    pub fn get_int_value(&mut self, ty: InstId, value: i64) -> InstId {
        self.get_hoisted(Opcode::IntLit, Some(ty), &[], Payload::Int(value))
    }

    pub fn get_float_value(&mut self, ty: InstId, value: f64) -> InstId {
        self.get_hoisted(Opcode::FloatLit, Some(ty), &[], Payload::Float(value))
    }

    pub fn get_bool_value(&mut self, value: bool) -> InstId {
        let ty = self.bool_type();
        self.get_hoisted(Opcode::BoolLit, Some(ty), &[], Payload::Int(value as i64))
    }

    /// The shared null differential value.
    pub fn null_differential(&mut self) -> InstId {
        let ty = self.get_type(Opcode::NullDifferentialType, &[]);
        self.get_hoisted(Opcode::NullDifferential, Some(ty), &[], Payload::None)
    }

    pub fn emit_return(&mut self, value: InstId) -> InstId {
        self.emit(Opcode::Return, None, &[value])
    }

    pub fn emit_call(&mut self, ty: InstId, callee: InstId, args: &[InstId]) -> InstId {
        let mut operands = Vec::with_capacity(args.len() + 1);
        operands.push(callee);
        operands.extend_from_slice(args);
        self.emit(Opcode::Call, Some(ty), &operands)
    }

    pub fn emit_make_pair(&mut self, pair_ty: InstId, primal: InstId, diff: InstId) -> InstId {
        self.emit(Opcode::MakeDiffPair, Some(pair_ty), &[primal, diff])
    }

    pub fn emit_lookup_witness(&mut self, ty: InstId, table: InstId, key: InstId) -> InstId {
        self.emit(Opcode::LookupWitness, Some(ty), &[table, key])
    }

    pub fn add_decoration(&mut self, target: InstId, op: Opcode, operands: &[InstId]) -> InstId {
        self.add_decoration_with_payload(target, op, operands, Payload::None)
    }

    pub fn add_decoration_with_payload(
        &mut self,
        target: InstId,
        op: Opcode,
        operands: &[InstId],
        payload: Payload,
    ) -> InstId {
        debug_assert!(op.is_decoration(), "{op} is not a decoration");
        let id = self.module.create(op, None, operands, payload);
        self.module.attach(id, target, Position::End);
        id
    }

    pub fn add_name_hint(&mut self, target: InstId, name: &str) -> InstId {
        self.add_decoration_with_payload(target, Opcode::NameHint, &[], Payload::Str(name.to_string()))
    }

    pub fn mark_primal(&mut self, inst: InstId) {
        self.add_decoration(inst, Opcode::PrimalInst, &[]);
    }

    /// Tag `inst` as the differential of a value of `primal_ty`.
    pub fn mark_differential(&mut self, inst: InstId, primal_ty: Option<InstId>) {
        let operands: Vec<InstId> = primal_ty.into_iter().collect();
        self.add_decoration(inst, Opcode::DifferentialInst, &operands);
    }

    /// Tag `inst` as carrying primal and differential together.
    pub fn mark_mixed(&mut self, inst: InstId, pair_ty: Option<InstId>) {
        let operands: Vec<InstId> = pair_ty.into_iter().collect();
        self.add_decoration(inst, Opcode::MixedDifferentialInst, &operands);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_types_are_deduplicated() {
        let mut m = Module::new();
        let mut b = Builder::at_module(&mut m);
        let f = b.float_type();
        let four = {
            let int = b.int_type();
            b.get_int_value(int, 4)
        };
        let a1 = b.array_type(f, four);
        let a2 = b.array_type(f, four);
        assert_eq!(a1, a2);
        assert_eq!(b.float_type(), f);
        assert!(m.is_global(a1));
    }

    #[test]
    fn local_types_follow_their_operands() {
        let mut m = Module::new();
        let mut b = Builder::at_module(&mut m);
        let kind = b.type_kind();
        let generic = b.emit_container(Opcode::Generic, None);
        let block = b.emit_block(generic);
        b.set_insert_loc(InsertLoc::Into(block));
        let t = b.emit_param(block, Some(kind));
        let ret = b.emit_return(t);
        let ptr = b.get_type(Opcode::PtrType, &[t]);
        assert_eq!(m.parent(ptr), Some(block));
        assert_eq!(m.children(block), &[t, ptr, ret]);
    }

    #[test]
    fn params_stay_in_front() {
        let mut m = Module::new();
        let mut b = Builder::at_module(&mut m);
        let f = b.float_type();
        let func = b.emit_container(Opcode::Func, None);
        let block = b.emit_block(func);
        b.set_insert_loc(InsertLoc::Into(block));
        let p0 = b.emit_param(block, Some(f));
        let neg = b.emit(Opcode::Neg, Some(f), &[p0]);
        let p1 = b.emit_param(block, Some(f));
        assert_eq!(m.children(block), &[p0, p1, neg]);
    }
}
