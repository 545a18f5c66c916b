// This module defines the instruction graph that the transcriber operates on. Every
// instruction lives in a single arena (Module) and is addressed by a copyable InstId
// handle, so the primal, differential and original programs can freely refer to each
// other without lifetime entanglement. An instruction carries an opcode, an optional
// type (itself an instruction), operands, an optional literal payload, ordered children,
// attached decorations, a use list and a source location. Types and literals whose
// operands are all global are hoisted to the module and deduplicated by the builder, so
// type identity can be compared by handle. The module exposes the parent-chain, operand,
// decoration and use queries that the autodiff passes consume.

//! Arena-based instruction graph.
//!
//! The graph is a tree of scopes (module → function/generic → block → instruction)
//! with cross-links through operands. Decorations are instructions too; they hang
//! off their target in a separate list so that iteration over ordinary children
//! never sees them.

use hashbrown::HashMap;
use std::fmt;

pub mod builder;
pub mod parser;
pub mod printer;

pub use builder::{Builder, InsertLoc};
pub use parser::{parse_module, ParseError, ParsedModule};

/// Stable handle to an instruction in a [`Module`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstId(pub u32);

impl InstId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for InstId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// Line/column of the text an instruction was parsed from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceLoc {
    pub line: u32,
    pub column: u32,
}

impl fmt::Display for SourceLoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// Literal data attached to an instruction.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Payload {
    #[default]
    None,
    Int(i64),
    Float(f64),
    Str(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    /// Scoping and table structure (module, block, fields, entries).
    Structure,
    Type,
    Value,
    Literal,
    Decoration,
}

#[derive(Debug, Clone, Copy)]
pub struct OpInfo {
    pub name: &'static str,
    pub kind: OpKind,
    /// Deduplicated and placed at module scope when all operands are global.
    pub hoistable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    // Structure
    Module,
    Func,
    Generic,
    Block,
    Param,
    StructKey,
    StructField,
    InterfaceRequirement,
    WitnessTable,
    WitnessTableEntry,

    // Types
    VoidType,
    BoolType,
    IntType,
    UIntType,
    FloatType,
    TypeKind,
    PtrType,
    OutType,
    InOutType,
    RefType,
    ArrayType,
    TupleType,
    TypePack,
    OptionalType,
    FuncType,
    StructType,
    InterfaceType,
    AssociatedType,
    WitnessTableType,
    DiffPairType,
    DiffPtrPairType,
    NullDifferentialType,

    // Literals
    IntLit,
    FloatLit,
    BoolLit,

    // Values
    Add,
    Sub,
    Mul,
    Div,
    Neg,
    Less,
    Greater,
    Equal,
    IntCast,
    MakeStruct,
    GetField,
    GetElement,
    MakeArray,
    MakeArrayFromElement,
    MakeDiffPair,
    GetPrimal,
    GetDiff,
    MakeExistential,
    NullDifferential,
    Call,
    ForwardDifferentiate,
    Specialize,
    LookupWitness,
    Var,
    Load,
    Store,
    Branch,
    CondBranch,
    Return,
    Intrinsic,

    // Decorations
    NameHint,
    KnownBuiltin,
    ForwardDifferentiable,
    BackwardDifferentiable,
    ForwardDerivative,
    BackwardDerivative,
    ForceInline,
    NoDiff,
    DerivativeMember,
    DerivativeRequirement,
    DiffTypeEntry,
    Inherits,
    PrimalInst,
    DifferentialInst,
    MixedDifferentialInst,
}

impl Opcode {
    pub const ALL: &'static [Opcode] = &[
        Opcode::Module, Opcode::Func, Opcode::Generic, Opcode::Block, Opcode::Param,
        Opcode::StructKey, Opcode::StructField, Opcode::InterfaceRequirement,
        Opcode::WitnessTable, Opcode::WitnessTableEntry,
        Opcode::VoidType, Opcode::BoolType, Opcode::IntType, Opcode::UIntType,
        Opcode::FloatType, Opcode::TypeKind, Opcode::PtrType, Opcode::OutType,
        Opcode::InOutType, Opcode::RefType, Opcode::ArrayType, Opcode::TupleType,
        Opcode::TypePack, Opcode::OptionalType, Opcode::FuncType, Opcode::StructType,
        Opcode::InterfaceType, Opcode::AssociatedType, Opcode::WitnessTableType,
        Opcode::DiffPairType, Opcode::DiffPtrPairType, Opcode::NullDifferentialType,
        Opcode::IntLit, Opcode::FloatLit, Opcode::BoolLit,
        Opcode::Add, Opcode::Sub, Opcode::Mul, Opcode::Div, Opcode::Neg, Opcode::Less,
        Opcode::Greater, Opcode::Equal, Opcode::IntCast, Opcode::MakeStruct,
        Opcode::GetField, Opcode::GetElement, Opcode::MakeArray,
        Opcode::MakeArrayFromElement, Opcode::MakeDiffPair, Opcode::GetPrimal,
        Opcode::GetDiff, Opcode::MakeExistential, Opcode::NullDifferential, Opcode::Call,
        Opcode::ForwardDifferentiate, Opcode::Specialize, Opcode::LookupWitness,
        Opcode::Var, Opcode::Load, Opcode::Store, Opcode::Branch, Opcode::CondBranch,
        Opcode::Return, Opcode::Intrinsic,
        Opcode::NameHint, Opcode::KnownBuiltin, Opcode::ForwardDifferentiable,
        Opcode::BackwardDifferentiable, Opcode::ForwardDerivative,
        Opcode::BackwardDerivative, Opcode::ForceInline, Opcode::NoDiff,
        Opcode::DerivativeMember, Opcode::DerivativeRequirement, Opcode::DiffTypeEntry,
        Opcode::Inherits, Opcode::PrimalInst, Opcode::DifferentialInst,
        Opcode::MixedDifferentialInst,
    ];

    pub const fn info(self) -> OpInfo {
        use OpKind::*;
        use Opcode::*;
        let (name, kind, hoistable) = match self {
            Module => ("module", Structure, false),
            Func => ("func", Value, false),
            Generic => ("generic", Value, false),
            Block => ("block", Structure, false),
            Param => ("param", Value, false),
            StructKey => ("key", Value, false),
            StructField => ("field", Structure, false),
            InterfaceRequirement => ("interface_req", Structure, false),
            WitnessTable => ("witness_table", Value, false),
            WitnessTableEntry => ("entry", Structure, false),

            VoidType => ("void", Type, true),
            BoolType => ("bool", Type, true),
            IntType => ("int", Type, true),
            UIntType => ("uint", Type, true),
            FloatType => ("float", Type, true),
            TypeKind => ("type_kind", Type, true),
            PtrType => ("ptr", Type, true),
            OutType => ("out", Type, true),
            InOutType => ("inout", Type, true),
            RefType => ("ref", Type, true),
            ArrayType => ("array", Type, true),
            TupleType => ("tuple", Type, true),
            TypePack => ("type_pack", Type, true),
            OptionalType => ("optional", Type, true),
            FuncType => ("func_type", Type, true),
            StructType => ("struct", Type, false),
            InterfaceType => ("interface", Type, false),
            AssociatedType => ("assoc_type", Type, false),
            WitnessTableType => ("witness_table_type", Type, true),
            DiffPairType => ("diff_pair", Type, true),
            DiffPtrPairType => ("diff_ptr_pair", Type, true),
            NullDifferentialType => ("null_diff_type", Type, true),

            IntLit => ("int_lit", Literal, true),
            FloatLit => ("float_lit", Literal, true),
            BoolLit => ("bool_lit", Literal, true),

            Add => ("add", Value, false),
            Sub => ("sub", Value, false),
            Mul => ("mul", Value, false),
            Div => ("div", Value, false),
            Neg => ("neg", Value, false),
            Less => ("lt", Value, false),
            Greater => ("gt", Value, false),
            Equal => ("eq", Value, false),
            IntCast => ("int_cast", Value, false),
            MakeStruct => ("make_struct", Value, false),
            GetField => ("get_field", Value, false),
            GetElement => ("get_element", Value, false),
            MakeArray => ("make_array", Value, false),
            MakeArrayFromElement => ("make_array_from_element", Value, false),
            MakeDiffPair => ("make_pair", Value, false),
            GetPrimal => ("get_primal", Value, false),
            GetDiff => ("get_diff", Value, false),
            MakeExistential => ("make_existential", Value, false),
            NullDifferential => ("null_diff", Value, true),
            Call => ("call", Value, false),
            ForwardDifferentiate => ("fwd_diff", Value, false),
            Specialize => ("specialize", Value, false),
            LookupWitness => ("lookup_witness", Value, false),
            Var => ("var", Value, false),
            Load => ("load", Value, false),
            Store => ("store", Value, false),
            Branch => ("br", Value, false),
            CondBranch => ("cond_br", Value, false),
            Return => ("ret", Value, false),
            Intrinsic => ("intrinsic", Value, false),

            NameHint => ("name_hint", Decoration, false),
            KnownBuiltin => ("known_builtin", Decoration, false),
            ForwardDifferentiable => ("fwd_differentiable", Decoration, false),
            BackwardDifferentiable => ("bwd_differentiable", Decoration, false),
            ForwardDerivative => ("fwd_derivative", Decoration, false),
            BackwardDerivative => ("bwd_derivative", Decoration, false),
            ForceInline => ("force_inline", Decoration, false),
            NoDiff => ("no_diff", Decoration, false),
            DerivativeMember => ("derivative_member", Decoration, false),
            DerivativeRequirement => ("derivative_req", Decoration, false),
            DiffTypeEntry => ("diff_type_entry", Decoration, false),
            Inherits => ("inherits", Decoration, false),
            PrimalInst => ("primal_inst", Decoration, false),
            DifferentialInst => ("differential_inst", Decoration, false),
            MixedDifferentialInst => ("mixed_inst", Decoration, false),
        };
        OpInfo { name, kind, hoistable }
    }

    pub fn from_name(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|op| op.info().name == s)
    }

    pub fn is_type(self) -> bool {
        self.info().kind == OpKind::Type
    }

    pub fn is_decoration(self) -> bool {
        self.info().kind == OpKind::Decoration
    }

    pub fn is_literal(self) -> bool {
        self.info().kind == OpKind::Literal
    }

    /// Decorations written by the autodiff tagging primitives.
    pub fn is_autodiff_tag(self) -> bool {
        matches!(
            self,
            Opcode::PrimalInst | Opcode::DifferentialInst | Opcode::MixedDifferentialInst
        )
    }

    /// Pointer-like wrappers whose differential re-wraps the differential pointee.
    pub fn is_pointer_like(self) -> bool {
        matches!(
            self,
            Opcode::PtrType | Opcode::OutType | Opcode::InOutType | Opcode::RefType
        )
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.info().name)
    }
}

/// A single node of the instruction graph.
#[derive(Debug, Clone)]
pub struct Inst {
    pub op: Opcode,
    pub ty: Option<InstId>,
    pub operands: Vec<InstId>,
    pub payload: Payload,
    pub parent: Option<InstId>,
    pub children: Vec<InstId>,
    pub decorations: Vec<InstId>,
    pub uses: Vec<InstId>,
    pub loc: SourceLoc,
}

impl Inst {
    fn new(op: Opcode, ty: Option<InstId>, operands: Vec<InstId>, payload: Payload) -> Self {
        Self {
            op,
            ty,
            operands,
            payload,
            parent: None,
            children: Vec::new(),
            decorations: Vec::new(),
            uses: Vec::new(),
            loc: SourceLoc::default(),
        }
    }
}

/// Where to attach a detached instruction within its new parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    Start,
    End,
    Before(InstId),
    After(InstId),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum PayloadKey {
    None,
    Int(i64),
    Float(u64),
    Str(String),
}

impl From<&Payload> for PayloadKey {
    fn from(payload: &Payload) -> Self {
        match payload {
            Payload::None => PayloadKey::None,
            Payload::Int(v) => PayloadKey::Int(*v),
            Payload::Float(v) => PayloadKey::Float(v.to_bits()),
            Payload::Str(s) => PayloadKey::Str(s.clone()),
        }
    }
}

/// Structural identity of a hoistable instruction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HoistKey {
    op: Opcode,
    ty: Option<InstId>,
    operands: Vec<InstId>,
    payload: PayloadKey,
}

impl HoistKey {
    pub fn new(op: Opcode, ty: Option<InstId>, operands: &[InstId], payload: &Payload) -> Self {
        Self {
            op,
            ty,
            operands: operands.to_vec(),
            payload: payload.into(),
        }
    }
}

/// Arena owning every instruction of a program.
#[derive(Debug, Clone)]
pub struct Module {
    insts: Vec<Inst>,
    hoisted: HashMap<HoistKey, InstId>,
}

impl Module {
    pub fn new() -> Self {
        Self {
            insts: vec![Inst::new(Opcode::Module, None, Vec::new(), Payload::None)],
            hoisted: HashMap::new(),
        }
    }

    pub fn root(&self) -> InstId {
        InstId(0)
    }

    pub fn len(&self) -> usize {
        self.insts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.insts.len() <= 1
    }

    pub fn inst(&self, id: InstId) -> &Inst {
        &self.insts[id.index()]
    }

    pub fn op(&self, id: InstId) -> Opcode {
        self.inst(id).op
    }

    pub fn ty(&self, id: InstId) -> Option<InstId> {
        self.inst(id).ty
    }

    pub fn operands(&self, id: InstId) -> &[InstId] {
        &self.inst(id).operands
    }

    pub fn operand(&self, id: InstId, index: usize) -> Option<InstId> {
        self.inst(id).operands.get(index).copied()
    }

    pub fn payload(&self, id: InstId) -> &Payload {
        &self.inst(id).payload
    }

    pub fn parent(&self, id: InstId) -> Option<InstId> {
        self.inst(id).parent
    }

    pub fn children(&self, id: InstId) -> &[InstId] {
        &self.inst(id).children
    }

    pub fn decorations(&self, id: InstId) -> &[InstId] {
        &self.inst(id).decorations
    }

    pub fn uses(&self, id: InstId) -> &[InstId] {
        &self.inst(id).uses
    }

    pub fn loc(&self, id: InstId) -> SourceLoc {
        self.inst(id).loc
    }

    pub fn set_loc(&mut self, id: InstId, loc: SourceLoc) {
        self.insts[id.index()].loc = loc;
    }

    /// Create a detached instruction and register its uses.
    pub fn create(
        &mut self,
        op: Opcode,
        ty: Option<InstId>,
        operands: &[InstId],
        payload: Payload,
    ) -> InstId {
        let id = InstId(self.insts.len() as u32);
        self.insts.push(Inst::new(op, ty, operands.to_vec(), payload));
        self.add_uses(id);
        id
    }

    /// Attach a detached instruction to `parent`. Decorations go to the decoration list.
    pub fn attach(&mut self, id: InstId, parent: InstId, position: Position) {
        debug_assert!(self.inst(id).parent.is_none(), "{id} is already attached");
        self.insts[id.index()].parent = Some(parent);
        let is_decoration = self.op(id).is_decoration();
        let list = if is_decoration {
            &mut self.insts[parent.index()].decorations
        } else {
            &mut self.insts[parent.index()].children
        };
        let index = match position {
            Position::Start => 0,
            Position::End => list.len(),
            Position::Before(anchor) => list.iter().position(|&c| c == anchor).unwrap_or(list.len()),
            Position::After(anchor) => list
                .iter()
                .position(|&c| c == anchor)
                .map_or(list.len(), |i| i + 1),
        };
        list.insert(index, id);
    }

    pub fn set_operands(&mut self, id: InstId, operands: &[InstId]) {
        self.remove_uses(id);
        self.insts[id.index()].operands = operands.to_vec();
        self.add_uses(id);
    }

    pub fn set_type(&mut self, id: InstId, ty: Option<InstId>) {
        self.remove_uses(id);
        self.insts[id.index()].ty = ty;
        self.add_uses(id);
    }

    fn add_uses(&mut self, user: InstId) {
        let inst = &self.insts[user.index()];
        let used: Vec<InstId> = inst.operands.iter().copied().chain(inst.ty).collect();
        for value in used {
            self.insts[value.index()].uses.push(user);
        }
    }

    fn remove_uses(&mut self, user: InstId) {
        let inst = &self.insts[user.index()];
        let used: Vec<InstId> = inst.operands.iter().copied().chain(inst.ty).collect();
        for value in used {
            let uses = &mut self.insts[value.index()].uses;
            if let Some(pos) = uses.iter().position(|&u| u == user) {
                uses.swap_remove(pos);
            }
        }
    }

    pub(crate) fn lookup_hoisted(&self, key: &HoistKey) -> Option<InstId> {
        self.hoisted.get(key).copied()
    }

    pub(crate) fn register_hoisted(&mut self, key: HoistKey, id: InstId) {
        self.hoisted.entry(key).or_insert(id);
    }

    pub fn find_decoration(&self, id: InstId, op: Opcode) -> Option<InstId> {
        self.decorations(id).iter().copied().find(|&d| self.op(d) == op)
    }

    pub fn has_decoration(&self, id: InstId, op: Opcode) -> bool {
        self.find_decoration(id, op).is_some()
    }

    /// Whether any of the primal/differential/mixed tags is attached.
    pub fn has_autodiff_tag(&self, id: InstId) -> bool {
        self.decorations(id).iter().any(|&d| self.op(d).is_autodiff_tag())
    }

    pub fn name_hint(&self, id: InstId) -> Option<&str> {
        let deco = self.find_decoration(id, Opcode::NameHint)?;
        match self.payload(deco) {
            Payload::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn known_builtin(&self, id: InstId) -> Option<&str> {
        let deco = self.find_decoration(id, Opcode::KnownBuiltin)?;
        match self.payload(deco) {
            Payload::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn int_value(&self, id: InstId) -> Option<i64> {
        match (self.op(id), self.payload(id)) {
            (Opcode::IntLit | Opcode::BoolLit, Payload::Int(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn float_value(&self, id: InstId) -> Option<f64> {
        match (self.op(id), self.payload(id)) {
            (Opcode::FloatLit, Payload::Float(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn is_type(&self, id: InstId) -> bool {
        self.op(id).is_type()
    }

    pub fn is_literal(&self, id: InstId) -> bool {
        self.op(id).is_literal()
    }

    /// Declared directly at module scope.
    pub fn is_global(&self, id: InstId) -> bool {
        id == self.root() || self.parent(id) == Some(self.root())
    }

    /// True when `ancestor` is `id` itself or on its parent chain.
    pub fn is_child_of(&self, id: InstId, ancestor: InstId) -> bool {
        let mut cur = Some(id);
        while let Some(inst) = cur {
            if inst == ancestor {
                return true;
            }
            cur = self.parent(inst);
        }
        false
    }

    /// Number of scopes between `id` and the module.
    pub fn depth(&self, id: InstId) -> usize {
        let mut depth = 0;
        let mut cur = self.parent(id);
        while let Some(inst) = cur {
            depth += 1;
            cur = self.parent(inst);
        }
        depth
    }

    /// Nearest ancestor (exclusive) with the given opcode.
    pub fn enclosing(&self, id: InstId, op: Opcode) -> Option<InstId> {
        let mut cur = self.parent(id);
        while let Some(inst) = cur {
            if self.op(inst) == op {
                return Some(inst);
            }
            cur = self.parent(inst);
        }
        None
    }

    pub fn enclosing_func(&self, id: InstId) -> Option<InstId> {
        self.enclosing(id, Opcode::Func)
    }

    pub fn blocks(&self, id: InstId) -> Vec<InstId> {
        self.children_with_op(id, Opcode::Block)
    }

    pub fn first_block(&self, id: InstId) -> Option<InstId> {
        self.children(id)
            .iter()
            .copied()
            .find(|&c| self.op(c) == Opcode::Block)
    }

    pub fn params(&self, block: InstId) -> Vec<InstId> {
        self.children_with_op(block, Opcode::Param)
    }

    /// Children of a block that are not parameters.
    pub fn ordinary_insts(&self, block: InstId) -> Vec<InstId> {
        self.children(block)
            .iter()
            .copied()
            .filter(|&c| self.op(c) != Opcode::Param)
            .collect()
    }

    fn children_with_op(&self, id: InstId, op: Opcode) -> Vec<InstId> {
        self.children(id)
            .iter()
            .copied()
            .filter(|&c| self.op(c) == op)
            .collect()
    }

    /// Value returned from the body of a generic.
    pub fn return_value(&self, generic: InstId) -> Option<InstId> {
        let block = self.first_block(generic)?;
        let ret = self
            .children(block)
            .iter()
            .copied()
            .find(|&c| self.op(c) == Opcode::Return)?;
        self.operand(ret, 0)
    }

    /// Follow nested generics to the value they ultimately return.
    pub fn innermost_return_value(&self, generic: InstId) -> Option<InstId> {
        let mut value = self.return_value(generic)?;
        while self.op(value) == Opcode::Generic {
            value = self.return_value(value)?;
        }
        Some(value)
    }

    /// Result type of a `func_type`.
    pub fn func_type_result(&self, func_type: InstId) -> Option<InstId> {
        self.operand(func_type, 0)
    }

    pub fn func_type_params(&self, func_type: InstId) -> &[InstId] {
        self.operands(func_type).get(1..).unwrap_or(&[])
    }

    /// First instruction at module scope carrying the given name hint.
    pub fn find_named(&self, name: &str) -> Option<InstId> {
        self.children(self.root())
            .iter()
            .copied()
            .find(|&c| self.name_hint(c) == Some(name))
    }
}

impl Default for Module {
    fn default() -> Self {
        Self::new()
    }
}
