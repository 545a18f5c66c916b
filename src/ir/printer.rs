//! Textual IR printer.
//!
//! Emits the grammar accepted by [`super::parser`], labelling every
//! instruction with its handle so the output can be parsed back.

use super::{InstId, Module, Payload};
use std::fmt::{self, Write};

fn write_payload(out: &mut impl Write, payload: &Payload) -> fmt::Result {
    match payload {
        Payload::None => Ok(()),
        Payload::Int(v) => write!(out, " {v}"),
        Payload::Float(v) => write!(out, " {v:?}"),
        Payload::Str(s) => write!(out, " {s:?}"),
    }
}

fn write_operands(out: &mut impl Write, operands: &[InstId]) -> fmt::Result {
    if operands.is_empty() {
        return Ok(());
    }
    out.write_char('(')?;
    for (i, operand) in operands.iter().enumerate() {
        if i > 0 {
            out.write_str(", ")?;
        }
        write!(out, "{operand}")?;
    }
    out.write_char(')')
}

impl Module {
    fn write_inst(&self, out: &mut impl Write, id: InstId, indent: usize) -> fmt::Result {
        let inst = self.inst(id);
        write!(out, "{:indent$}{} = {}", "", id, inst.op, indent = indent)?;
        write_payload(out, &inst.payload)?;
        write_operands(out, &inst.operands)?;
        if let Some(ty) = inst.ty {
            write!(out, " : {ty}")?;
        }
        if !inst.decorations.is_empty() {
            out.write_str(" [")?;
            for (i, &deco) in inst.decorations.iter().enumerate() {
                if i > 0 {
                    out.write_str(", ")?;
                }
                let deco = self.inst(deco);
                write!(out, "{}", deco.op)?;
                write_payload(out, &deco.payload)?;
                write_operands(out, &deco.operands)?;
            }
            out.write_char(']')?;
        }
        if !inst.children.is_empty() {
            out.write_str(" {\n")?;
            for &child in &inst.children {
                self.write_inst(out, child, indent + 2)?;
            }
            write!(out, "{:indent$}}}", "", indent = indent)?;
        }
        out.write_char('\n')
    }

    /// Render one instruction (and its children) in textual form.
    pub fn print_inst(&self, id: InstId) -> String {
        let mut out = String::new();
        // Writing into a String cannot fail.
        let _ = self.write_inst(&mut out, id, 0);
        out
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &child in self.children(self.root()) {
            self.write_inst(f, child, 0)?;
        }
        Ok(())
    }
}
