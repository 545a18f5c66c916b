//! Textual IR parser.
//!
//! ```text
//! ; Comments start with semicolon
//! %float = float
//! %fty = func_type(%float, %float)
//! %f = func : %fty [name_hint "f", fwd_differentiable] {
//!   %entry = block {
//!     %x = param : %float
//!     ret(%x)
//!   }
//! }
//! ```
//!
//! Labels are global to the file and may be used before they are defined.
//! Parsing happens in two steps: the text is read into a tree of items, then
//! the tree is lowered into a [`Module`] (create everything, then resolve
//! operands and types, then register hoistable globals for deduplication).

use super::{HoistKey, InstId, Module, Opcode, Payload, Position, SourceLoc};
use hashbrown::HashMap;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("{loc}: expected {expected}, found {found}")]
    Expected {
        loc: SourceLoc,
        expected: &'static str,
        found: String,
    },

    #[error("{loc}: unknown opcode '{name}'")]
    UnknownOpcode { loc: SourceLoc, name: String },

    #[error("{loc}: '{name}' is a decoration and must appear inside [...]")]
    MisplacedDecoration { loc: SourceLoc, name: String },

    #[error("{loc}: '{name}' is not a decoration")]
    NotADecoration { loc: SourceLoc, name: String },

    #[error("{loc}: '%{label}' is not defined")]
    UndefinedLabel { loc: SourceLoc, label: String },

    #[error("{loc}: '%{label}' is defined twice")]
    DuplicateLabel { loc: SourceLoc, label: String },

    #[error("{loc}: unterminated string literal")]
    UnterminatedString { loc: SourceLoc },

    #[error("{loc}: invalid number '{text}'")]
    InvalidNumber { loc: SourceLoc, text: String },
}

/// A parsed module together with its label table.
#[derive(Debug, Clone)]
pub struct ParsedModule {
    pub module: Module,
    pub labels: HashMap<String, InstId>,
}

impl ParsedModule {
    pub fn get(&self, label: &str) -> Option<InstId> {
        self.labels.get(label).copied()
    }
}

pub fn parse_module(text: &str) -> Result<ParsedModule, ParseError> {
    let items = Parser::new(text).parse()?;
    Lowering::default().lower(&items)
}

#[derive(Debug)]
struct Ref {
    label: String,
    loc: SourceLoc,
}

#[derive(Debug)]
struct Deco {
    op: Opcode,
    payload: Payload,
    operands: Vec<Ref>,
}

#[derive(Debug)]
struct Item {
    label: Option<String>,
    op: Opcode,
    payload: Payload,
    operands: Vec<Ref>,
    ty: Option<Ref>,
    decorations: Vec<Deco>,
    children: Vec<Item>,
    loc: SourceLoc,
}

struct Parser<'a> {
    text: &'a str,
    pos: usize,
    line: u32,
    column: u32,
}

impl<'a> Parser<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            text,
            pos: 0,
            line: 1,
            column: 1,
        }
    }

    fn parse(mut self) -> Result<Vec<Item>, ParseError> {
        let mut items = Vec::new();
        self.skip_whitespace();
        while !self.is_eof() {
            items.push(self.parse_item()?);
            self.skip_whitespace();
        }
        Ok(items)
    }

    fn is_eof(&self) -> bool {
        self.pos >= self.text.len()
    }

    fn loc(&self) -> SourceLoc {
        SourceLoc {
            line: self.line,
            column: self.column,
        }
    }

    fn current_char(&self) -> Option<char> {
        self.text[self.pos..].chars().next()
    }

    fn advance(&mut self) {
        if let Some(ch) = self.current_char() {
            self.pos += ch.len_utf8();
            if ch == '\n' {
                self.line += 1;
                self.column = 1;
            } else {
                self.column += 1;
            }
        }
    }

    fn skip_whitespace(&mut self) {
        while let Some(ch) = self.current_char() {
            if ch == ';' {
                while let Some(ch) = self.current_char() {
                    self.advance();
                    if ch == '\n' {
                        break;
                    }
                }
            } else if ch.is_whitespace() {
                self.advance();
            } else {
                break;
            }
        }
    }

    fn peek(&mut self) -> Option<char> {
        self.skip_whitespace();
        self.current_char()
    }

    fn try_read(&mut self, ch: char) -> bool {
        if self.peek() == Some(ch) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn found(&self) -> String {
        match self.current_char() {
            Some(ch) => format!("'{ch}'"),
            None => "end of input".to_string(),
        }
    }

    fn expect(&mut self, ch: char, expected: &'static str) -> Result<(), ParseError> {
        if self.try_read(ch) {
            Ok(())
        } else {
            Err(ParseError::Expected {
                loc: self.loc(),
                expected,
                found: self.found(),
            })
        }
    }

    fn is_ident_char(ch: char) -> bool {
        ch.is_alphanumeric() || ch == '_' || ch == '.'
    }

    fn read_identifier(&mut self, expected: &'static str) -> Result<&'a str, ParseError> {
        self.skip_whitespace();
        let start = self.pos;
        while let Some(ch) = self.current_char() {
            if Self::is_ident_char(ch) {
                self.advance();
            } else {
                break;
            }
        }
        if start == self.pos {
            return Err(ParseError::Expected {
                loc: self.loc(),
                expected,
                found: self.found(),
            });
        }
        Ok(&self.text[start..self.pos])
    }

    fn read_ref(&mut self) -> Result<Ref, ParseError> {
        self.expect('%', "'%' label")?;
        let loc = self.loc();
        let label = self.read_identifier("label name")?.to_string();
        Ok(Ref { label, loc })
    }

    fn read_opcode(&mut self) -> Result<(Opcode, SourceLoc), ParseError> {
        self.skip_whitespace();
        let loc = self.loc();
        let name = self.read_identifier("opcode")?;
        match Opcode::from_name(name) {
            Some(op) => Ok((op, loc)),
            None => Err(ParseError::UnknownOpcode {
                loc,
                name: name.to_string(),
            }),
        }
    }

    fn read_payload(&mut self, op: Opcode) -> Result<Payload, ParseError> {
        match self.peek() {
            Some('"') => self.read_string(),
            Some(ch) if ch == '-' || ch.is_ascii_digit() => self.read_number(),
            Some('t' | 'f') if op == Opcode::BoolLit => {
                let loc = self.loc();
                match self.read_identifier("boolean")? {
                    "true" => Ok(Payload::Int(1)),
                    "false" => Ok(Payload::Int(0)),
                    other => Err(ParseError::InvalidNumber {
                        loc,
                        text: other.to_string(),
                    }),
                }
            }
            _ => Ok(Payload::None),
        }
    }

    fn read_string(&mut self) -> Result<Payload, ParseError> {
        let loc = self.loc();
        self.advance();
        let mut value = String::new();
        loop {
            match self.current_char() {
                None => return Err(ParseError::UnterminatedString { loc }),
                Some('"') => {
                    self.advance();
                    return Ok(Payload::Str(value));
                }
                Some('\\') => {
                    self.advance();
                    match self.current_char() {
                        Some('n') => value.push('\n'),
                        Some(ch) => value.push(ch),
                        None => return Err(ParseError::UnterminatedString { loc }),
                    }
                    self.advance();
                }
                Some(ch) => {
                    value.push(ch);
                    self.advance();
                }
            }
        }
    }

    fn read_number(&mut self) -> Result<Payload, ParseError> {
        let loc = self.loc();
        let start = self.pos;
        if self.current_char() == Some('-') {
            self.advance();
        }
        let mut is_float = false;
        while let Some(ch) = self.current_char() {
            if ch.is_ascii_digit() {
                self.advance();
            } else if ch == '.' || ch == 'e' || ch == 'E' {
                is_float = true;
                self.advance();
                if matches!(self.current_char(), Some('-' | '+')) && ch != '.' {
                    self.advance();
                }
            } else {
                break;
            }
        }
        let text = &self.text[start..self.pos];
        let invalid = || ParseError::InvalidNumber {
            loc,
            text: text.to_string(),
        };
        if is_float {
            text.parse::<f64>().map(Payload::Float).map_err(|_| invalid())
        } else {
            text.parse::<i64>().map(Payload::Int).map_err(|_| invalid())
        }
    }

    fn read_operands(&mut self) -> Result<Vec<Ref>, ParseError> {
        let mut operands = Vec::new();
        if !self.try_read('(') {
            return Ok(operands);
        }
        if self.try_read(')') {
            return Ok(operands);
        }
        loop {
            operands.push(self.read_ref()?);
            if self.try_read(')') {
                return Ok(operands);
            }
            self.expect(',', "',' or ')'")?;
        }
    }

    fn parse_decorations(&mut self) -> Result<Vec<Deco>, ParseError> {
        let mut decorations = Vec::new();
        if !self.try_read('[') {
            return Ok(decorations);
        }
        if self.try_read(']') {
            return Ok(decorations);
        }
        loop {
            let (op, loc) = self.read_opcode()?;
            if !op.is_decoration() {
                return Err(ParseError::NotADecoration {
                    loc,
                    name: op.info().name.to_string(),
                });
            }
            let payload = self.read_payload(op)?;
            let operands = self.read_operands()?;
            decorations.push(Deco {
                op,
                payload,
                operands,
            });
            if self.try_read(']') {
                return Ok(decorations);
            }
            self.expect(',', "',' or ']'")?;
        }
    }

    fn parse_item(&mut self) -> Result<Item, ParseError> {
        let label = if self.peek() == Some('%') {
            let r = self.read_ref()?;
            self.expect('=', "'='")?;
            Some(r.label)
        } else {
            None
        };

        let (op, loc) = self.read_opcode()?;
        if op.is_decoration() {
            return Err(ParseError::MisplacedDecoration {
                loc,
                name: op.info().name.to_string(),
            });
        }
        let payload = self.read_payload(op)?;
        let operands = self.read_operands()?;
        let ty = if self.try_read(':') {
            Some(self.read_ref()?)
        } else {
            None
        };
        let decorations = self.parse_decorations()?;

        let mut children = Vec::new();
        if self.try_read('{') {
            while !self.try_read('}') {
                if self.is_eof() {
                    return Err(ParseError::Expected {
                        loc: self.loc(),
                        expected: "'}'",
                        found: self.found(),
                    });
                }
                children.push(self.parse_item()?);
            }
        }

        Ok(Item {
            label,
            op,
            payload,
            operands,
            ty,
            decorations,
            children,
            loc,
        })
    }
}

#[derive(Default)]
struct Lowering {
    module: Module,
    labels: HashMap<String, InstId>,
}

impl Lowering {
    fn lower(mut self, items: &[Item]) -> Result<ParsedModule, ParseError> {
        let root = self.module.root();
        let mut created = Vec::new();
        for item in items {
            self.create(item, root, &mut created)?;
        }

        for (item, id, deco_ids) in &created {
            let operands = self.resolve_all(&item.operands)?;
            self.module.set_operands(*id, &operands);
            let ty = item.ty.as_ref().map(|r| self.resolve(r)).transpose()?;
            self.module.set_type(*id, ty);
            for (deco, deco_id) in item.decorations.iter().zip(deco_ids) {
                let operands = self.resolve_all(&deco.operands)?;
                self.module.set_operands(*deco_id, &operands);
            }
        }

        for &(item, id, _) in &created {
            if item.op.info().hoistable && self.module.is_global(id) {
                let key = HoistKey::new(item.op, self.module.ty(id), self.module.operands(id), &item.payload);
                self.module.register_hoisted(key, id);
            }
        }

        Ok(ParsedModule {
            module: self.module,
            labels: self.labels,
        })
    }

    fn create<'i>(
        &mut self,
        item: &'i Item,
        parent: InstId,
        created: &mut Vec<(&'i Item, InstId, Vec<InstId>)>,
    ) -> Result<(), ParseError> {
        let id = self.module.create(item.op, None, &[], item.payload.clone());
        self.module.set_loc(id, item.loc);
        self.module.attach(id, parent, Position::End);

        if let Some(label) = &item.label {
            if self.labels.insert(label.clone(), id).is_some() {
                return Err(ParseError::DuplicateLabel {
                    loc: item.loc,
                    label: label.clone(),
                });
            }
        }

        let mut deco_ids = Vec::with_capacity(item.decorations.len());
        for deco in &item.decorations {
            let deco_id = self.module.create(deco.op, None, &[], deco.payload.clone());
            self.module.set_loc(deco_id, item.loc);
            self.module.attach(deco_id, id, Position::End);
            deco_ids.push(deco_id);
        }
        created.push((item, id, deco_ids));

        for child in &item.children {
            self.create(child, id, created)?;
        }
        Ok(())
    }

    fn resolve(&self, r: &Ref) -> Result<InstId, ParseError> {
        self.labels
            .get(&r.label)
            .copied()
            .ok_or_else(|| ParseError::UndefinedLabel {
                loc: r.loc,
                label: r.label.clone(),
            })
    }

    fn resolve_all(&self, refs: &[Ref]) -> Result<Vec<InstId>, ParseError> {
        refs.iter().map(|r| self.resolve(r)).collect()
    }
}
