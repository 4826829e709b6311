//! Parser for the textual IR format.
//!
//! The grammar mirrors the printer in `gantry_codegen::write` exactly, so
//! printing a freshly parsed compilation unit reproduces the input byte for
//! byte:
//!
//! ```text
//! static msg = "Hello"
//!
//! declare puts
//!
//! defun main {
//! bb0:
//!     %0 = static.ref msg
//!     %1 = call puts(%0)
//!     %2 = imm 0
//!     ret %2
//! }
//! ```

use crate::lexer::{Lexer, Token};
use crate::{ParseError, ParseResult};
use gantry_codegen::ast::{Module, TypeData};
use gantry_codegen::entity::packed_option::PackedOption;
use gantry_codegen::ir::{
    Block, FuncId, Inst, InstData, Linkage, Opcode, PhiArg, StaticData, StaticId, StaticInit,
};
use gantry_codegen::Context;

struct Parser<'a> {
    lexer: Lexer<'a>,
    ctx: Context,
    /// Function ids by name, in declaration order.
    func_names: Vec<(String, FuncId)>,
    /// Static ids by name.
    static_names: Vec<(String, StaticId)>,
}

/// Parse a whole compilation unit into a fresh [`Context`].
pub fn parse_unit(source: &str) -> ParseResult<Context> {
    let module = Module::new("<ir>", source);
    let mut parser = Parser {
        lexer: Lexer::new(source)?,
        ctx: Context::new(module),
        func_names: Vec::new(),
        static_names: Vec::new(),
    };
    // Functions are created up front so calls resolve regardless of
    // definition order.
    parser.prescan_functions(source)?;
    parser.parse()?;
    Ok(parser.ctx)
}

impl<'a> Parser<'a> {
    fn advance(&mut self) -> ParseResult<()> {
        self.lexer.next()
    }

    fn expect_ident(&mut self, what: &str) -> ParseResult<String> {
        match &self.lexer.tok {
            Token::Ident(text) => {
                let text = text.clone();
                self.advance()?;
                Ok(text)
            }
            other => err!(self.lexer.loc, "expected {what}, got {:?}", other),
        }
    }

    fn expect(&mut self, tok: Token) -> ParseResult<()> {
        if self.lexer.tok != tok {
            return err!(
                self.lexer.loc,
                "expected {:?}, got {:?}",
                tok,
                self.lexer.tok
            );
        }
        self.advance()
    }

    fn eat(&mut self, tok: &Token) -> ParseResult<bool> {
        if &self.lexer.tok == tok {
            self.advance()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn parse(&mut self) -> ParseResult<()> {
        while self.lexer.tok != Token::Eof {
            match self.lexer.tok.clone() {
                Token::Ident(word) => match word.as_str() {
                    "static" => self.parse_static()?,
                    "declare" => {
                        // Already created by the pre-scan.
                        self.advance()?;
                        self.expect_ident("function name")?;
                    }
                    "defun" => self.parse_defun()?,
                    other => {
                        return err!(self.lexer.loc, "unexpected '{}' at top level", other)
                    }
                },
                other => return err!(self.lexer.loc, "unexpected {:?} at top level", other),
            }
        }
        Ok(())
    }

    fn prescan_functions(&mut self, source: &str) -> ParseResult<()> {
        let mut scan = Lexer::new(source)?;
        let b = self.ctx.module.builtins();
        let default_ty = self
            .ctx
            .module
            .make_type(TypeData::Function {
                ret: b.integer,
                params: Vec::new(),
            });

        loop {
            match scan.tok.clone() {
                Token::Eof => break,
                Token::Ident(word) if word == "declare" || word == "defun" => {
                    let is_decl = word == "declare";
                    scan.next()?;
                    let name = match &scan.tok {
                        Token::Ident(name) => name.clone(),
                        other => {
                            return Err(ParseError {
                                location: scan.loc,
                                message: format!("expected function name, got {other:?}"),
                            })
                        }
                    };
                    let func = if is_decl {
                        self.ctx.declare_function(name.clone(), default_ty)
                    } else {
                        self.ctx
                            .functions
                            .push(gantry_codegen::ir::Function::new(name.clone(), default_ty))
                    };
                    self.func_names.push((name, func));
                    scan.next()?;
                }
                _ => scan.next()?,
            }
        }
        Ok(())
    }

    fn func_by_name(&self, name: &str) -> Option<FuncId> {
        self.func_names
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, f)| *f)
    }

    fn static_by_name(&self, name: &str) -> Option<StaticId> {
        self.static_names
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| *v)
    }

    /// `static <name> = "<text>"` | `static <name> = <int>` |
    /// `static <name> <size>`
    fn parse_static(&mut self) -> ParseResult<()> {
        self.advance()?;
        let name = self.expect_ident("static name")?;
        let b = self.ctx.module.builtins();

        let (ty, init) = if self.eat(&Token::Equal)? {
            match self.lexer.tok.clone() {
                Token::Str(text) => {
                    self.advance()?;
                    let len = text.len() as u64 + 1;
                    let interned = self.ctx.module.intern(&text);
                    let ty = self
                        .ctx
                        .module
                        .make_type(TypeData::Array { of: b.byte, len });
                    (ty, Some(StaticInit::String(interned)))
                }
                Token::Number(value) => {
                    self.advance()?;
                    (b.integer, Some(StaticInit::Integer(value as u64)))
                }
                other => {
                    return err!(self.lexer.loc, "expected static initialiser, got {:?}", other)
                }
            }
        } else {
            match self.lexer.tok {
                Token::Number(size) => {
                    self.advance()?;
                    let ty = if size == 8 {
                        b.integer
                    } else {
                        self.ctx.module.make_type(TypeData::Array {
                            of: b.byte,
                            len: size.max(0) as u64,
                        })
                    };
                    (ty, None)
                }
                _ => return err!(self.lexer.loc, "expected static size"),
            }
        };

        let var = self.ctx.statics.push(StaticData {
            name: name.clone(),
            ty,
            decl: PackedOption::default(),
            references: Vec::new(),
            init,
            linkage: Linkage::Local,
            referenced: false,
        });
        self.static_names.push((name, var));
        Ok(())
    }

    /// `defun <name> { <block>* }`
    fn parse_defun(&mut self) -> ParseResult<()> {
        self.advance()?;
        let name = self.expect_ident("function name")?;
        let func = self
            .func_by_name(&name)
            .expect("pre-scan registered every function");
        self.ctx.func = func.into();
        self.expect(Token::LBrace)?;

        let mut values: Vec<Inst> = Vec::new();
        let mut blocks: Vec<Option<Block>> = Vec::new();
        let mut pending_phis: Vec<(Inst, Vec<(usize, u32)>)> = Vec::new();

        while self.lexer.tok != Token::RBrace {
            // A block label: `bb<n>:`.
            let label = match &self.lexer.tok {
                Token::Ident(text) if text.starts_with("bb") => text.clone(),
                other => {
                    return err!(self.lexer.loc, "expected block label, got {:?}", other)
                }
            };
            let n: usize = match label[2..].parse() {
                Ok(n) => n,
                Err(_) => return err!(self.lexer.loc, "invalid block label '{}'", label),
            };
            self.advance()?;
            self.expect(Token::Colon)?;

            let block = self.block_at(&mut blocks, n);
            let current = self.ctx.func.unwrap();
            self.ctx.functions[current].layout.append_block(block);
            self.ctx.switch_to_block(block);

            // Instructions until the next label or the closing brace.
            loop {
                match &self.lexer.tok {
                    Token::RBrace => break,
                    Token::Ident(text) if text.starts_with("bb") => break,
                    _ => {}
                }
                self.parse_instruction(&mut values, &mut blocks, &mut pending_phis)?;
            }
        }
        self.expect(Token::RBrace)?;

        // Patch phi arguments now that every value exists.
        for (phi, args) in pending_phis {
            for (block_n, value_n) in args {
                let block = blocks
                    .get(block_n)
                    .copied()
                    .flatten()
                    .ok_or_else(|| self.lexer.error(format!("phi names unknown block bb{block_n}")))?;
                let value = *values
                    .get(value_n as usize)
                    .ok_or_else(|| self.lexer.error(format!("phi names unknown value %{value_n}")))?;
                self.ctx.phi_add_argument(phi, PhiArg { block, value });
            }
        }
        Ok(())
    }

    fn block_at(&mut self, blocks: &mut Vec<Option<Block>>, n: usize) -> Block {
        if n >= blocks.len() {
            blocks.resize(n + 1, None);
        }
        if let Some(block) = blocks[n] {
            return block;
        }
        let block = self.ctx.cur_mut().dfg.make_block();
        blocks[n] = Some(block);
        block
    }

    fn value(&self, values: &[Inst], n: u32) -> ParseResult<Inst> {
        values
            .get(n as usize)
            .copied()
            .ok_or_else(|| self.lexer.error(format!("use of undefined value %{n}")))
    }

    fn expect_value(&mut self, values: &[Inst]) -> ParseResult<Inst> {
        match self.lexer.tok {
            Token::Value(n) => {
                let v = self.value(values, n)?;
                self.advance()?;
                Ok(v)
            }
            _ => err!(self.lexer.loc, "expected a value reference"),
        }
    }

    fn expect_block(&mut self, blocks: &mut Vec<Option<Block>>) -> ParseResult<Block> {
        let label = self.expect_ident("block label")?;
        if !label.starts_with("bb") {
            return err!(self.lexer.loc, "expected block label, got '{}'", label);
        }
        let n: usize = label[2..]
            .parse()
            .map_err(|_| self.lexer.error(format!("invalid block label '{label}'")))?;
        Ok(self.block_at(blocks, n))
    }

    fn parse_instruction(
        &mut self,
        values: &mut Vec<Inst>,
        blocks: &mut Vec<Option<Block>>,
        pending_phis: &mut Vec<(Inst, Vec<(usize, u32)>)>,
    ) -> ParseResult<()> {
        // Optional result: `%<n> = `.
        let has_result = matches!(self.lexer.tok, Token::Value(_));
        if has_result {
            let n = match self.lexer.tok {
                Token::Value(n) => n,
                _ => unreachable!(),
            };
            if n as usize != values.len() {
                return err!(
                    self.lexer.loc,
                    "expected value %{}, got %{n}",
                    values.len()
                );
            }
            self.advance()?;
            self.expect(Token::Equal)?;
        }

        let b = self.ctx.module.builtins();
        let mnemonic = self.expect_ident("instruction mnemonic")?;

        let inst = match mnemonic.as_str() {
            "imm" => {
                let value = self.expect_number()?;
                self.ctx.immediate(b.integer, value as u64)
            }

            "call" | "call.tail" => {
                let is_tail = mnemonic == "call.tail";
                let call = match self.lexer.tok.clone() {
                    Token::Value(n) => {
                        let callee = self.value(values, n)?;
                        self.advance()?;
                        self.ctx.indirect_call(callee)
                    }
                    Token::Ident(name) => {
                        self.advance()?;
                        let func = self.func_by_name(&name).ok_or_else(|| {
                            self.lexer.error(format!("call to unknown function '{name}'"))
                        })?;
                        self.ctx.direct_call(func)
                    }
                    other => {
                        return err!(self.lexer.loc, "expected callee, got {:?}", other)
                    }
                };
                self.expect(Token::LParen)?;
                while self.lexer.tok != Token::RParen {
                    let arg = self.expect_value(values)?;
                    self.ctx.add_call_argument(call, arg);
                    if !self.eat(&Token::Comma)? {
                        break;
                    }
                }
                self.expect(Token::RParen)?;
                if is_tail {
                    if let InstData::Call { is_tail, .. } =
                        &mut self.ctx.cur_mut().dfg.insts[call]
                    {
                        *is_tail = true;
                    }
                }
                // Calls written without a result are void.
                if !has_result {
                    self.ctx.cur_mut().dfg.set_inst_type(call, b.void);
                }
                self.ctx.insert(call)
            }

            "load" => {
                let addr = self.expect_value(values)?;
                self.ctx.load(addr)
            }

            "store" => {
                let value = self.expect_value(values)?;
                self.expect(Token::Comma)?;
                let addr = self.expect_value(values)?;
                self.ctx.store(addr, value)
            }

            "ret" => match self.lexer.tok {
                Token::Value(_) => {
                    let v = self.expect_value(values)?;
                    self.ctx.return_(Some(v))
                }
                _ => self.ctx.return_(None),
            },

            "br" => {
                let dest = self.expect_block(blocks)?;
                self.ctx.branch(dest)
            }

            "br.cond" => {
                let cond = self.expect_value(values)?;
                self.expect(Token::Comma)?;
                let then_block = self.expect_block(blocks)?;
                self.expect(Token::Comma)?;
                let else_block = self.expect_block(blocks)?;
                self.ctx.branch_conditional(cond, then_block, else_block)
            }

            "unreachable" => self.ctx.unreachable(),

            "phi" => {
                let phi = self.ctx.phi(b.integer);
                let mut args = Vec::new();
                while self.eat(&Token::LBracket)? {
                    let label = self.expect_ident("block label")?;
                    let block_n: usize = label
                        .strip_prefix("bb")
                        .and_then(|s| s.parse().ok())
                        .ok_or_else(|| {
                            self.lexer.error(format!("invalid block label '{label}'"))
                        })?;
                    self.expect(Token::Comma)?;
                    let value_n = match self.lexer.tok {
                        Token::Value(n) => n,
                        _ => return err!(self.lexer.loc, "expected a value reference"),
                    };
                    self.advance()?;
                    self.expect(Token::RBracket)?;
                    args.push((block_n, value_n));
                    if !self.eat(&Token::Comma)? {
                        break;
                    }
                }
                pending_phis.push((phi, args));
                phi
            }

            "copy" => {
                let v = self.expect_value(values)?;
                self.ctx.copy(v)
            }

            "not" => {
                let v = self.expect_value(values)?;
                self.ctx.not(v)
            }

            "static.ref" => {
                let name = self.expect_ident("static name")?;
                let var = self.static_by_name(&name).ok_or_else(|| {
                    self.lexer.error(format!("reference to unknown static '{name}'"))
                })?;
                self.ctx.static_reference(var)
            }

            "func.ref" => {
                let name = self.expect_ident("function name")?;
                let func = self.func_by_name(&name).ok_or_else(|| {
                    self.lexer.error(format!("reference to unknown function '{name}'"))
                })?;
                self.ctx.func_reference(func)
            }

            "param" => {
                let index = self.expect_number()? as u32;
                let inst = self
                    .ctx
                    .create_inst(InstData::Parameter { index }, b.integer);
                self.ctx.insert(inst);
                self.ctx.cur_mut().params.push(inst);
                inst
            }

            "alloca" => {
                let size = self.expect_number()? as u64;
                let ptr = self.ctx.module.pointer_to(b.integer);
                let inst = self
                    .ctx
                    .create_inst(InstData::Alloca { size, offset: 0 }, ptr);
                self.ctx.insert(inst)
            }

            "register" => {
                let reg = self.expect_number()? as u32;
                let inst = self.ctx.create_inst(InstData::Register { reg }, b.integer);
                self.ctx.insert(inst)
            }

            "lit.int" => {
                let value = self.expect_number()? as u64;
                let inst = self
                    .ctx
                    .create_inst(InstData::LitInteger { value }, b.integer);
                self.ctx.insert(inst)
            }

            "lit.str" => match self.lexer.tok.clone() {
                Token::Str(text) => {
                    self.advance()?;
                    let interned = self.ctx.module.intern(&text);
                    let inst = self
                        .ctx
                        .create_inst(InstData::LitString { string: interned }, b.integer);
                    self.ctx.insert(inst)
                }
                other => return err!(self.lexer.loc, "expected string literal, got {:?}", other),
            },

            binary => {
                let opcode: Opcode = binary.parse().map_err(|()| {
                    self.lexer.error(format!("unknown instruction '{binary}'"))
                })?;
                if !opcode.is_binary() {
                    return err!(self.lexer.loc, "'{}' cannot be written bare", binary);
                }
                let lhs = self.expect_value(values)?;
                self.expect(Token::Comma)?;
                let rhs = self.expect_value(values)?;
                self.ctx.binary(opcode, lhs, rhs)
            }
        };

        if has_result {
            values.push(inst);
        }
        Ok(())
    }

    fn expect_number(&mut self) -> ParseResult<i64> {
        match self.lexer.tok {
            Token::Number(n) => {
                self.advance()?;
                Ok(n)
            }
            _ => err!(self.lexer.loc, "expected a number"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_constant_return() {
        let ctx = parse_unit("defun main {\nbb0:\n    %0 = imm 42\n    ret %0\n}\n").unwrap();
        assert_eq!(ctx.functions.len(), 1);
        let func = ctx.functions.values().next().unwrap();
        assert_eq!(func.name, "main");
        let entry = func.layout.entry_block().unwrap();
        let insts: Vec<Inst> = func.layout.block_insts(entry).collect();
        assert_eq!(insts.len(), 2);
        assert_eq!(func.dfg.opcode(insts[0]), Opcode::Immediate);
        assert_eq!(func.dfg.opcode(insts[1]), Opcode::Return);
    }

    #[test]
    fn parse_call_and_static() {
        let src = "static msg = \"hi\"\n\ndeclare puts\n\ndefun main {\nbb0:\n    %0 = static.ref msg\n    %1 = call puts(%0)\n    ret %1\n}\n";
        let ctx = parse_unit(src).unwrap();
        assert_eq!(ctx.statics.len(), 1);
        assert_eq!(ctx.functions.len(), 2);
    }

    #[test]
    fn errors_have_locations() {
        let err = parse_unit("defun main {\nbb0:\n    %0 = bogus 1\n}\n").unwrap_err();
        assert_eq!(err.location.line_number, 3);
    }

    #[test]
    fn value_numbers_are_dense() {
        let err = parse_unit("defun main {\nbb0:\n    %1 = imm 42\n    ret %1\n}\n").unwrap_err();
        assert!(err.message.contains("expected value %0"));
    }
}
