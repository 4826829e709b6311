//! Parser for the instruction-selection DSL.
//!
//! Grammar, one rule per `.`-terminated clause:
//!
//! ```text
//! rule      ::= 'match' iname { ',' iname } filter* sideeffect* result+ '.'
//! filter    ::= 'where' iname [INSTRUCTION] [with-clause]
//! with      ::= 'with' ['commutative'] operand*
//! operand   ::= iname | [oname] type [constraint] | oname [constraint] | 'o*'
//! type      ::= 'reg' | 'imm' | 'name' | 'block' | 'any'
//! constraint::= 'any' | ('eq'|'ne'|'lt'|'gt'|'le'|'ge') value { '|' value }
//! value     ::= REGISTER | NUMBER | oname | iname
//! sideeffect::= 'clobber' REGISTER { ',' REGISTER } | 'out' (REGISTER | oname | 'any')
//! result    ::= 'emit' INSTRUCTION [emit-op { ',' emit-op }] | 'discard'
//! emit-op   ::= oname | iname | 'result' | NUMBER | REGISTER
//! ```

use crate::isel::lexer::{Keyword, Lexer, Token};
use crate::isel::{
    CmpKind, Constraint, ConstraintParam, Emit, EmitOperand, Filter, FilterOperand, IselResult,
    OperandType, Pattern, ResultSpec, Table,
};

struct Parser<'a> {
    lexer: Lexer<'a>,
    table: Table,
}

/// Parse a complete table from source text.
pub fn parse_table(filename: &str, source: &str) -> IselResult<Table> {
    let mut parser = Parser {
        lexer: Lexer::new(filename, source)?,
        table: Table {
            patterns: Vec::new(),
            instruction_names: Vec::new(),
            register_names: Vec::new(),
        },
    };

    while parser.lexer.tok != Token::Eof {
        let pattern = parser.parse_rule()?;
        parser.table.patterns.push(pattern);
    }

    link_partial_matches(&mut parser.table);
    Ok(parser.table)
}

/// Wire up partial-match fallbacks: a multi-instruction pattern links to the
/// first shorter pattern whose lead filter names the same instruction, so
/// the matcher can retry it in place of restarting from scratch.
fn link_partial_matches(table: &mut Table) {
    let leads: Vec<(usize, Option<usize>)> = table
        .patterns
        .iter()
        .map(|p| {
            let lead = p
                .filters
                .iter()
                .find(|f| f.iname == 1)
                .and_then(|f| f.instruction);
            (p.icount, lead)
        })
        .collect();
    for i in 0..table.patterns.len() {
        let (icount, lead) = leads[i];
        if icount <= 1 || lead.is_none() {
            continue;
        }
        table.patterns[i].link = leads
            .iter()
            .enumerate()
            .position(|(j, &(jcount, jlead))| j != i && jcount < icount && jlead == lead);
    }
}

impl<'a> Parser<'a> {
    fn at(&self, tok: &Token) -> bool {
        self.lexer.tok == *tok
    }

    fn at_kw(&self, kw: Keyword) -> bool {
        self.lexer.tok == Token::Keyword(kw)
    }

    fn advance(&mut self) -> IselResult<()> {
        self.lexer.next_token()
    }

    fn consume_kw(&mut self, kw: Keyword) -> IselResult<()> {
        if !self.at_kw(kw) {
            return Err(self
                .lexer
                .error(format!("expected '{kw:?}', got {:?}", self.lexer.tok)));
        }
        self.advance()
    }

    /// `<rule> ::= MATCH INAME { "," INAME } { <filter> } { <side-effect> } <result>+ "."`
    fn parse_rule(&mut self) -> IselResult<Pattern> {
        self.consume_kw(Keyword::Match)?;

        let mut pattern = Pattern {
            icount: 0,
            filters: Vec::new(),
            clobbers: Vec::new(),
            result: ResultSpec::None,
            emits: Vec::new(),
            discard: false,
            link: None,
        };

        // The matched instructions: i1, i2, ... in order.
        loop {
            match self.lexer.tok {
                Token::IName(n) => {
                    if n as usize != pattern.icount + 1 {
                        return Err(self.lexer.error(format!(
                            "expected instruction name 'i{}', got 'i{n}'",
                            pattern.icount + 1
                        )));
                    }
                    pattern.icount += 1;
                    self.advance()?;
                }
                _ => return Err(self.lexer.error("expected instruction name")),
            }
            if self.at(&Token::Comma) {
                self.advance()?;
            } else {
                break;
            }
        }

        // Filters.
        let mut ocount = 0usize;
        while self.at_kw(Keyword::Where) {
            let filter = self.parse_filter(pattern.icount, &mut ocount)?;
            pattern.filters.push(filter);
        }

        // Side effects.
        while self.at_kw(Keyword::Clobber) || self.at_kw(Keyword::Out) {
            // <clobber> ::= CLOBBER REGISTER { "," REGISTER }
            while self.at_kw(Keyword::Clobber) {
                self.advance()?;
                loop {
                    let reg = match &self.lexer.tok {
                        Token::Register(name) => self.table.intern_register(name),
                        _ => return Err(self.lexer.error("expected register name")),
                    };
                    pattern.clobbers.push(reg);
                    self.advance()?;
                    if self.at(&Token::Comma) {
                        self.advance()?;
                    } else {
                        break;
                    }
                }
            }

            // <out> ::= OUT ( REGISTER | ONAME | ANY )
            if self.at_kw(Keyword::Out) {
                if pattern.result != ResultSpec::None {
                    return Err(self.lexer.error("multiple out clauses"));
                }
                self.advance()?;
                pattern.result = match &self.lexer.tok {
                    Token::Register(name) => ResultSpec::Register(self.table.intern_register(name)),
                    Token::OName(n) => ResultSpec::OName(*n as usize),
                    Token::Keyword(Keyword::Any) => ResultSpec::Any,
                    _ => return Err(self.lexer.error("expected register, oname, or 'any'")),
                };
                self.advance()?;
            }
        }

        // Results.
        loop {
            if self.at_kw(Keyword::Discard) {
                if !pattern.emits.is_empty() {
                    return Err(self
                        .lexer
                        .error("'discard' must be the sole result of a pattern"));
                }
                pattern.discard = true;
                self.advance()?;
                break;
            }
            if self.at_kw(Keyword::Emit) {
                let emit = self.parse_emit()?;
                pattern.emits.push(emit);
                continue;
            }
            break;
        }
        if pattern.emits.is_empty() && !pattern.discard {
            return Err(self.lexer.error("expected 'emit' or 'discard'"));
        }

        if !self.at(&Token::Dot) {
            return Err(self.lexer.error(format!(
                "expected '.' at end of rule, got {:?}",
                self.lexer.tok
            )));
        }
        self.advance()?;

        Ok(pattern)
    }

    /// `<filter> ::= WHERE INAME [ INSTRUCTION ] [ <with-clause> ]`
    fn parse_filter(&mut self, icount: usize, ocount: &mut usize) -> IselResult<Filter> {
        self.consume_kw(Keyword::Where)?;

        let iname = match self.lexer.tok {
            Token::IName(n) => n as usize,
            _ => return Err(self.lexer.error("expected instruction name")),
        };
        if iname == 0 || iname > icount {
            return Err(self
                .lexer
                .error(format!("filter names 'i{iname}' outside the matched sequence")));
        }
        self.advance()?;

        let mut filter = Filter {
            iname,
            instruction: None,
            commutative: false,
            operands: Vec::new(),
        };

        if let Token::Instruction(name) = &self.lexer.tok {
            filter.instruction = Some(self.table.intern_instruction(name));
            self.advance()?;
        }

        // <with-clause> ::= WITH [ COMMUTATIVE ] [ <operand> { "," <operand> } ]
        if !self.at_kw(Keyword::With) {
            return Ok(filter);
        }
        self.advance()?;

        if self.at_kw(Keyword::Commutative) {
            filter.commutative = true;
            self.advance()?;
        }

        loop {
            let operand = match &self.lexer.tok {
                Token::IName(n) => {
                    let n = *n as usize;
                    // An iname operand declares a dependency on a previous
                    // instruction of the sequence.
                    if filter.iname == 1 {
                        return Err(self
                            .lexer
                            .error("first filter cannot reference other instructions"));
                    }
                    if n >= filter.iname {
                        return Err(self
                            .lexer
                            .error("iname filter operand must refer to a previous instruction"));
                    }
                    self.advance()?;
                    FilterOperand::IName(n)
                }

                Token::OStar => {
                    self.advance()?;
                    FilterOperand::Rest
                }

                Token::OName(_)
                | Token::Keyword(
                    Keyword::Reg | Keyword::Imm | Keyword::Name | Keyword::Block | Keyword::Any,
                ) => {
                    let name = match self.lexer.tok {
                        Token::OName(n) => {
                            let n = n as usize;
                            *ocount += 1;
                            if n != *ocount {
                                return Err(self.lexer.error(format!(
                                    "expected operand name 'o{}', got 'o{n}'",
                                    *ocount
                                )));
                            }
                            self.advance()?;
                            Some(n)
                        }
                        _ => None,
                    };

                    // <type> ::= REG | IMM | NAME | BLOCK | ANY
                    let ty = match self.lexer.tok {
                        Token::Keyword(Keyword::Reg) => {
                            self.advance()?;
                            OperandType::Reg
                        }
                        Token::Keyword(Keyword::Imm) => {
                            self.advance()?;
                            OperandType::Imm
                        }
                        Token::Keyword(Keyword::Name) => {
                            self.advance()?;
                            OperandType::Name
                        }
                        Token::Keyword(Keyword::Block) => {
                            self.advance()?;
                            OperandType::Block
                        }
                        Token::Keyword(Keyword::Any) => {
                            self.advance()?;
                            OperandType::Any
                        }
                        _ => OperandType::Any,
                    };

                    let constraint = self.parse_constraint(ty)?;
                    FilterOperand::Operand {
                        name,
                        ty,
                        constraint,
                    }
                }

                _ => break,
            };
            filter.operands.push(operand);

            if self.at(&Token::Comma) {
                self.advance()?;
            }
        }

        Ok(filter)
    }

    /// `<constraint> ::= ANY | ( EQ | NE | LT | GT | LE | GE ) <value> { "|" <value> }`
    fn parse_constraint(&mut self, ty: OperandType) -> IselResult<Constraint> {
        let kind = match self.lexer.tok {
            Token::Keyword(Keyword::Any) => {
                self.advance()?;
                return Ok(Constraint::Any);
            }
            Token::Keyword(Keyword::Eq) => CmpKind::Eq,
            Token::Keyword(Keyword::Ne) => CmpKind::Ne,
            Token::Keyword(Keyword::Lt) => CmpKind::Lt,
            Token::Keyword(Keyword::Gt) => CmpKind::Gt,
            Token::Keyword(Keyword::Le) => CmpKind::Le,
            Token::Keyword(Keyword::Ge) => CmpKind::Ge,
            _ => return Ok(Constraint::Any),
        };
        self.advance()?;

        // <value> ::= REGISTER | NUMBER | ONAME | INAME
        let mut params = Vec::new();
        loop {
            let param = match &self.lexer.tok {
                Token::Register(name) => {
                    if ty != OperandType::Reg {
                        return Err(self.lexer.error("expected register constraint operand"));
                    }
                    ConstraintParam::Register(self.table.intern_register(name))
                }
                Token::Number(n) => {
                    if ty != OperandType::Imm {
                        return Err(self.lexer.error("expected immediate constraint operand"));
                    }
                    ConstraintParam::Immediate(*n)
                }
                Token::OName(n) => {
                    if ty != OperandType::Reg {
                        return Err(self.lexer.error("expected register constraint operand"));
                    }
                    ConstraintParam::OName(*n as usize)
                }
                Token::IName(n) => {
                    if ty != OperandType::Reg {
                        return Err(self.lexer.error("expected register constraint operand"));
                    }
                    ConstraintParam::IName(*n as usize)
                }
                _ => return Err(self.lexer.error("expected constraint operand")),
            };
            self.advance()?;
            params.push(param);

            if self.at(&Token::Pipe) {
                self.advance()?;
            } else {
                break;
            }
        }

        Ok(Constraint::Cmp { kind, params })
    }

    /// `<emit> ::= EMIT INSTRUCTION [ <emit-operand> { "," <emit-operand> } ]`
    fn parse_emit(&mut self) -> IselResult<Emit> {
        self.consume_kw(Keyword::Emit)?;

        let instruction = match &self.lexer.tok {
            Token::Instruction(name) => self.table.intern_instruction(name),
            _ => return Err(self.lexer.error("expected instruction name")),
        };
        self.advance()?;

        let mut operands = Vec::new();
        loop {
            // <emit-operand> ::= ONAME | INAME | RESULT | NUMBER | REGISTER
            let op = match &self.lexer.tok {
                Token::OName(n) => EmitOperand::OName(*n as usize),
                Token::IName(n) => EmitOperand::IName(*n as usize),
                Token::Keyword(Keyword::Result) => EmitOperand::Result,
                Token::Number(n) => EmitOperand::Immediate(*n),
                Token::Register(name) => EmitOperand::Register(self.table.intern_register(name)),
                _ => break,
            };
            self.advance()?;
            operands.push(op);

            if self.at(&Token::Comma) {
                self.advance()?;
            } else {
                break;
            }
        }

        Ok(Emit {
            instruction,
            operands,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple_rule() {
        let table = parse_table(
            "t",
            "match i1 where i1 ADD with o1 reg, o2 reg emit MOV o1, result emit ADD o2, result.",
        )
        .unwrap();
        assert_eq!(table.patterns.len(), 1);
        let p = &table.patterns[0];
        assert_eq!(p.icount, 1);
        assert_eq!(p.filters.len(), 1);
        assert_eq!(p.emits.len(), 2);
        assert!(!p.discard);
        assert_eq!(table.instruction_names, vec!["ADD", "MOV"]);
    }

    #[test]
    fn parse_discard_rule() {
        let table = parse_table(
            "t",
            "match i1 where i1 ADD with imm eq 0, o1 reg out o1 discard.",
        )
        .unwrap();
        let p = &table.patterns[0];
        assert!(p.discard);
        assert_eq!(p.result, ResultSpec::OName(1));
        assert_eq!(p.filters[0].operands.len(), 2);
        match &p.filters[0].operands[0] {
            FilterOperand::Operand {
                name: None,
                ty: OperandType::Imm,
                constraint: Constraint::Cmp { kind, params },
            } => {
                assert_eq!(*kind, CmpKind::Eq);
                assert_eq!(params.as_slice(), &[ConstraintParam::Immediate(0)]);
            }
            other => panic!("unexpected operand {other:?}"),
        }
    }

    #[test]
    fn parse_clobbers_and_sequence() {
        let table = parse_table(
            "t",
            "match i1, i2 where i1 IMMEDIATE where i2 ADD with commutative i1, o1 reg \
             clobber %rcx out any emit ADD o1, result.",
        )
        .unwrap();
        let p = &table.patterns[0];
        assert_eq!(p.icount, 2);
        assert_eq!(p.clobbers.len(), 1);
        assert_eq!(p.result, ResultSpec::Any);
        assert!(p.filters[1].commutative);
        assert!(matches!(p.filters[1].operands[0], FilterOperand::IName(1)));
    }

    #[test]
    fn sequences_link_to_shorter_patterns() {
        let table = parse_table(
            "t",
            "match i1 where i1 IMMEDIATE with o1 imm emit MOV o1, result. \
             match i1, i2 where i1 IMMEDIATE where i2 ADD with commutative i1, o1 reg \
             emit ADD o1, result.",
        )
        .unwrap();
        assert_eq!(table.patterns[1].link, Some(0));
        assert_eq!(table.patterns[0].link, None);
    }

    #[test]
    fn macros_expand_into_rules() {
        let table = parse_table(
            "t",
            "macro #binop #OP expands \
               match i1 where i1 #OP with o1 reg, o2 reg \
               emit MOV o1, result \
               emit #OP o2, result. \
             endmacro \
             for ADD, SUB, AND, OR do #binop # endfor",
        )
        .unwrap();
        assert_eq!(table.patterns.len(), 4);
        assert_eq!(table.patterns[3].filters[0].instruction, Some(table.instruction_names.iter().position(|n| n == "OR").unwrap()));
    }

    #[test]
    fn errors_carry_expansion_notes() {
        let err = parse_table(
            "t",
            "macro #bad expands match i1 where i1 bogus endmacro #bad",
        )
        .unwrap_err();
        // The stray identifier is rejected while the expansion is still in
        // flight, so the diagnostic names the macro.
        assert!(!err.expansion_notes.is_empty());
        assert_eq!(err.expansion_notes[0].0, "#bad");
    }
}
