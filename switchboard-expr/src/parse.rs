//! Recursive-descent parser for the match language.

use std::collections::{HashMap, HashSet};

use crate::expr::{Cmp, CmpConst, Condition, Expr, FieldRef, RelOp};
use crate::lex::{mask_from_token, IntFormat, Lexer, Token};
use crate::symtab::{SymbolDef, SymbolTable};
use crate::{AddrSetLookup, ExprError, NoSets, PortGroupLookup};

/// A parsed match: the simplified expression plus the names it
/// referenced.
#[derive(Debug)]
pub struct ParseResult {
    pub expr: Expr,
    /// Address-set name → number of references in the expression.
    pub addr_sets: HashMap<String, usize>,
    pub port_groups: HashSet<String>,
}

impl ParseResult {
    /// Whether the match referenced any address set or port group;
    /// such matches must be re-expanded every cycle and are never
    /// cached.
    pub fn has_set_refs(&self) -> bool {
        !self.addr_sets.is_empty() || !self.port_groups.is_empty()
    }
}

/// Parse `text` against the symbol table, expanding address-set and
/// port-group references through the supplied lookups.
pub fn parse_match(
    text: &str,
    symtab: &SymbolTable,
    addr_sets: &dyn AddrSetLookup,
    port_groups: &dyn PortGroupLookup,
) -> Result<ParseResult, ExprError> {
    let tokens = Lexer::new(text).tokenize()?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        symtab,
        addr_sets,
        port_groups,
        addr_set_refs: HashMap::new(),
        port_group_refs: HashSet::new(),
    };
    let expr = parser.parse_expr()?;
    if parser.pos != parser.tokens.len() {
        return Err(ExprError::Syntax(format!(
            "{:?}",
            parser.tokens[parser.pos]
        )));
    }
    Ok(ParseResult {
        expr: expr.simplify(),
        addr_sets: parser.addr_set_refs,
        port_groups: parser.port_group_refs,
    })
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    symtab: &'a SymbolTable,
    addr_sets: &'a dyn AddrSetLookup,
    port_groups: &'a dyn PortGroupLookup,
    addr_set_refs: HashMap<String, usize>,
    port_group_refs: HashSet<String>,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn eat(&mut self, tok: &Token) -> bool {
        if self.peek() == Some(tok) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, tok: Token) -> Result<(), ExprError> {
        if self.eat(&tok) {
            Ok(())
        } else {
            Err(ExprError::Syntax(format!("expected {tok:?}")))
        }
    }

    fn parse_expr(&mut self) -> Result<Expr, ExprError> {
        let mut terms = vec![self.parse_and()?];
        while self.eat(&Token::OrOr) {
            terms.push(self.parse_and()?);
        }
        Ok(if terms.len() == 1 {
            terms.pop().unwrap()
        } else {
            Expr::Or(terms)
        })
    }

    fn parse_and(&mut self) -> Result<Expr, ExprError> {
        let mut terms = vec![self.parse_not()?];
        while self.eat(&Token::AndAnd) {
            terms.push(self.parse_not()?);
        }
        Ok(if terms.len() == 1 {
            terms.pop().unwrap()
        } else {
            Expr::And(terms)
        })
    }

    fn parse_not(&mut self) -> Result<Expr, ExprError> {
        if self.eat(&Token::Not) {
            Ok(self.parse_not()?.negate())
        } else {
            self.parse_primary()
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, ExprError> {
        match self.next() {
            Some(Token::LParen) => {
                let e = self.parse_expr()?;
                self.expect(Token::RParen)?;
                Ok(e)
            }
            Some(Token::Int {
                value,
                format: IntFormat::Decimal,
            }) => Ok(Expr::Boolean(value != 0)),
            Some(Token::Ident(name)) if name == "is_chassis_resident" => {
                self.expect(Token::LParen)?;
                let port = match self.next() {
                    Some(Token::Str(s)) => s,
                    other => return Err(ExprError::Syntax(format!("{other:?}"))),
                };
                self.expect(Token::RParen)?;
                Ok(Expr::Condition(Condition {
                    port,
                    negated: false,
                }))
            }
            Some(Token::Ident(name)) => self.parse_symbol(&name),
            other => Err(ExprError::Syntax(format!("{other:?}"))),
        }
    }

    fn parse_symbol(&mut self, name: &str) -> Result<Expr, ExprError> {
        let def = self
            .symtab
            .get(name)
            .ok_or_else(|| ExprError::UnknownSymbol(name.to_string()))?
            .clone();
        match def {
            SymbolDef::Predicate(expansion) => self.parse_fragment(expansion),
            SymbolDef::Field {
                field,
                width,
                prereq,
            } => {
                let relop = self.parse_relop()?;
                let constants = self.parse_int_cset(width)?;
                self.check_relop(relop, &constants)?;
                let cmp = Expr::Cmp(Cmp {
                    field: FieldRef::Int { field, width },
                    relop,
                    constants,
                });
                match prereq {
                    None => Ok(cmp),
                    Some(p) => Ok(Expr::And(vec![cmp, self.parse_fragment(p)?])),
                }
            }
            SymbolDef::Port(dir) => {
                let relop = self.parse_relop()?;
                if relop != RelOp::Eq {
                    return Err(ExprError::BadRelational);
                }
                let constants = self.parse_port_cset()?;
                Ok(Expr::Cmp(Cmp {
                    field: FieldRef::Port(dir),
                    relop,
                    constants,
                }))
            }
        }
    }

    /// Parse a prerequisite or predicate expansion; these are static
    /// strings that never reference sets.
    fn parse_fragment(&mut self, text: &str) -> Result<Expr, ExprError> {
        let parsed = parse_match(text, self.symtab, &NoSets, &NoSets)?;
        Ok(parsed.expr)
    }

    fn parse_relop(&mut self) -> Result<RelOp, ExprError> {
        match self.next() {
            Some(Token::Eq) => Ok(RelOp::Eq),
            Some(Token::Ne) => Ok(RelOp::Ne),
            Some(Token::Lt) => Ok(RelOp::Lt),
            Some(Token::Le) => Ok(RelOp::Le),
            Some(Token::Gt) => Ok(RelOp::Gt),
            Some(Token::Ge) => Ok(RelOp::Ge),
            other => Err(ExprError::Syntax(format!("{other:?}"))),
        }
    }

    fn check_relop(&self, relop: RelOp, constants: &[CmpConst]) -> Result<(), ExprError> {
        if relop == RelOp::Eq || relop == RelOp::Ne {
            return Ok(());
        }
        match constants {
            [CmpConst::Int { mask: None, .. }] => Ok(()),
            [CmpConst::Int { mask: Some(_), .. }] => Err(ExprError::MaskedRelational),
            _ => Err(ExprError::BadRelational),
        }
    }

    fn parse_int_cset(&mut self, width: u32) -> Result<Vec<CmpConst>, ExprError> {
        let mut out = Vec::new();
        if self.eat(&Token::LBrace) {
            loop {
                self.parse_int_const(width, &mut out)?;
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
            self.expect(Token::RBrace)?;
        } else {
            self.parse_int_const(width, &mut out)?;
        }
        Ok(out)
    }

    fn parse_int_const(&mut self, width: u32, out: &mut Vec<CmpConst>) -> Result<(), ExprError> {
        let wmask = if width == 128 {
            u128::MAX
        } else {
            (1u128 << width) - 1
        };
        match self.next() {
            Some(Token::Int { value, format }) => {
                let mask = if self.eat(&Token::Slash) {
                    match self.next() {
                        Some(Token::Int {
                            value: mv,
                            format: mf,
                        }) => Some(mask_from_token(format, mv, mf)?),
                        other => return Err(ExprError::Syntax(format!("{other:?}"))),
                    }
                } else {
                    None
                };
                if value & !wmask != 0 || mask.is_some_and(|m| m & !wmask != 0) {
                    return Err(ExprError::ConstantTooWide { value, width });
                }
                out.push(CmpConst::Int {
                    value,
                    mask,
                    as_name: None,
                });
                Ok(())
            }
            Some(Token::AddrSet(name)) => {
                *self.addr_set_refs.entry(name.clone()).or_insert(0) += 1;
                if let Some(addrs) = self.addr_sets.addr_set(&name) {
                    for c in addrs {
                        if c.value & !wmask != 0 {
                            return Err(ExprError::ConstantTooWide {
                                value: c.value,
                                width,
                            });
                        }
                        out.push(CmpConst::Int {
                            value: c.value,
                            mask: c.mask,
                            as_name: Some(name.clone()),
                        });
                    }
                }
                Ok(())
            }
            Some(Token::Str(_)) | Some(Token::PortGroup(_)) => Err(ExprError::StringOnNumericField),
            other => Err(ExprError::Syntax(format!("{other:?}"))),
        }
    }

    fn parse_port_cset(&mut self) -> Result<Vec<CmpConst>, ExprError> {
        let mut out = Vec::new();
        if self.eat(&Token::LBrace) {
            loop {
                self.parse_port_const(&mut out)?;
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
            self.expect(Token::RBrace)?;
        } else {
            self.parse_port_const(&mut out)?;
        }
        Ok(out)
    }

    fn parse_port_const(&mut self, out: &mut Vec<CmpConst>) -> Result<(), ExprError> {
        match self.next() {
            Some(Token::Str(s)) => {
                out.push(CmpConst::Str(s));
                Ok(())
            }
            Some(Token::PortGroup(name)) => {
                self.port_group_refs.insert(name.clone());
                if let Some(ports) = self.port_groups.port_group(&name) {
                    out.extend(ports.iter().cloned().map(CmpConst::Str));
                }
                Ok(())
            }
            Some(Token::Int { .. }) | Some(Token::AddrSet(_)) => {
                Err(ExprError::NumericOnPortField)
            }
            other => Err(ExprError::Syntax(format!("{other:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symtab::symtab;
    use switchboard_flow::MatchField;

    fn parse(text: &str) -> ParseResult {
        parse_match(text, symtab(), &NoSets, &NoSets).unwrap()
    }

    #[test]
    fn parses_simple_cmp_with_prereq() {
        let r = parse("ip4.src == 10.0.0.1");
        // The ip4 prerequisite (eth.type == 0x800) is ANDed in.
        match &r.expr {
            Expr::And(terms) => {
                assert_eq!(terms.len(), 2);
                assert!(matches!(&terms[0], Expr::Cmp(c)
                    if c.field == FieldRef::Int { field: MatchField::Ip4Src, width: 32 }));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn records_addr_set_multiplicity() {
        struct OneSet;
        impl AddrSetLookup for OneSet {
            fn addr_set(&self, name: &str) -> Option<&[switchboard_data::AddrConstant]> {
                (name == "as1").then_some(&[])
            }
        }
        let r = parse_match(
            "ip4.src == $as1 || ip4.dst == $as1",
            symtab(),
            &OneSet,
            &NoSets,
        )
        .unwrap();
        assert_eq!(r.addr_sets.get("as1"), Some(&2));
        assert!(r.has_set_refs());
        // Unknown sets still get referenced so a later creation
        // reprocesses the row; they expand to nothing.
        let r = parse_match("ip4.src == $ghost", symtab(), &OneSet, &NoSets).unwrap();
        assert_eq!(r.addr_sets.get("ghost"), Some(&1));
        assert_eq!(r.expr, Expr::Boolean(false));
    }

    #[test]
    fn parses_condition_and_negation() {
        let r = parse(r#"!is_chassis_resident("cr-p1")"#);
        assert_eq!(
            r.expr,
            Expr::Condition(Condition {
                port: "cr-p1".into(),
                negated: true
            })
        );
    }

    #[test]
    fn rejects_malformed_input() {
        assert!(parse_match("ip4.src ==", symtab(), &NoSets, &NoSets).is_err());
        assert!(parse_match("bogus == 1", symtab(), &NoSets, &NoSets).is_err());
        assert!(parse_match("ip4.src == \"p1\"", symtab(), &NoSets, &NoSets).is_err());
        assert!(parse_match("inport == 5", symtab(), &NoSets, &NoSets).is_err());
        assert!(parse_match("ip.proto == 0x1ff", symtab(), &NoSets, &NoSets).is_err());
    }

    #[test]
    fn boolean_literals() {
        assert_eq!(parse("1").expr, Expr::Boolean(true));
        assert_eq!(parse("0").expr, Expr::Boolean(false));
    }
}
