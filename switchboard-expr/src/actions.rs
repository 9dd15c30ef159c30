//! Action programs: parse of a row's action text and encoding into
//! concrete flow actions.

use switchboard_data::{OptionBags, Pipeline};
use switchboard_flow::{FlowAction, MatchField};
use thiserror::Error;
use tracing::debug;

use crate::expr::{Expr, PortDir};
use crate::lex::{Lexer, Token};
use crate::parse::parse_match;
use crate::symtab::{SymbolDef, SymbolTable};
use crate::{ExprError, NoSets, PortResolver};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ActionError {
    #[error("syntax error in actions at `{0}`")]
    Syntax(String),
    #[error("unknown action `{0}`")]
    UnknownAction(String),
    #[error("unknown option `{opt}` for `{action}`")]
    UnknownOption { action: String, opt: String },
    #[error("`drop;` must be the only action")]
    DropNotAlone,
    #[error("cannot assign to `{0}`")]
    BadAssignment(String),
    #[error(transparent)]
    Expr(#[from] ExprError),
}

/// One parsed action.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ActionOp {
    /// `next;` — continue in the next logical table.
    Next,
    /// `output;` — hand the packet to the output stage.
    Output,
    /// Assign a constant to a numeric field.
    Load { field: MatchField, width: u32, value: u128 },
    /// Assign a port name to a logical port register; resolved at encode
    /// time.
    SetPort { dir: PortDir, name: String },
    /// `ct_dnat;` — recirculate through NAT in the common NAT zone.
    CtDnat,
    /// `trigger_event(event = "...");` — punt to the controller.
    TriggerEvent { event: String },
    /// `put_dhcp_opts(...)` and friends; encoded as a controller punt.
    PutOpts { action: &'static str },
}

/// A parsed action program. `drop;` parses to an empty program.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ActionProgram {
    pub ops: Vec<ActionOp>,
}

/// Everything the encoder needs to turn a program into flow actions.
#[derive(Clone, Copy, Debug)]
pub struct EncodeParams {
    pub pipeline: Pipeline,
    pub ingress_ptable: u8,
    pub egress_ptable: u8,
    pub output_ptable: u8,
    /// The row's logical table id.
    pub cur_table: u8,
    pub is_switch: bool,
    /// Prefer the SNAT conntrack zone as the common NAT zone (the
    /// datapath carries a `snat-ct-zone` preference).
    pub use_snat_zone: bool,
    pub meter: Option<u32>,
}

/// Parse `text`, validating option names against the bags. Returns the
/// program and the prerequisite expression implied by the actions, if
/// any.
pub fn parse_actions(
    text: &str,
    symtab: &SymbolTable,
    bags: &OptionBags,
) -> Result<(ActionProgram, Option<Expr>), ActionError> {
    let tokens = Lexer::new(text)
        .tokenize()
        .map_err(|e| ActionError::Syntax(e.to_string()))?;
    let mut p = ActionParser {
        tokens,
        pos: 0,
        symtab,
        bags,
    };
    let mut ops = Vec::new();
    let mut prereqs: Vec<Expr> = Vec::new();
    let mut saw_drop = false;
    while p.peek().is_some() {
        if saw_drop {
            return Err(ActionError::DropNotAlone);
        }
        match p.parse_op()? {
            ParsedOp::Drop => {
                if !ops.is_empty() {
                    return Err(ActionError::DropNotAlone);
                }
                saw_drop = true;
            }
            ParsedOp::Op { op, prereq } => {
                if let Some(pre) = prereq {
                    let parsed = parse_match(pre, symtab, &NoSets, &NoSets)?;
                    prereqs.push(parsed.expr);
                }
                ops.push(op);
            }
        }
    }
    let prereq = match prereqs.len() {
        0 => None,
        1 => Some(prereqs.pop().unwrap()),
        _ => Some(Expr::And(prereqs).simplify()),
    };
    Ok((ActionProgram { ops }, prereq))
}

enum ParsedOp {
    Drop,
    Op {
        op: ActionOp,
        prereq: Option<&'static str>,
    },
}

struct ActionParser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    symtab: &'a SymbolTable,
    bags: &'a OptionBags,
}

impl ActionParser<'_> {
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

    fn expect(&mut self, tok: Token) -> Result<(), ActionError> {
        if self.eat(&tok) {
            Ok(())
        } else {
            Err(ActionError::Syntax(format!("expected {tok:?}")))
        }
    }

    fn parse_op(&mut self) -> Result<ParsedOp, ActionError> {
        let name = match self.next() {
            Some(Token::Ident(n)) => n,
            other => return Err(ActionError::Syntax(format!("{other:?}"))),
        };
        match name.as_str() {
            "next" => {
                self.expect(Token::Semi)?;
                Ok(ParsedOp::Op {
                    op: ActionOp::Next,
                    prereq: None,
                })
            }
            "output" => {
                self.expect(Token::Semi)?;
                Ok(ParsedOp::Op {
                    op: ActionOp::Output,
                    prereq: None,
                })
            }
            "drop" => {
                self.expect(Token::Semi)?;
                Ok(ParsedOp::Drop)
            }
            "ct_dnat" => {
                self.expect(Token::Semi)?;
                Ok(ParsedOp::Op {
                    op: ActionOp::CtDnat,
                    prereq: Some("ip"),
                })
            }
            "trigger_event" => {
                self.expect(Token::LParen)?;
                let mut event = None;
                loop {
                    match self.next() {
                        Some(Token::Ident(opt)) if opt == "event" => {
                            self.expect(Token::Assign)?;
                            match self.next() {
                                Some(Token::Str(s)) => event = Some(s),
                                other => {
                                    return Err(ActionError::Syntax(format!("{other:?}")))
                                }
                            }
                        }
                        Some(Token::Ident(_)) => {
                            // Other options (meter etc.) take one value.
                            self.expect(Token::Assign)?;
                            self.next();
                        }
                        other => return Err(ActionError::Syntax(format!("{other:?}"))),
                    }
                    if !self.eat(&Token::Comma) {
                        break;
                    }
                }
                self.expect(Token::RParen)?;
                self.expect(Token::Semi)?;
                let event = event
                    .ok_or_else(|| ActionError::Syntax("trigger_event without event".into()))?;
                if !self.bags.controller_events.contains(&event) {
                    return Err(ActionError::UnknownOption {
                        action: "trigger_event".into(),
                        opt: event,
                    });
                }
                Ok(ParsedOp::Op {
                    op: ActionOp::TriggerEvent { event },
                    prereq: None,
                })
            }
            "put_dhcp_opts" | "put_dhcpv6_opts" | "put_nd_ra_opts" => {
                let bags = self.bags;
                let (bag, action, prereq): (_, &'static str, &'static str) = match name.as_str() {
                    "put_dhcp_opts" => (&bags.dhcp_opts, "put_dhcp_opts", "ip4 && udp"),
                    "put_dhcpv6_opts" => (&bags.dhcpv6_opts, "put_dhcpv6_opts", "ip6 && udp"),
                    _ => (&bags.nd_ra_opts, "put_nd_ra_opts", "icmp6"),
                };
                self.expect(Token::LParen)?;
                if self.peek() != Some(&Token::RParen) {
                    loop {
                        match self.next() {
                            Some(Token::Ident(opt)) => {
                                if !bag.contains_key(&opt) {
                                    return Err(ActionError::UnknownOption {
                                        action: action.into(),
                                        opt,
                                    });
                                }
                                self.expect(Token::Assign)?;
                                // Option values are opaque here.
                                self.next();
                            }
                            other => return Err(ActionError::Syntax(format!("{other:?}"))),
                        }
                        if !self.eat(&Token::Comma) {
                            break;
                        }
                    }
                }
                self.expect(Token::RParen)?;
                self.expect(Token::Semi)?;
                Ok(ParsedOp::Op {
                    op: ActionOp::PutOpts { action },
                    prereq: Some(prereq),
                })
            }
            _ => {
                // Field assignment.
                if !self.eat(&Token::Assign) {
                    return Err(ActionError::UnknownAction(name));
                }
                let def = self
                    .symtab
                    .get(&name)
                    .ok_or_else(|| ActionError::BadAssignment(name.clone()))?
                    .clone();
                let op = match def {
                    SymbolDef::Field { field, width, .. } => match self.next() {
                        Some(Token::Int { value, .. }) => ActionOp::Load {
                            field,
                            width,
                            value,
                        },
                        other => return Err(ActionError::Syntax(format!("{other:?}"))),
                    },
                    SymbolDef::Port(dir) => match self.next() {
                        Some(Token::Str(port)) => ActionOp::SetPort { dir, name: port },
                        other => return Err(ActionError::Syntax(format!("{other:?}"))),
                    },
                    SymbolDef::Predicate(_) => {
                        return Err(ActionError::BadAssignment(name));
                    }
                };
                self.expect(Token::Semi)?;
                Ok(ParsedOp::Op { op, prereq: None })
            }
        }
    }
}

impl ActionProgram {
    /// Encode into concrete flow actions, resolving port names through
    /// `resolver`.
    pub fn encode(&self, params: &EncodeParams, resolver: &mut dyn PortResolver) -> Vec<FlowAction> {
        let first_ptable = match params.pipeline {
            Pipeline::Ingress => params.ingress_ptable,
            Pipeline::Egress => params.egress_ptable,
        };
        let mut out = Vec::new();
        for op in &self.ops {
            match op {
                ActionOp::Next => out.push(FlowAction::Resubmit {
                    table: first_ptable + params.cur_table + 1,
                }),
                ActionOp::Output => out.push(FlowAction::Resubmit {
                    table: params.output_ptable,
                }),
                ActionOp::Load { field, width, value } => out.push(FlowAction::Load {
                    field: *field,
                    ofs: 0,
                    n_bits: *width as u8,
                    value: *value,
                }),
                ActionOp::SetPort { dir, name } => match resolver.lookup_port(name) {
                    Some(key) => out.push(FlowAction::Load {
                        field: dir.field(),
                        ofs: 0,
                        n_bits: 32,
                        value: key as u128,
                    }),
                    None => {
                        debug!(port = %name, "assignment to unknown port, skipping");
                    }
                },
                ActionOp::CtDnat => out.push(FlowAction::CtNat {
                    snat_zone: params.use_snat_zone,
                }),
                ActionOp::TriggerEvent { .. } | ActionOp::PutOpts { .. } => {
                    out.push(FlowAction::Controller {
                        meter: params.meter,
                    })
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symtab::symtab;

    struct NoPorts;
    impl PortResolver for NoPorts {
        fn lookup_port(&mut self, _: &str) -> Option<u32> {
            None
        }
    }

    fn bags() -> OptionBags {
        let mut b = OptionBags::standard();
        b.dhcp_opts.insert(
            "offerip".into(),
            switchboard_data::OptDef {
                code: 0,
                kind: "ipv4".into(),
            },
        );
        b
    }

    #[test]
    fn parses_next_and_encodes_resubmit() {
        let (prog, prereq) = parse_actions("next;", symtab(), &bags()).unwrap();
        assert!(prereq.is_none());
        let actions = prog.encode(
            &EncodeParams {
                pipeline: Pipeline::Ingress,
                ingress_ptable: 8,
                egress_ptable: 40,
                output_ptable: 37,
                cur_table: 3,
                is_switch: true,
                use_snat_zone: false,
                meter: None,
            },
            &mut NoPorts,
        );
        assert_eq!(actions, vec![FlowAction::Resubmit { table: 12 }]);
    }

    #[test]
    fn drop_is_an_empty_program() {
        let (prog, _) = parse_actions("drop;", symtab(), &bags()).unwrap();
        assert!(prog.ops.is_empty());
        assert!(parse_actions("drop; next;", symtab(), &bags()).is_err());
    }

    #[test]
    fn dhcp_opts_validate_names_and_add_prereq() {
        let (_, prereq) =
            parse_actions("put_dhcp_opts(offerip = 10.0.0.2);", symtab(), &bags()).unwrap();
        assert!(prereq.is_some());
        let err = parse_actions("put_dhcp_opts(bogus = 1);", symtab(), &bags()).unwrap_err();
        assert!(matches!(err, ActionError::UnknownOption { .. }));
    }

    #[test]
    fn trigger_event_validates_event_name() {
        assert!(parse_actions(
            r#"trigger_event(event = "empty_lb_backends");"#,
            symtab(),
            &bags()
        )
        .is_ok());
        assert!(parse_actions(r#"trigger_event(event = "nope");"#, symtab(), &bags()).is_err());
    }

    #[test]
    fn ct_nat_follows_the_datapath_zone_preference() {
        let (prog, prereq) = parse_actions("ct_dnat; next;", symtab(), &bags()).unwrap();
        assert!(prereq.is_some());
        let params = EncodeParams {
            pipeline: Pipeline::Ingress,
            ingress_ptable: 8,
            egress_ptable: 40,
            output_ptable: 37,
            cur_table: 0,
            is_switch: true,
            use_snat_zone: false,
            meter: None,
        };
        let actions = prog.encode(&params, &mut NoPorts);
        assert_eq!(actions[0], FlowAction::CtNat { snat_zone: false });

        let actions = prog.encode(
            &EncodeParams {
                use_snat_zone: true,
                ..params
            },
            &mut NoPorts,
        );
        assert_eq!(actions[0], FlowAction::CtNat { snat_zone: true });
    }

    #[test]
    fn bad_actions_are_rejected() {
        assert!(parse_actions("fly;", symtab(), &bags()).is_err());
        assert!(parse_actions("next", symtab(), &bags()).is_err());
    }
}
