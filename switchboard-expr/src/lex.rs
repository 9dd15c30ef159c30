//! Lexer shared by the match and action grammars.

use std::net::Ipv4Addr;
use std::str::FromStr;

use switchboard_data::{AddrConstant, AddrFamily};

use crate::ExprError;

/// How a numeric literal was written; determines its default mask and
/// whether it can annotate an address-set match.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IntFormat {
    Decimal,
    Hex,
    Ipv4,
    Ipv6,
    Mac,
}

impl IntFormat {
    pub fn family(self) -> Option<AddrFamily> {
        match self {
            IntFormat::Ipv4 => Some(AddrFamily::V4),
            IntFormat::Ipv6 => Some(AddrFamily::V6),
            IntFormat::Mac => Some(AddrFamily::Mac),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Token {
    /// A symbol name, possibly dotted (`ip4.src`).
    Ident(String),
    /// A numeric or address literal.
    Int { value: u128, format: IntFormat },
    /// A double-quoted string.
    Str(String),
    /// `$name`: an address-set reference.
    AddrSet(String),
    /// `@name`: a port-group reference.
    PortGroup(String),
    LParen,
    RParen,
    LBrace,
    RBrace,
    Comma,
    Semi,
    Slash,
    Not,
    AndAnd,
    OrOr,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Assign,
}

pub struct Lexer<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Self {
        Lexer { input, pos: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn bump(&mut self, n: usize) {
        self.pos += n;
    }

    fn skip_ws(&mut self) {
        while self.rest().starts_with(|c: char| c.is_whitespace()) {
            self.bump(1);
        }
    }

    fn take_while(&mut self, pred: impl Fn(char) -> bool) -> &'a str {
        let start = self.pos;
        while let Some(c) = self.rest().chars().next() {
            if pred(c) {
                self.bump(c.len_utf8());
            } else {
                break;
            }
        }
        &self.input[start..self.pos]
    }

    /// Next token, or `None` at end of input.
    pub fn next_token(&mut self) -> Result<Option<Token>, ExprError> {
        self.skip_ws();
        let rest = self.rest();
        let Some(c) = rest.chars().next() else {
            return Ok(None);
        };

        let two = |t| Ok(Some(t));
        if rest.starts_with("&&") {
            self.bump(2);
            return two(Token::AndAnd);
        }
        if rest.starts_with("||") {
            self.bump(2);
            return two(Token::OrOr);
        }
        if rest.starts_with("==") {
            self.bump(2);
            return two(Token::Eq);
        }
        if rest.starts_with("!=") {
            self.bump(2);
            return two(Token::Ne);
        }
        if rest.starts_with("<=") {
            self.bump(2);
            return two(Token::Le);
        }
        if rest.starts_with(">=") {
            self.bump(2);
            return two(Token::Ge);
        }

        let tok = match c {
            '(' => Token::LParen,
            ')' => Token::RParen,
            '{' => Token::LBrace,
            '}' => Token::RBrace,
            ',' => Token::Comma,
            ';' => Token::Semi,
            '/' => Token::Slash,
            '!' => Token::Not,
            '<' => Token::Lt,
            '>' => Token::Gt,
            '=' => Token::Assign,
            '$' | '@' => {
                self.bump(1);
                let name = self.take_while(|c| c.is_alphanumeric() || c == '_' || c == '.');
                if name.is_empty() {
                    return Err(ExprError::Syntax(c.to_string()));
                }
                return Ok(Some(if c == '$' {
                    Token::AddrSet(name.to_string())
                } else {
                    Token::PortGroup(name.to_string())
                }));
            }
            '"' => {
                self.bump(1);
                let s = self.take_while(|c| c != '"');
                if !self.rest().starts_with('"') {
                    return Err(ExprError::Syntax("unterminated string".into()));
                }
                let s = s.to_string();
                self.bump(1);
                return Ok(Some(Token::Str(s)));
            }
            _ if c.is_ascii_digit() || c == ':' => {
                let lexeme = self.take_while(|c| c.is_ascii_hexdigit() || ":.xX".contains(c));
                return Ok(Some(classify_number(lexeme)?));
            }
            _ if c.is_alphabetic() || c == '_' => {
                let lexeme = self.take_while(|c| c.is_alphanumeric() || "_.:".contains(c));
                // An identifier-looking lexeme containing ':' is a MAC
                // written with hex letters (aa:bb:...).
                if lexeme.contains(':') {
                    return Ok(Some(classify_number(lexeme)?));
                }
                return Ok(Some(Token::Ident(lexeme.to_string())));
            }
            _ => return Err(ExprError::Syntax(c.to_string())),
        };
        self.bump(1);
        Ok(Some(tok))
    }

    /// Lex the whole input.
    pub fn tokenize(mut self) -> Result<Vec<Token>, ExprError> {
        let mut out = Vec::new();
        while let Some(t) = self.next_token()? {
            out.push(t);
        }
        Ok(out)
    }
}

fn classify_number(lexeme: &str) -> Result<Token, ExprError> {
    if let Some(hex) = lexeme.strip_prefix("0x").or_else(|| lexeme.strip_prefix("0X")) {
        let value =
            u128::from_str_radix(hex, 16).map_err(|_| ExprError::Syntax(lexeme.into()))?;
        return Ok(Token::Int {
            value,
            format: IntFormat::Hex,
        });
    }
    if lexeme.contains(':') {
        // MAC (exactly six two-digit groups) or IPv6.
        let c = AddrConstant::parse(lexeme).map_err(|_| ExprError::Syntax(lexeme.into()))?;
        let format = match c.family {
            AddrFamily::Mac => IntFormat::Mac,
            _ => IntFormat::Ipv6,
        };
        return Ok(Token::Int {
            value: c.value,
            format,
        });
    }
    if lexeme.contains('.') {
        let v4 = Ipv4Addr::from_str(lexeme).map_err(|_| ExprError::Syntax(lexeme.into()))?;
        return Ok(Token::Int {
            value: u32::from(v4) as u128,
            format: IntFormat::Ipv4,
        });
    }
    let value = lexeme
        .parse::<u128>()
        .map_err(|_| ExprError::Syntax(lexeme.into()))?;
    Ok(Token::Int {
        value,
        format: IntFormat::Decimal,
    })
}

/// Default mask for a slash-mask literal: a bare decimal after `/` on an
/// address literal is a prefix length.
pub fn mask_from_token(
    value_format: IntFormat,
    mask_value: u128,
    mask_format: IntFormat,
) -> Result<u128, ExprError> {
    match (value_format, mask_format) {
        (IntFormat::Ipv4, IntFormat::Decimal) => {
            AddrConstant::prefix_mask(AddrFamily::V4, mask_value as u32)
                .map_err(|_| ExprError::Syntax(format!("/{mask_value}")))
        }
        (IntFormat::Ipv6, IntFormat::Decimal) => {
            AddrConstant::prefix_mask(AddrFamily::V6, mask_value as u32)
                .map_err(|_| ExprError::Syntax(format!("/{mask_value}")))
        }
        (IntFormat::Mac, IntFormat::Decimal) => {
            AddrConstant::prefix_mask(AddrFamily::Mac, mask_value as u32)
                .map_err(|_| ExprError::Syntax(format!("/{mask_value}")))
        }
        _ => Ok(mask_value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex(s: &str) -> Vec<Token> {
        Lexer::new(s).tokenize().unwrap()
    }

    #[test]
    fn lexes_operators_and_literals() {
        assert_eq!(
            lex("ip4.src == {10.0.0.1, $as1} && !eth.dst"),
            vec![
                Token::Ident("ip4.src".into()),
                Token::Eq,
                Token::LBrace,
                Token::Int {
                    value: 0x0a000001,
                    format: IntFormat::Ipv4
                },
                Token::Comma,
                Token::AddrSet("as1".into()),
                Token::RBrace,
                Token::AndAnd,
                Token::Not,
                Token::Ident("eth.dst".into()),
            ]
        );
    }

    #[test]
    fn distinguishes_macs_from_ipv6() {
        assert_eq!(
            lex("fe80::1"),
            vec![Token::Int {
                value: 0xfe80_0000_0000_0000_0000_0000_0000_0001,
                format: IntFormat::Ipv6
            }]
        );
        assert_eq!(
            lex("aa:bb:cc:00:11:22"),
            vec![Token::Int {
                value: 0xaabb_cc00_1122,
                format: IntFormat::Mac
            }]
        );
    }

    #[test]
    fn lexes_strings_and_ports() {
        assert_eq!(
            lex(r#"inport == "sw0-p1""#),
            vec![
                Token::Ident("inport".into()),
                Token::Eq,
                Token::Str("sw0-p1".into()),
            ]
        );
    }
}
