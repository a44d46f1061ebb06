//! Tokenizer and precedence-climbing parser.

use super::functions::{self, BinaryFn, TernaryFn, UnaryFn};
use super::{parse_error, BinOp, Node, ReferenceVariables, SimVar, SimVarKind};
use crate::stat::StatisticInstance;
use crate::tree::TreeNode;
use st_common::{Error, Result};
use std::rc::Rc;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    LParen,
    RParen,
    Comma,
    Op(BinOp),
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Number(v) => format!("number {}", v),
            Token::Ident(s) => format!("'{}'", s),
            Token::LParen => "'('".to_string(),
            Token::RParen => "')'".to_string(),
            Token::Comma => "','".to_string(),
            Token::Op(op) => format!(
                "'{}'",
                match op {
                    BinOp::Add => "+",
                    BinOp::Sub => "-",
                    BinOp::Mul => "*",
                    BinOp::Div => "/",
                }
            ),
        }
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '.'
}

fn tokenize(text: &str) -> Result<Vec<(Token, usize)>> {
    let chars: Vec<(usize, char)> = text.char_indices().collect();
    let mut out = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let (pos, c) = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        let simple = match c {
            '(' => Some(Token::LParen),
            ')' => Some(Token::RParen),
            ',' => Some(Token::Comma),
            '+' => Some(Token::Op(BinOp::Add)),
            '-' => Some(Token::Op(BinOp::Sub)),
            '*' => Some(Token::Op(BinOp::Mul)),
            '/' => Some(Token::Op(BinOp::Div)),
            _ => None,
        };
        if let Some(tok) = simple {
            out.push((tok, pos));
            i += 1;
            continue;
        }
        if c.is_ascii_digit() || (c == '.' && chars.get(i + 1).is_some_and(|(_, n)| n.is_ascii_digit())) {
            while i < chars.len() && (chars[i].1.is_ascii_digit() || chars[i].1 == '.') {
                i += 1;
            }
            // Exponent: e / E followed by optional sign and digits.
            if i < chars.len() && matches!(chars[i].1, 'e' | 'E') {
                let mut j = i + 1;
                if j < chars.len() && matches!(chars[j].1, '+' | '-') {
                    j += 1;
                }
                if j < chars.len() && chars[j].1.is_ascii_digit() {
                    while j < chars.len() && chars[j].1.is_ascii_digit() {
                        j += 1;
                    }
                    i = j;
                }
            }
            let end = chars.get(i).map(|(p, _)| *p).unwrap_or(text.len());
            let literal = &text[pos..end];
            let value = literal
                .parse::<f64>()
                .map_err(|_| parse_error(text, pos, format!("malformed number '{}'", literal)))?;
            if i < chars.len() && is_ident_start(chars[i].1) {
                return Err(parse_error(text, chars[i].0, format!("unexpected character '{}' after number", chars[i].1)));
            }
            out.push((Token::Number(value), pos));
            continue;
        }
        if is_ident_start(c) {
            let start = pos;
            while i < chars.len() && is_ident_char(chars[i].1) {
                i += 1;
            }
            let end = chars.get(i).map(|(p, _)| *p).unwrap_or(text.len());
            out.push((Token::Ident(text[start..end].to_string()), pos));
            continue;
        }
        return Err(parse_error(text, pos, format!("unexpected character '{}'", c)));
    }
    Ok(out)
}

pub(super) struct Parser<'a> {
    text: &'a str,
    tokens: Vec<(Token, usize)>,
    pos: usize,
    context: &'a Rc<TreeNode>,
    used: &'a mut Vec<Rc<TreeNode>>,
    refs: &'a ReferenceVariables,
}

impl<'a> Parser<'a> {
    pub(super) fn new(
        text: &'a str,
        context: &'a Rc<TreeNode>,
        used: &'a mut Vec<Rc<TreeNode>>,
        refs: &'a ReferenceVariables,
    ) -> Result<Self> {
        Ok(Self {
            text,
            tokens: tokenize(text)?,
            pos: 0,
            context,
            used,
            refs,
        })
    }

    pub(super) fn parse(mut self) -> Result<Node> {
        if self.tokens.is_empty() {
            return Err(Error::parse(format!("empty expression '{}'", self.text)));
        }
        let node = self.parse_expr(1)?;
        if let Some((tok, pos)) = self.tokens.get(self.pos) {
            let remainder = &self.text[*pos..];
            return Err(parse_error(
                self.text,
                *pos,
                format!("unparsed remainder '{}' starting with {}", remainder.trim(), tok.describe()),
            ));
        }
        Ok(node)
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn position(&self) -> usize {
        self.tokens.get(self.pos).map(|(_, p)| *p).unwrap_or(self.text.len())
    }

    fn next(&mut self) -> Option<(Token, usize)> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn expect(&mut self, want: Token) -> Result<()> {
        let pos = self.position();
        match self.next() {
            Some((tok, _)) if tok == want => Ok(()),
            Some((tok, p)) => Err(parse_error(
                self.text,
                p,
                format!("expected {} but found {}", want.describe(), tok.describe()),
            )),
            None => Err(parse_error(
                self.text,
                pos,
                format!("expected {} but reached end of input", want.describe()),
            )),
        }
    }

    fn parse_expr(&mut self, min_prec: u8) -> Result<Node> {
        let mut lhs = self.parse_unary()?;
        while let Some(Token::Op(op)) = self.peek() {
            let op = *op;
            let prec = op.precedence();
            if prec < min_prec {
                break;
            }
            self.pos += 1;
            let rhs = self.parse_expr(prec + 1)?;
            lhs = Node::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Node> {
        match self.peek() {
            Some(Token::Op(BinOp::Sub)) => {
                self.pos += 1;
                Ok(Node::Neg(Box::new(self.parse_unary()?)))
            }
            Some(Token::Op(BinOp::Add)) => {
                self.pos += 1;
                self.parse_unary()
            }
            _ => self.parse_primary(),
        }
    }

    fn parse_primary(&mut self) -> Result<Node> {
        let pos = self.position();
        match self.next() {
            Some((Token::Number(v), _)) => Ok(Node::Const(v)),
            Some((Token::LParen, _)) => {
                let inner = self.parse_expr(1)?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some((Token::Ident(name), p)) => {
                if self.peek() == Some(&Token::LParen) {
                    self.pos += 1;
                    self.parse_call(&name, p)
                } else {
                    self.resolve_identifier(&name, p)
                }
            }
            Some((tok, p)) => Err(parse_error(
                self.text,
                p,
                format!("unexpected {}", tok.describe()),
            )),
            None => Err(parse_error(self.text, pos, "unexpected end of expression")),
        }
    }

    fn parse_call(&mut self, name: &str, pos: usize) -> Result<Node> {
        let Some(arity) = functions::arity(name) else {
            return Err(parse_error(self.text, pos, format!("unknown function '{}'", name)));
        };
        let mut args = Vec::new();
        if self.peek() != Some(&Token::RParen) {
            loop {
                args.push(self.parse_expr(1)?);
                if self.peek() == Some(&Token::Comma) {
                    self.pos += 1;
                } else {
                    break;
                }
            }
        }
        self.expect(Token::RParen)?;
        if args.len() != arity {
            return Err(parse_error(
                self.text,
                pos,
                format!("function '{}' expects {} argument(s), got {}", name, arity, args.len()),
            ));
        }
        let mut args = args.into_iter().map(Box::new);
        let mut arg = || match args.next() {
            Some(a) => Ok(a),
            None => Err(parse_error(self.text, pos, format!("missing argument to '{}'", name))),
        };
        if let Some(func) = UnaryFn::lookup(name) {
            return Ok(Node::Unary { func, arg: arg()? });
        }
        if let Some(func) = BinaryFn::lookup(name) {
            let a = arg()?;
            return Ok(Node::Call2 { func, a, b: arg()? });
        }
        match TernaryFn::lookup(name) {
            Some(func) => {
                let a = arg()?;
                let b = arg()?;
                Ok(Node::Call3 { func, a, b, c: arg()? })
            }
            None => Err(parse_error(self.text, pos, format!("unknown function '{}'", name))),
        }
    }

    fn resolve_identifier(&mut self, name: &str, pos: usize) -> Result<Node> {
        if let Some(v) = functions::constant(name) {
            return Ok(Node::Const(v));
        }
        if let Some(kind) = SimVarKind::lookup(name) {
            let clock = self.context.clock().ok_or_else(|| {
                parse_error(
                    self.text,
                    pos,
                    format!("'{}' needs a clock but '{}' has none", name, self.context.location()),
                )
            })?;
            return Ok(Node::SimVar(SimVar::new(kind, clock)));
        }
        if let Some(cell) = self.refs.get(name) {
            return Ok(Node::Ref {
                name: name.to_string(),
                cell: Rc::clone(cell),
            });
        }
        let node = self.context.resolve(name).ok_or_else(|| {
            parse_error(
                self.text,
                pos,
                format!("unknown variable '{}' (not found under '{}')", name, self.context.location()),
            )
        })?;
        if !node.is_statistic_source() {
            return Err(parse_error(
                self.text,
                pos,
                format!(
                    "'{}' is a {}, not a counter, parameter or statistic definition",
                    node.location(),
                    node.kind().as_str()
                ),
            ));
        }
        let si = StatisticInstance::from_node_in(&node, self.used)?;
        Ok(Node::Var {
            location: node.location(),
            si: Box::new(si),
        })
    }
}
