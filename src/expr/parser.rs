//! Recursive-descent / Pratt parser for expressions

use super::ast::{BinOp, Expr, LogicOp, UnOp};
use super::lexer::{tokenize, Spanned, Token};
use super::ExprError;

pub fn parse(source: &str) -> Result<Expr, ExprError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        len: source.len(),
    };
    let expr = parser.expression()?;
    if let Some(extra) = parser.peek() {
        return Err(parser.error_at(extra.offset, "unexpected trailing input"));
    }
    Ok(expr)
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    len: usize,
}

impl Parser {
    // expression := logical ('?' expression ':' expression)?
    fn expression(&mut self) -> Result<Expr, ExprError> {
        let cond = self.logical(0)?;

        if self.eat(&Token::Question) {
            let then = self.expression()?;
            self.expect(&Token::Colon)?;
            let otherwise = self.expression()?;
            return Ok(Expr::Ternary {
                cond: Box::new(cond),
                then: Box::new(then),
                otherwise: Box::new(otherwise),
            });
        }

        Ok(cond)
    }

    // Pratt loop over binary and short-circuit operators.
    fn logical(&mut self, min_bp: u8) -> Result<Expr, ExprError> {
        let mut left = self.unary()?;

        loop {
            let (op, bp) = match self.peek().map(|s| &s.token) {
                Some(Token::Nullish) => (OpKind::Logic(LogicOp::Nullish), 1),
                Some(Token::OrOr) => (OpKind::Logic(LogicOp::Or), 2),
                Some(Token::AndAnd) => (OpKind::Logic(LogicOp::And), 3),
                Some(Token::EqEq) => (OpKind::Bin(BinOp::Eq), 4),
                Some(Token::NotEq) => (OpKind::Bin(BinOp::Ne), 4),
                Some(Token::StrictEq) => (OpKind::Bin(BinOp::StrictEq), 4),
                Some(Token::StrictNe) => (OpKind::Bin(BinOp::StrictNe), 4),
                Some(Token::Lt) => (OpKind::Bin(BinOp::Lt), 5),
                Some(Token::Le) => (OpKind::Bin(BinOp::Le), 5),
                Some(Token::Gt) => (OpKind::Bin(BinOp::Gt), 5),
                Some(Token::Ge) => (OpKind::Bin(BinOp::Ge), 5),
                Some(Token::Plus) => (OpKind::Bin(BinOp::Add), 6),
                Some(Token::Minus) => (OpKind::Bin(BinOp::Sub), 6),
                Some(Token::Star) => (OpKind::Bin(BinOp::Mul), 7),
                Some(Token::Slash) => (OpKind::Bin(BinOp::Div), 7),
                Some(Token::Percent) => (OpKind::Bin(BinOp::Mod), 7),
                _ => break,
            };

            if bp < min_bp {
                break;
            }
            self.advance();

            let right = self.logical(bp + 1)?;
            left = match op {
                OpKind::Bin(op) => Expr::Binary {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                OpKind::Logic(op) => Expr::Logical {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                },
            };
        }

        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, ExprError> {
        if self.eat(&Token::Not) {
            let operand = self.unary()?;
            return Ok(Expr::Unary {
                op: UnOp::Not,
                operand: Box::new(operand),
            });
        }
        if self.eat(&Token::Minus) {
            let operand = self.unary()?;
            return Ok(Expr::Unary {
                op: UnOp::Neg,
                operand: Box::new(operand),
            });
        }
        self.postfix()
    }

    // postfix := primary ( '.' ident | '?.' ident | '[' expr ']' | '?.[' expr ']' | '(' args ')' )*
    fn postfix(&mut self) -> Result<Expr, ExprError> {
        let mut expr = self.primary()?;

        loop {
            if self.eat(&Token::Dot) {
                let name = self.ident()?;
                expr = Expr::Member {
                    object: Box::new(expr),
                    name,
                    optional: false,
                };
            } else if self.eat(&Token::OptionalDot) {
                if self.eat(&Token::LBracket) {
                    let index = self.expression()?;
                    self.expect(&Token::RBracket)?;
                    expr = Expr::Index {
                        object: Box::new(expr),
                        index: Box::new(index),
                        optional: true,
                    };
                } else if matches!(self.peek().map(|s| &s.token), Some(Token::LParen)) {
                    return Err(self.error_here("optional calls are not supported"));
                } else {
                    let name = self.ident()?;
                    expr = Expr::Member {
                        object: Box::new(expr),
                        name,
                        optional: true,
                    };
                }
            } else if self.eat(&Token::LBracket) {
                let index = self.expression()?;
                self.expect(&Token::RBracket)?;
                expr = Expr::Index {
                    object: Box::new(expr),
                    index: Box::new(index),
                    optional: false,
                };
            } else if self.eat(&Token::LParen) {
                let mut args = Vec::new();
                if !self.eat(&Token::RParen) {
                    loop {
                        args.push(self.expression()?);
                        if self.eat(&Token::Comma) {
                            continue;
                        }
                        self.expect(&Token::RParen)?;
                        break;
                    }
                }
                expr = Expr::Call {
                    callee: Box::new(expr),
                    args,
                };
            } else {
                break;
            }
        }

        Ok(expr)
    }

    fn primary(&mut self) -> Result<Expr, ExprError> {
        let spanned = self
            .next()
            .ok_or_else(|| self.error_at_end("unexpected end of expression"))?;

        match spanned.token {
            Token::Number(n) => Ok(Expr::Number(n)),
            Token::Str(s) => Ok(Expr::Str(s)),
            Token::Ident(name) => Ok(match name.as_str() {
                "true" => Expr::Bool(true),
                "false" => Expr::Bool(false),
                "null" | "undefined" => Expr::Null,
                _ => Expr::Ident(name),
            }),
            Token::LParen => {
                let inner = self.expression()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Token::LBracket => {
                let mut items = Vec::new();
                if !self.eat(&Token::RBracket) {
                    loop {
                        items.push(self.expression()?);
                        if self.eat(&Token::Comma) {
                            continue;
                        }
                        self.expect(&Token::RBracket)?;
                        break;
                    }
                }
                Ok(Expr::Array(items))
            }
            Token::LBrace => {
                let mut entries = Vec::new();
                if !self.eat(&Token::RBrace) {
                    loop {
                        let key = match self.next() {
                            Some(Spanned {
                                token: Token::Ident(name),
                                ..
                            }) => name,
                            Some(Spanned {
                                token: Token::Str(s),
                                ..
                            }) => s,
                            _ => return Err(self.error_here("expected object key")),
                        };
                        self.expect(&Token::Colon)?;
                        let value = self.expression()?;
                        entries.push((key, value));
                        if self.eat(&Token::Comma) {
                            continue;
                        }
                        self.expect(&Token::RBrace)?;
                        break;
                    }
                }
                Ok(Expr::Object(entries))
            }
            other => Err(self.error_at(
                spanned.offset,
                &format!("unexpected token {:?}", other),
            )),
        }
    }

    fn ident(&mut self) -> Result<String, ExprError> {
        match self.next() {
            Some(Spanned {
                token: Token::Ident(name),
                ..
            }) => Ok(name),
            _ => Err(self.error_here("expected identifier")),
        }
    }

    fn peek(&self) -> Option<&Spanned> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Spanned> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn advance(&mut self) {
        self.pos += 1;
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek().map(|s| &s.token) == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &Token) -> Result<(), ExprError> {
        if self.eat(token) {
            Ok(())
        } else {
            Err(self.error_here(&format!("expected {:?}", token)))
        }
    }

    fn error_here(&self, message: &str) -> ExprError {
        let offset = self.peek().map(|s| s.offset).unwrap_or(self.len);
        self.error_at(offset, message)
    }

    fn error_at_end(&self, message: &str) -> ExprError {
        self.error_at(self.len, message)
    }

    fn error_at(&self, offset: usize, message: &str) -> ExprError {
        ExprError::Parse {
            offset,
            message: message.to_string(),
        }
    }
}

enum OpKind {
    Bin(BinOp),
    Logic(LogicOp),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precedence() {
        // 1 + 2 * 3 parses as 1 + (2 * 3)
        let ast = parse("1 + 2 * 3").unwrap();
        match ast {
            Expr::Binary {
                op: BinOp::Add,
                right,
                ..
            } => assert!(matches!(*right, Expr::Binary { op: BinOp::Mul, .. })),
            other => panic!("unexpected ast: {:?}", other),
        }
    }

    #[test]
    fn ternary_is_right_associative() {
        let ast = parse("a ? b : c ? d : e").unwrap();
        match ast {
            Expr::Ternary { otherwise, .. } => {
                assert!(matches!(*otherwise, Expr::Ternary { .. }))
            }
            other => panic!("unexpected ast: {:?}", other),
        }
    }

    #[test]
    fn chained_postfix() {
        let ast = parse("body.choices?.[0].delta.content").unwrap();
        // outermost is .content
        assert!(matches!(ast, Expr::Member { ref name, .. } if name == "content"));
    }

    #[test]
    fn object_and_array_literals() {
        let ast = parse("{ role: 'system', parts: [1, 2] }").unwrap();
        match ast {
            Expr::Object(entries) => {
                assert_eq!(entries.len(), 2);
                assert_eq!(entries[0].0, "role");
            }
            other => panic!("unexpected ast: {:?}", other),
        }
    }

    #[test]
    fn rejects_trailing_input() {
        assert!(parse("1 2").is_err());
        assert!(parse("a.").is_err());
        assert!(parse("(a").is_err());
    }
}
