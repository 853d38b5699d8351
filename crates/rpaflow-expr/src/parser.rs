//! Recursive-descent parser with precedence climbing for binary operators.

use serde_json::Value;

use crate::ast::{AssignTarget, BinaryOp, Expr, PathSegment, Stmt, UnaryOp};
use crate::error::ExprError;
use crate::eval::number_value;
use crate::lexer::{tokenize, Token, TokenKind};

/// Parse a single expression (a decision-edge condition).
pub fn parse_expression(source: &str, max_depth: usize) -> Result<Expr, ExprError> {
    let mut parser = Parser::new(tokenize(source)?, max_depth);
    let expr = parser.parse_expr()?;
    parser.expect_eof()?;
    Ok(expr)
}

/// Parse a script body into a statement list.
pub fn parse_program(source: &str, max_depth: usize) -> Result<Vec<Stmt>, ExprError> {
    let mut parser = Parser::new(tokenize(source)?, max_depth);
    let mut stmts = Vec::new();
    while !parser.at(&TokenKind::Eof) {
        if parser.eat(&TokenKind::Semicolon) {
            continue;
        }
        stmts.push(parser.parse_statement()?);
    }
    Ok(stmts)
}

struct Parser {
    tokens: Vec<Token>,
    position: usize,
    depth: usize,
    max_depth: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>, max_depth: usize) -> Self {
        Self {
            tokens,
            position: 0,
            depth: 0,
            max_depth,
        }
    }

    // -- token helpers --

    fn current(&self) -> &Token {
        // tokenize() always ends the stream with Eof, and we never advance past it.
        &self.tokens[self.position.min(self.tokens.len() - 1)]
    }

    fn at(&self, kind: &TokenKind) -> bool {
        &self.current().kind == kind
    }

    fn advance(&mut self) -> Token {
        let token = self.current().clone();
        if token.kind != TokenKind::Eof {
            self.position += 1;
        }
        token
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.at(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> Result<(), ExprError> {
        if self.eat(&kind) {
            Ok(())
        } else {
            Err(self.unexpected(what))
        }
    }

    fn expect_ident(&mut self, what: &str) -> Result<String, ExprError> {
        match self.current().kind.clone() {
            TokenKind::Ident(name) => {
                self.advance();
                Ok(name)
            }
            _ => Err(self.unexpected(what)),
        }
    }

    fn expect_eof(&self) -> Result<(), ExprError> {
        if self.at(&TokenKind::Eof) {
            Ok(())
        } else {
            Err(self.unexpected("end of expression"))
        }
    }

    fn unexpected(&self, expected: &str) -> ExprError {
        let token = self.current();
        let found = match &token.kind {
            TokenKind::Eof => "end of input".to_string(),
            kind => format!("{kind:?}"),
        };
        ExprError::syntax(token.pos, format!("expected {expected}, found {found}"))
    }

    fn enter(&mut self) -> Result<(), ExprError> {
        self.depth += 1;
        if self.depth > self.max_depth {
            return Err(ExprError::TooDeep(self.max_depth));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.release(1);
    }

    fn release(&mut self, levels: usize) {
        self.depth = self.depth.saturating_sub(levels);
    }

    // -- statements --

    fn parse_statement(&mut self) -> Result<Stmt, ExprError> {
        let stmt = match self.current().kind {
            TokenKind::Let => {
                self.advance();
                let name = self.expect_ident("variable name")?;
                let value = if self.eat(&TokenKind::Assign) {
                    self.parse_expr()?
                } else {
                    Expr::Literal(Value::Null)
                };
                Stmt::Let { name, value }
            }
            TokenKind::If => return self.parse_if(),
            TokenKind::For => return self.parse_for(),
            TokenKind::Return => {
                self.advance();
                if matches!(
                    self.current().kind,
                    TokenKind::Semicolon | TokenKind::RightBrace | TokenKind::Eof
                ) {
                    Stmt::Return(None)
                } else {
                    Stmt::Return(Some(self.parse_expr()?))
                }
            }
            TokenKind::Throw => {
                self.advance();
                Stmt::Throw(self.parse_expr()?)
            }
            _ => {
                let pos = self.current().pos;
                let expr = self.parse_expr()?;
                if self.eat(&TokenKind::Assign) {
                    let target = assign_target(expr, pos)?;
                    let value = self.parse_expr()?;
                    Stmt::Assign { target, value }
                } else {
                    Stmt::Expr(expr)
                }
            }
        };
        self.eat(&TokenKind::Semicolon);
        Ok(stmt)
    }

    fn parse_if(&mut self) -> Result<Stmt, ExprError> {
        let mut branches = Vec::new();
        let mut otherwise = None;

        self.expect(TokenKind::If, "'if'")?;
        let cond = self.parse_expr()?;
        branches.push((cond, self.parse_block()?));

        while self.eat(&TokenKind::Else) {
            if self.eat(&TokenKind::If) {
                let cond = self.parse_expr()?;
                branches.push((cond, self.parse_block()?));
            } else {
                otherwise = Some(self.parse_block()?);
                break;
            }
        }
        Ok(Stmt::If {
            branches,
            otherwise,
        })
    }

    /// `for x in items { .. }` or `for (const x of items) { .. }`
    fn parse_for(&mut self) -> Result<Stmt, ExprError> {
        self.expect(TokenKind::For, "'for'")?;
        let parenthesized = self.eat(&TokenKind::LeftParen);
        self.eat(&TokenKind::Let);
        let var = self.expect_ident("loop variable")?;
        self.expect(TokenKind::In, "'in' or 'of'")?;
        let iterable = self.parse_expr()?;
        if parenthesized {
            self.expect(TokenKind::RightParen, "')'")?;
        }
        let body = self.parse_block()?;
        Ok(Stmt::For {
            var,
            iterable,
            body,
        })
    }

    /// A braced block, or a single statement.
    fn parse_block(&mut self) -> Result<Vec<Stmt>, ExprError> {
        self.enter()?;
        let mut stmts = Vec::new();
        if self.eat(&TokenKind::LeftBrace) {
            while !self.eat(&TokenKind::RightBrace) {
                if self.at(&TokenKind::Eof) {
                    return Err(self.unexpected("'}'"));
                }
                if self.eat(&TokenKind::Semicolon) {
                    continue;
                }
                stmts.push(self.parse_statement()?);
            }
        } else {
            stmts.push(self.parse_statement()?);
        }
        self.leave();
        Ok(stmts)
    }

    // -- expressions --

    fn parse_expr(&mut self) -> Result<Expr, ExprError> {
        self.parse_binary(1)
    }

    fn parse_binary(&mut self, min_prec: u8) -> Result<Expr, ExprError> {
        self.enter()?;
        let mut levels = 1;
        let mut left = self.parse_unary()?;
        while let Some(op) = binary_op(&self.current().kind) {
            if op.precedence() < min_prec {
                break;
            }
            self.advance();
            // Each chained operator nests the left operand one level deeper.
            self.enter()?;
            levels += 1;
            let right = self.parse_binary(op.precedence() + 1)?;
            left = Expr::Binary {
                left: Box::new(left),
                op,
                right: Box::new(right),
            };
        }
        self.release(levels);
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ExprError> {
        let op = match self.current().kind {
            TokenKind::Bang => UnaryOp::Not,
            TokenKind::Minus => UnaryOp::Negate,
            _ => return self.parse_postfix(),
        };
        self.advance();
        self.enter()?;
        let expr = self.parse_unary()?;
        self.leave();
        Ok(Expr::Unary {
            op,
            expr: Box::new(expr),
        })
    }

    fn parse_postfix(&mut self) -> Result<Expr, ExprError> {
        let mut expr = self.parse_primary()?;
        let mut levels = 0;
        loop {
            let kind = self.current().kind.clone();
            if matches!(
                kind,
                TokenKind::Dot | TokenKind::LeftBracket | TokenKind::LeftParen
            ) {
                self.enter()?;
                levels += 1;
            }
            match kind {
                TokenKind::Dot => {
                    self.advance();
                    match self.current().kind.clone() {
                        TokenKind::Ident(property) => {
                            self.advance();
                            if self.eat(&TokenKind::LeftParen) {
                                let mut args = vec![expr];
                                args.extend(self.parse_args()?);
                                expr = Expr::Call {
                                    name: property,
                                    args,
                                };
                            } else {
                                expr = Expr::Member {
                                    object: Box::new(expr),
                                    property,
                                };
                            }
                        }
                        TokenKind::Number(n) => {
                            self.advance();
                            expr = Expr::Index {
                                object: Box::new(expr),
                                index: Box::new(Expr::Literal(number_value(n))),
                            };
                        }
                        _ => return Err(self.unexpected("property name")),
                    }
                }
                TokenKind::LeftBracket => {
                    self.advance();
                    let index = self.parse_expr()?;
                    self.expect(TokenKind::RightBracket, "']'")?;
                    expr = Expr::Index {
                        object: Box::new(expr),
                        index: Box::new(index),
                    };
                }
                TokenKind::LeftParen => {
                    let pos = self.current().pos;
                    let Expr::Ident(name) = expr else {
                        return Err(ExprError::syntax(pos, "only named functions can be called"));
                    };
                    self.advance();
                    expr = Expr::Call {
                        name,
                        args: self.parse_args()?,
                    };
                }
                _ => {
                    self.release(levels);
                    return Ok(expr);
                }
            }
        }
    }

    /// Arguments after an opening paren, through the closing paren.
    fn parse_args(&mut self) -> Result<Vec<Expr>, ExprError> {
        let mut args = Vec::new();
        while !self.eat(&TokenKind::RightParen) {
            args.push(self.parse_expr()?);
            if !self.eat(&TokenKind::Comma) {
                self.expect(TokenKind::RightParen, "',' or ')'")?;
                break;
            }
        }
        Ok(args)
    }

    fn parse_primary(&mut self) -> Result<Expr, ExprError> {
        let token = self.current().clone();
        match token.kind {
            TokenKind::Number(n) => {
                self.advance();
                Ok(Expr::Literal(number_value(n)))
            }
            TokenKind::Str(s) => {
                self.advance();
                Ok(Expr::Literal(Value::String(s)))
            }
            TokenKind::True => {
                self.advance();
                Ok(Expr::Literal(Value::Bool(true)))
            }
            TokenKind::False => {
                self.advance();
                Ok(Expr::Literal(Value::Bool(false)))
            }
            TokenKind::Null => {
                self.advance();
                Ok(Expr::Literal(Value::Null))
            }
            TokenKind::Ident(name) => {
                self.advance();
                Ok(Expr::Ident(name))
            }
            TokenKind::LeftParen => {
                self.advance();
                let expr = self.parse_expr()?;
                self.expect(TokenKind::RightParen, "')'")?;
                Ok(expr)
            }
            TokenKind::LeftBracket => {
                self.advance();
                let mut items = Vec::new();
                while !self.eat(&TokenKind::RightBracket) {
                    items.push(self.parse_expr()?);
                    if !self.eat(&TokenKind::Comma) {
                        self.expect(TokenKind::RightBracket, "',' or ']'")?;
                        break;
                    }
                }
                Ok(Expr::Array(items))
            }
            TokenKind::LeftBrace => {
                self.advance();
                let mut fields = Vec::new();
                while !self.eat(&TokenKind::RightBrace) {
                    let key = match self.current().kind.clone() {
                        TokenKind::Ident(k) | TokenKind::Str(k) => {
                            self.advance();
                            k
                        }
                        _ => return Err(self.unexpected("object key")),
                    };
                    let value = if self.eat(&TokenKind::Colon) {
                        self.parse_expr()?
                    } else {
                        // shorthand `{ name }`
                        Expr::Ident(key.clone())
                    };
                    fields.push((key, value));
                    if !self.eat(&TokenKind::Comma) {
                        self.expect(TokenKind::RightBrace, "',' or '}'")?;
                        break;
                    }
                }
                Ok(Expr::Object(fields))
            }
            _ => Err(self.unexpected("expression")),
        }
    }
}

fn binary_op(kind: &TokenKind) -> Option<BinaryOp> {
    Some(match kind {
        TokenKind::Plus => BinaryOp::Add,
        TokenKind::Minus => BinaryOp::Subtract,
        TokenKind::Star => BinaryOp::Multiply,
        TokenKind::Slash => BinaryOp::Divide,
        TokenKind::Percent => BinaryOp::Modulo,
        TokenKind::EqEq => BinaryOp::Equal,
        TokenKind::NotEq => BinaryOp::NotEqual,
        TokenKind::Less => BinaryOp::LessThan,
        TokenKind::LessEq => BinaryOp::LessEqual,
        TokenKind::Greater => BinaryOp::GreaterThan,
        TokenKind::GreaterEq => BinaryOp::GreaterEqual,
        TokenKind::RegexMatch => BinaryOp::RegexMatch,
        TokenKind::And => BinaryOp::And,
        TokenKind::Or => BinaryOp::Or,
        _ => return None,
    })
}

fn assign_target(expr: Expr, pos: usize) -> Result<AssignTarget, ExprError> {
    match expr {
        Expr::Ident(name) => Ok(AssignTarget {
            name,
            path: Vec::new(),
        }),
        Expr::Member { object, property } => {
            let mut target = assign_target(*object, pos)?;
            target.path.push(PathSegment::Field(property));
            Ok(target)
        }
        Expr::Index { object, index } => {
            let mut target = assign_target(*object, pos)?;
            target.path.push(PathSegment::Index(*index));
            Ok(target)
        }
        _ => Err(ExprError::syntax(pos, "invalid assignment target")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ident(name: &str) -> Box<Expr> {
        Box::new(Expr::Ident(name.into()))
    }

    #[test]
    fn test_precedence() {
        let expr = parse_expression("a || b && c == 1 + 2 * 3", 64).unwrap();
        let Expr::Binary { op, right, .. } = expr else {
            panic!("expected binary");
        };
        assert_eq!(op, BinaryOp::Or);
        let Expr::Binary { op, right, .. } = *right else {
            panic!("expected binary");
        };
        assert_eq!(op, BinaryOp::And);
        let Expr::Binary { op, right, .. } = *right else {
            panic!("expected binary");
        };
        assert_eq!(op, BinaryOp::Equal);
        let Expr::Binary { op, right, .. } = *right else {
            panic!("expected binary");
        };
        assert_eq!(op, BinaryOp::Add);
        assert!(matches!(
            *right,
            Expr::Binary {
                op: BinaryOp::Multiply,
                ..
            }
        ));
    }

    #[test]
    fn test_left_associative() {
        let expr = parse_expression("10 - 4 - 3", 64).unwrap();
        let Expr::Binary { left, op, right } = expr else {
            panic!("expected binary");
        };
        assert_eq!(op, BinaryOp::Subtract);
        assert_eq!(*right, Expr::Literal(json!(3)));
        assert!(matches!(
            *left,
            Expr::Binary {
                op: BinaryOp::Subtract,
                ..
            }
        ));
    }

    #[test]
    fn test_member_index_and_method_call() {
        assert_eq!(
            parse_expression("page.title.contains('Dash')", 64).unwrap(),
            Expr::Call {
                name: "contains".into(),
                args: vec![
                    Expr::Member {
                        object: ident("page"),
                        property: "title".into(),
                    },
                    Expr::Literal(json!("Dash")),
                ],
            }
        );
        assert_eq!(
            parse_expression("rows[0]", 64).unwrap(),
            Expr::Index {
                object: ident("rows"),
                index: Box::new(Expr::Literal(json!(0))),
            }
        );
    }

    #[test]
    fn test_literals() {
        assert_eq!(
            parse_expression("{a: 1, 'b c': [true, null], d}", 64).unwrap(),
            Expr::Object(vec![
                ("a".into(), Expr::Literal(json!(1))),
                (
                    "b c".into(),
                    Expr::Array(vec![
                        Expr::Literal(json!(true)),
                        Expr::Literal(Value::Null)
                    ])
                ),
                ("d".into(), Expr::Ident("d".into())),
            ])
        );
    }

    #[test]
    fn test_trailing_tokens_rejected() {
        assert!(matches!(
            parse_expression("a b", 64).unwrap_err(),
            ExprError::Syntax { pos: 2, .. }
        ));
    }

    #[test]
    fn test_depth_limit() {
        let deep = format!("{}1{}", "(".repeat(40), ")".repeat(40));
        assert!(parse_expression(&deep, 64).is_ok());
        assert_eq!(
            parse_expression(&deep, 16).unwrap_err(),
            ExprError::TooDeep(16)
        );
    }

    #[test]
    fn test_depth_limit_counts_operator_chains() {
        let chain = format!("1{}", " + 1".repeat(20_000));
        assert_eq!(
            parse_expression(&chain, 64).unwrap_err(),
            ExprError::TooDeep(64)
        );
        let short = format!("1{}", " + 1".repeat(20));
        assert!(parse_expression(&short, 64).is_ok());
    }

    #[test]
    fn test_depth_limit_counts_postfix_chains() {
        let members = format!("x{}", ".y".repeat(20_000));
        assert_eq!(
            parse_expression(&members, 64).unwrap_err(),
            ExprError::TooDeep(64)
        );
        let indexes = format!("x{}", "[0]".repeat(20_000));
        assert_eq!(
            parse_expression(&indexes, 64).unwrap_err(),
            ExprError::TooDeep(64)
        );
        assert!(parse_expression("a.b.c[0].d", 64).is_ok());
    }

    #[test]
    fn test_program_statements() {
        let program = parse_program(
            r#"
            let total = 0;
            for (const row of rows) {
                if row.ok { total = total + 1 } else if row.skip { } else throw "bad row";
            }
            result.count = total;
            return { total }
            "#,
            64,
        )
        .unwrap();
        assert_eq!(program.len(), 4);
        assert!(matches!(program[0], Stmt::Let { .. }));
        let Stmt::For { var, body, .. } = &program[1] else {
            panic!("expected for");
        };
        assert_eq!(var, "row");
        let Stmt::If {
            branches,
            otherwise,
        } = &body[0]
        else {
            panic!("expected if");
        };
        assert_eq!(branches.len(), 2);
        assert!(matches!(
            otherwise.as_deref(),
            Some([Stmt::Throw(_)])
        ));
        let Stmt::Assign { target, .. } = &program[2] else {
            panic!("expected assignment");
        };
        assert_eq!(target.name, "result");
        assert_eq!(target.path, vec![PathSegment::Field("count".into())]);
        assert!(matches!(program[3], Stmt::Return(Some(Expr::Object(_)))));
    }

    #[test]
    fn test_invalid_assignment_target() {
        assert!(matches!(
            parse_program("len(x) = 1", 64).unwrap_err(),
            ExprError::Syntax { .. }
        ));
    }
}
