//! Parser for the kernel dialect
//!
//! Parses kernel functions like:
//! - `def add(i: int, a: View1D[float64], b: View1D[float64]):`
//! - `def dot(team_member: TeamMember, acc: Acc[float64], x: View2D[float64]):`
//! - nested `def` blocks used as inner parallel work functions

use crate::ast::{BinOp, Expr, ExprKind, FunctionDef, Module, Param, Stmt, StmtKind, TypeExpr, UnaryOp};
use crate::error::{KernelError, KernelResult, Location};
use crate::lexer::{Lexer, Spanned, Token};

/// Parser for kernel source
pub struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
}

impl Parser {
    pub fn new(source: &str) -> KernelResult<Self> {
        let tokens = Lexer::new(source).tokenize()?;
        Ok(Self { tokens, pos: 0 })
    }

    fn current(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)].token
    }

    fn location(&self) -> Location {
        self.tokens[self.pos.min(self.tokens.len() - 1)].location
    }

    /// Advance to the next token
    fn advance(&mut self) -> Token {
        let token = self.current().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    /// Check if current token matches expected
    fn check(&self, expected: &Token) -> bool {
        std::mem::discriminant(self.current()) == std::mem::discriminant(expected)
    }

    /// Consume token if it matches
    fn eat(&mut self, expected: &Token) -> bool {
        if self.check(expected) {
            self.advance();
            true
        } else {
            false
        }
    }

    /// Consume token if it matches, otherwise error
    fn expect(&mut self, expected: Token) -> KernelResult<Token> {
        if self.check(&expected) {
            Ok(self.advance())
        } else {
            Err(self.error(format!("expected '{}', got '{}'", expected, self.current())))
        }
    }

    fn expect_ident(&mut self) -> KernelResult<String> {
        match self.current().clone() {
            Token::Ident(name) => {
                self.advance();
                Ok(name)
            }
            other => Err(self.error(format!("expected identifier, got '{}'", other))),
        }
    }

    fn error(&self, msg: impl Into<String>) -> KernelError {
        KernelError::syntax(self.location(), msg)
    }

    /// Parse a complete module (one or more function definitions)
    pub fn parse_module(&mut self) -> KernelResult<Module> {
        let mut functions = Vec::new();

        while !self.check(&Token::Eof) {
            if self.eat(&Token::Newline(0)) {
                continue;
            }
            if !self.check(&Token::Def) {
                return Err(self.error(format!(
                    "only function definitions are allowed at top level, got '{}'",
                    self.current()
                )));
            }
            functions.push(self.parse_function()?);
        }

        Ok(Module { functions })
    }

    /// Parse a source text that must contain exactly one function
    pub fn parse_single_function(&mut self) -> KernelResult<FunctionDef> {
        let location = self.location();
        let mut module = self.parse_module()?;
        match module.functions.len() {
            1 => Ok(module.functions.remove(0)),
            0 => Err(KernelError::syntax(location, "no function definition found")),
            n => Err(KernelError::syntax(
                module.functions[1].location,
                format!("expected a single kernel function, found {}", n),
            )),
        }
    }

    /// Parse `def name(params) [-> type]: block`
    fn parse_function(&mut self) -> KernelResult<FunctionDef> {
        let location = self.location();
        self.expect(Token::Def)?;
        let name = self.expect_ident()?;
        self.expect(Token::LParen)?;

        let mut params = Vec::new();
        while !self.check(&Token::RParen) {
            let param_location = self.location();
            let param_name = self.expect_ident()?;
            let annotation = if self.eat(&Token::Colon) {
                Some(self.parse_type()?)
            } else {
                None
            };
            if self.check(&Token::Equals) {
                return Err(self.error("default parameter values are not supported"));
            }
            params.push(Param {
                name: param_name,
                annotation,
                location: param_location,
            });
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.expect(Token::RParen)?;

        let returns = if self.eat(&Token::Arrow) {
            Some(self.parse_type()?)
        } else {
            None
        };
        self.expect(Token::Colon)?;
        let body = self.parse_block()?;

        Ok(FunctionDef {
            name,
            params,
            returns,
            body,
            location,
        })
    }

    /// Parse a type annotation: `int`, `pk.View1D[pk.int32]`
    fn parse_type(&mut self) -> KernelResult<TypeExpr> {
        let mut name = match self.current().clone() {
            Token::Ident(name) => {
                self.advance();
                name
            }
            Token::NoneLit => {
                self.advance();
                "None".to_string()
            }
            other => return Err(self.error(format!("expected type, got '{}'", other))),
        };
        while self.eat(&Token::Dot) {
            name = format!("{}.{}", name, self.expect_ident()?);
        }

        if self.eat(&Token::LBracket) {
            let mut args = vec![self.parse_type()?];
            while self.eat(&Token::Comma) {
                args.push(self.parse_type()?);
            }
            self.expect(Token::RBracket)?;
            Ok(TypeExpr::Generic { name, args })
        } else {
            Ok(TypeExpr::Name(name))
        }
    }

    /// Parse an indented block or a single-line body
    fn parse_block(&mut self) -> KernelResult<Vec<Stmt>> {
        if !self.check(&Token::Newline(0)) {
            return self.parse_simple_statements();
        }
        self.advance();
        self.expect(Token::Indent)?;

        let mut body = Vec::new();
        while !self.check(&Token::Dedent) && !self.check(&Token::Eof) {
            body.extend(self.parse_statement()?);
        }
        self.expect(Token::Dedent)?;
        Ok(body)
    }

    /// Parse a single statement (a simple line may hold several)
    fn parse_statement(&mut self) -> KernelResult<Vec<Stmt>> {
        let location = self.location();
        let kind = match self.current() {
            Token::If => {
                self.advance();
                self.parse_if_rest()?
            }
            Token::While => {
                self.advance();
                let cond = self.parse_expr()?;
                self.expect(Token::Colon)?;
                let body = self.parse_block()?;
                StmtKind::While { cond, body }
            }
            Token::For => {
                self.advance();
                let var = self.expect_ident()?;
                self.expect(Token::In)?;
                let iter = self.parse_expr()?;
                self.expect(Token::Colon)?;
                let body = self.parse_block()?;
                StmtKind::For { var, iter, body }
            }
            Token::Def => StmtKind::FunctionDef(self.parse_function()?),
            _ => return self.parse_simple_statements(),
        };
        Ok(vec![Stmt { kind, location }])
    }

    /// Parse the remainder of an `if`/`elif` after its keyword
    fn parse_if_rest(&mut self) -> KernelResult<StmtKind> {
        let cond = self.parse_expr()?;
        self.expect(Token::Colon)?;
        let then = self.parse_block()?;

        let orelse = if self.check(&Token::Elif) {
            let location = self.location();
            self.advance();
            let kind = self.parse_if_rest()?;
            vec![Stmt { kind, location }]
        } else if self.eat(&Token::Else) {
            self.expect(Token::Colon)?;
            self.parse_block()?
        } else {
            Vec::new()
        };

        Ok(StmtKind::If { cond, then, orelse })
    }

    /// Parse `small (';' small)* NEWLINE`
    fn parse_simple_statements(&mut self) -> KernelResult<Vec<Stmt>> {
        let mut stmts = vec![self.parse_small_statement()?];
        while self.eat(&Token::Semicolon) {
            if self.check(&Token::Newline(0)) {
                break;
            }
            stmts.push(self.parse_small_statement()?);
        }
        if !self.eat(&Token::Newline(0)) && !self.check(&Token::Eof) {
            return Err(self.error(format!("expected end of line, got '{}'", self.current())));
        }
        Ok(stmts)
    }

    fn parse_small_statement(&mut self) -> KernelResult<Stmt> {
        let location = self.location();
        let kind = match self.current() {
            Token::Pass => {
                self.advance();
                StmtKind::Pass
            }
            Token::Break => {
                self.advance();
                StmtKind::Break
            }
            Token::Continue => {
                self.advance();
                StmtKind::Continue
            }
            Token::Return => {
                self.advance();
                if self.check(&Token::Newline(0)) || self.check(&Token::Semicolon) || self.check(&Token::Eof) {
                    StmtKind::Return(None)
                } else {
                    StmtKind::Return(Some(self.parse_expr()?))
                }
            }
            Token::Nonlocal => {
                self.advance();
                let mut names = vec![self.expect_ident()?];
                while self.eat(&Token::Comma) {
                    names.push(self.expect_ident()?);
                }
                StmtKind::Nonlocal(names)
            }
            _ => self.parse_expression_statement()?,
        };
        Ok(Stmt { kind, location })
    }

    /// Parse assignments, annotated declarations and expression statements
    fn parse_expression_statement(&mut self) -> KernelResult<StmtKind> {
        let target = self.parse_expr()?;

        if self.eat(&Token::Colon) {
            let annotation = self.parse_type()?;
            let value = if self.eat(&Token::Equals) {
                Some(self.parse_expr()?)
            } else {
                None
            };
            return Ok(StmtKind::Assign {
                target,
                annotation: Some(annotation),
                value,
            });
        }

        if self.eat(&Token::Equals) {
            let value = self.parse_expr()?;
            if self.check(&Token::Equals) {
                return Err(self.error("chained assignment is not supported"));
            }
            return Ok(StmtKind::Assign {
                target,
                annotation: None,
                value: Some(value),
            });
        }

        let aug = match self.current() {
            Token::PlusEq => Some(BinOp::Add),
            Token::MinusEq => Some(BinOp::Sub),
            Token::StarEq => Some(BinOp::Mul),
            Token::SlashEq => Some(BinOp::Div),
            Token::DoubleSlashEq => Some(BinOp::FloorDiv),
            Token::PercentEq => Some(BinOp::Mod),
            _ => None,
        };
        if let Some(op) = aug {
            self.advance();
            let value = self.parse_expr()?;
            return Ok(StmtKind::AugAssign { target, op, value });
        }

        Ok(StmtKind::Expr(target))
    }

    /// Parse an expression (handles operator precedence)
    pub fn parse_expr(&mut self) -> KernelResult<Expr> {
        self.parse_or()
    }

    fn binary(op: BinOp, lhs: Expr, rhs: Expr) -> Expr {
        let location = lhs.location;
        Expr::new(
            ExprKind::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            },
            location,
        )
    }

    fn parse_or(&mut self) -> KernelResult<Expr> {
        let mut left = self.parse_and()?;
        while self.eat(&Token::Or) {
            let right = self.parse_and()?;
            left = Self::binary(BinOp::Or, left, right);
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> KernelResult<Expr> {
        let mut left = self.parse_not()?;
        while self.eat(&Token::And) {
            let right = self.parse_not()?;
            left = Self::binary(BinOp::And, left, right);
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> KernelResult<Expr> {
        let location = self.location();
        if self.eat(&Token::Not) {
            let operand = self.parse_not()?;
            return Ok(Expr::new(
                ExprKind::Unary {
                    op: UnaryOp::Not,
                    operand: Box::new(operand),
                },
                location,
            ));
        }
        self.parse_comparison()
    }

    fn comparison_op(&self) -> Option<BinOp> {
        match self.current() {
            Token::EqEq => Some(BinOp::Eq),
            Token::NotEq => Some(BinOp::Ne),
            Token::Lt => Some(BinOp::Lt),
            Token::Le => Some(BinOp::Le),
            Token::Gt => Some(BinOp::Gt),
            Token::Ge => Some(BinOp::Ge),
            _ => None,
        }
    }

    fn parse_comparison(&mut self) -> KernelResult<Expr> {
        let left = self.parse_bit_or()?;
        if let Some(op) = self.comparison_op() {
            self.advance();
            let right = self.parse_bit_or()?;
            if self.comparison_op().is_some() {
                return Err(self.error("chained comparisons are not supported"));
            }
            return Ok(Self::binary(op, left, right));
        }
        Ok(left)
    }

    fn parse_bit_or(&mut self) -> KernelResult<Expr> {
        let mut left = self.parse_bit_xor()?;
        while self.eat(&Token::Pipe) {
            let right = self.parse_bit_xor()?;
            left = Self::binary(BinOp::BitOr, left, right);
        }
        Ok(left)
    }

    fn parse_bit_xor(&mut self) -> KernelResult<Expr> {
        let mut left = self.parse_bit_and()?;
        while self.eat(&Token::Caret) {
            let right = self.parse_bit_and()?;
            left = Self::binary(BinOp::BitXor, left, right);
        }
        Ok(left)
    }

    fn parse_bit_and(&mut self) -> KernelResult<Expr> {
        let mut left = self.parse_shift()?;
        while self.eat(&Token::Amp) {
            let right = self.parse_shift()?;
            left = Self::binary(BinOp::BitAnd, left, right);
        }
        Ok(left)
    }

    fn parse_shift(&mut self) -> KernelResult<Expr> {
        let mut left = self.parse_additive()?;
        loop {
            let op = match self.current() {
                Token::Shl => BinOp::Shl,
                Token::Shr => BinOp::Shr,
                _ => break,
            };
            self.advance();
            let right = self.parse_additive()?;
            left = Self::binary(op, left, right);
        }
        Ok(left)
    }

    /// Parse additive expressions: a + b, a - b
    fn parse_additive(&mut self) -> KernelResult<Expr> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.current() {
                Token::Plus => BinOp::Add,
                Token::Minus => BinOp::Sub,
                _ => break,
            };
            self.advance();
            let right = self.parse_multiplicative()?;
            left = Self::binary(op, left, right);
        }
        Ok(left)
    }

    /// Parse multiplicative expressions: a * b, a / b, a // b, a % b
    fn parse_multiplicative(&mut self) -> KernelResult<Expr> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.current() {
                Token::Star => BinOp::Mul,
                Token::Slash => BinOp::Div,
                Token::DoubleSlash => BinOp::FloorDiv,
                Token::Percent => BinOp::Mod,
                _ => break,
            };
            self.advance();
            let right = self.parse_unary()?;
            left = Self::binary(op, left, right);
        }
        Ok(left)
    }

    /// Parse unary expressions: -a, +a, ~a
    fn parse_unary(&mut self) -> KernelResult<Expr> {
        let location = self.location();
        let op = match self.current() {
            Token::Minus => UnaryOp::Neg,
            Token::Plus => UnaryOp::Pos,
            Token::Tilde => UnaryOp::Invert,
            _ => return self.parse_power(),
        };
        self.advance();
        let operand = self.parse_unary()?;

        // Fold negative literals so `-1` stays a literal
        let kind = match (op, operand.kind) {
            (UnaryOp::Neg, ExprKind::Int(n)) => ExprKind::Int(-n),
            (UnaryOp::Neg, ExprKind::Float(n)) => ExprKind::Float(-n),
            (op, kind) => ExprKind::Unary {
                op,
                operand: Box::new(Expr::new(kind, operand.location)),
            },
        };
        Ok(Expr::new(kind, location))
    }

    /// Parse `postfix ('**' unary)?`, right associative
    fn parse_power(&mut self) -> KernelResult<Expr> {
        let base = self.parse_postfix()?;
        if self.eat(&Token::DoubleStar) {
            let exponent = self.parse_unary()?;
            return Ok(Self::binary(BinOp::Pow, base, exponent));
        }
        Ok(base)
    }

    /// Parse postfix expressions: a.attr, a(args), a[i, j]
    fn parse_postfix(&mut self) -> KernelResult<Expr> {
        let mut expr = self.parse_primary()?;

        loop {
            let location = expr.location;
            if self.eat(&Token::Dot) {
                let attr = self.expect_ident()?;
                expr = Expr::new(
                    ExprKind::Attribute {
                        value: Box::new(expr),
                        attr,
                    },
                    location,
                );
            } else if self.check(&Token::LParen) {
                let (args, keywords) = self.parse_args()?;
                expr = Expr::new(
                    ExprKind::Call {
                        func: Box::new(expr),
                        args,
                        keywords,
                    },
                    location,
                );
            } else if self.eat(&Token::LBracket) {
                let mut indices = vec![self.parse_expr()?];
                while self.eat(&Token::Comma) {
                    if self.check(&Token::RBracket) {
                        break;
                    }
                    indices.push(self.parse_expr()?);
                }
                self.expect(Token::RBracket)?;
                expr = Expr::new(
                    ExprKind::Subscript {
                        value: Box::new(expr),
                        indices,
                    },
                    location,
                );
            } else {
                break;
            }
        }

        Ok(expr)
    }

    /// Parse primary expressions: literals, names, parenthesized expressions and tuples
    fn parse_primary(&mut self) -> KernelResult<Expr> {
        let location = self.location();
        let kind = match self.current().clone() {
            Token::Int(n) => {
                self.advance();
                ExprKind::Int(n)
            }
            Token::Float(n) => {
                self.advance();
                ExprKind::Float(n)
            }
            Token::Str(s) => {
                self.advance();
                ExprKind::Str(s)
            }
            Token::True => {
                self.advance();
                ExprKind::Bool(true)
            }
            Token::False => {
                self.advance();
                ExprKind::Bool(false)
            }
            Token::NoneLit => {
                self.advance();
                ExprKind::NoneLit
            }
            Token::Ident(name) => {
                self.advance();
                ExprKind::Name(name)
            }
            Token::LParen => {
                self.advance();
                let first = self.parse_expr()?;

                if self.check(&Token::Comma) {
                    let mut elements = vec![first];
                    while self.eat(&Token::Comma) {
                        if self.check(&Token::RParen) {
                            break; // Trailing comma
                        }
                        elements.push(self.parse_expr()?);
                    }
                    self.expect(Token::RParen)?;
                    ExprKind::Tuple(elements)
                } else {
                    self.expect(Token::RParen)?;
                    return Ok(first);
                }
            }
            Token::Eof => return Err(self.error("unexpected end of input")),
            other => return Err(self.error(format!("unexpected token '{}'", other))),
        };
        Ok(Expr::new(kind, location))
    }

    /// Parse call arguments: (arg1, name=arg2, ...)
    fn parse_args(&mut self) -> KernelResult<(Vec<Expr>, Vec<(String, Expr)>)> {
        self.expect(Token::LParen)?;

        let mut args = Vec::new();
        let mut keywords = Vec::new();
        while !self.check(&Token::RParen) {
            let is_keyword = matches!(self.current(), Token::Ident(_))
                && matches!(
                    self.tokens.get(self.pos + 1).map(|s| &s.token),
                    Some(Token::Equals)
                );
            if is_keyword {
                let name = self.expect_ident()?;
                self.expect(Token::Equals)?;
                keywords.push((name, self.parse_expr()?));
            } else {
                if !keywords.is_empty() {
                    return Err(self.error("positional argument follows keyword argument"));
                }
                args.push(self.parse_expr()?);
            }
            if !self.eat(&Token::Comma) {
                break;
            }
        }

        self.expect(Token::RParen)?;
        Ok((args, keywords))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(source: &str) -> FunctionDef {
        Parser::new(source).unwrap().parse_single_function().unwrap()
    }

    #[test]
    fn test_parse_signature() {
        let f = parse("def add(i: int, a: View1D[float64], b):\n    b[i] = a[i] + 1\n");
        assert_eq!(f.name, "add");
        assert_eq!(f.params.len(), 3);
        assert_eq!(f.params[0].annotation, Some(TypeExpr::Name("int".to_string())));
        assert_eq!(
            f.params[1].annotation,
            Some(TypeExpr::Generic {
                name: "View1D".to_string(),
                args: vec![TypeExpr::Name("float64".to_string())],
            })
        );
        assert_eq!(f.params[2].annotation, None);
        assert_eq!(f.body.len(), 1);
    }

    #[test]
    fn test_parse_annotated_assignment() {
        let f = parse("def k(i: int):\n    x: float = 2.5 * i\n    x += 1\n");
        match &f.body[0].kind {
            StmtKind::Assign { target, annotation, value } => {
                assert_eq!(target.as_name(), Some("x"));
                assert_eq!(annotation.as_ref().map(|t| t.base_name()), Some("float"));
                assert!(matches!(
                    value.as_ref().map(|v| &v.kind),
                    Some(ExprKind::Binary { op: BinOp::Mul, .. })
                ));
            }
            other => panic!("Expected Assign, got {:?}", other),
        }
        assert!(matches!(f.body[1].kind, StmtKind::AugAssign { op: BinOp::Add, .. }));
    }

    #[test]
    fn test_parse_precedence() {
        let mut parser = Parser::new("-a ** 2 + b * c < d and not e").unwrap();
        let expr = parser.parse_expr().unwrap();
        let ExprKind::Binary { op: BinOp::And, lhs, rhs } = expr.kind else {
            panic!("Expected And");
        };
        assert!(matches!(rhs.kind, ExprKind::Unary { op: UnaryOp::Not, .. }));
        let ExprKind::Binary { op: BinOp::Lt, lhs: sum, .. } = lhs.kind else {
            panic!("Expected comparison");
        };
        let ExprKind::Binary { op: BinOp::Add, lhs: neg, .. } = sum.kind else {
            panic!("Expected Add");
        };
        // Power binds tighter than unary minus
        let ExprKind::Unary { op: UnaryOp::Neg, operand } = neg.kind else {
            panic!("Expected Neg");
        };
        assert!(matches!(operand.kind, ExprKind::Binary { op: BinOp::Pow, .. }));
    }

    #[test]
    fn test_parse_nested_function_and_control_flow() {
        let source = r#"
def team_kernel(team_member: TeamMember, acc: Acc[float64], x: View2D[float64], M: int):
    e: int = team_member.league_rank()

    def inner(i: int, lane_acc: Acc[float64]):
        lane_acc += x[e][i]

    total: float = parallel_reduce(ThreadVectorRange(team_member, M), inner)
    if team_member.team_rank() == 0:
        acc += total
    elif M > 3:
        pass
    else:
        return
"#;
        let f = parse(source);
        assert_eq!(f.body.len(), 4);
        assert!(matches!(&f.body[1].kind, StmtKind::FunctionDef(inner) if inner.name == "inner"));
        match &f.body[3].kind {
            StmtKind::If { orelse, .. } => {
                assert_eq!(orelse.len(), 1);
                assert!(matches!(&orelse[0].kind, StmtKind::If { orelse, .. } if orelse.len() == 1));
            }
            other => panic!("Expected If, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_for_and_keywords() {
        let f = parse("def k(i: int, v):\n    for j in range(0, 10, 2):\n        v[i, j] = foo(j, scale=2)\n");
        match &f.body[0].kind {
            StmtKind::For { var, body, .. } => {
                assert_eq!(var, "j");
                match &body[0].kind {
                    StmtKind::Assign { target, value: Some(value), .. } => {
                        assert!(matches!(&target.kind, ExprKind::Subscript { indices, .. } if indices.len() == 2));
                        assert!(matches!(&value.kind, ExprKind::Call { keywords, .. } if keywords.len() == 1));
                    }
                    other => panic!("Expected Assign, got {:?}", other),
                }
            }
            other => panic!("Expected For, got {:?}", other),
        }
    }

    #[test]
    fn test_chained_comparison_rejected() {
        let err = Parser::new("def k(i):\n    x = 1 < i < 3\n")
            .unwrap()
            .parse_single_function()
            .unwrap_err();
        assert_eq!(err.location().map(|l| l.line), Some(2));
    }

    #[test]
    fn test_missing_colon_reports_location() {
        let err = Parser::new("def k(i)\n    pass\n")
            .unwrap()
            .parse_single_function()
            .unwrap_err();
        assert_eq!(err.location().map(|l| l.line), Some(1));
    }

    #[test]
    fn test_multiple_functions() {
        let module = Parser::new("def a(i):\n    pass\n\ndef b(i):\n    pass\n")
            .unwrap()
            .parse_module()
            .unwrap();
        assert_eq!(module.functions.len(), 2);
        assert!(Parser::new("def a(i):\n    pass\n\ndef b(i):\n    pass\n")
            .unwrap()
            .parse_single_function()
            .is_err());
    }
}
