//! Recursive-descent parser with error recovery.
//!
//! `parse` never fails: syntax errors are recorded as diagnostics, an
//! `Expr::Error` placeholder takes the malformed region's place, and the
//! parser resynchronizes at `;`, `}`, `)`, `]`, `in` or end of input.
//! The static binder runs as the final step, so every `Var` in the
//! returned AST carries its `level`/`displ`/`from_with` resolution.

use nixd_core::{
    Apply, Assert, Ast, AttrName, Attrs, BinOp, BinaryOp, Binding, Expr, ExprId, Formal, Formals,
    HasAttr, If, Lambda, Let, List, NixdError, PosIdx, PosTable, Select, Sym, SymbolTable,
    UnOp, UnaryOp, Var, With,
};

use crate::binder;
use crate::lexer::{tokenize, SpannedToken, Token};

pub struct ParseResult {
    pub ast: Ast,
    pub errors: Vec<NixdError>,
}

pub fn parse(source: &str) -> ParseResult {
    let (tokens, lex_errors) = tokenize(source);
    let mut p = Parser {
        tokens,
        pos: 0,
        exprs: Vec::new(),
        symbols: SymbolTable::new(),
        positions: PosTable::new(),
        errors: lex_errors,
    };

    let root = if p.peek().is_none() {
        let pos = p.cur_pos();
        p.error_at("empty document", pos);
        p.error_node(PosIdx::NONE)
    } else {
        let root = p.parse_expr();
        if let Some(tok) = p.peek() {
            let msg = format!("unexpected `{}` after expression", tok.display());
            let pos = p.cur_pos();
            p.error_at(msg, pos);
        }
        root
    };

    let mut ast = Ast::new(p.exprs, root, p.symbols, p.positions);
    let mut errors = p.errors;
    binder::bind(&mut ast, &mut errors);
    ParseResult { ast, errors }
}

struct Parser {
    tokens: Vec<SpannedToken>,
    pos: usize,
    exprs: Vec<Expr>,
    symbols: SymbolTable,
    positions: PosTable,
    errors: Vec<NixdError>,
}

impl Parser {
    // ── Token plumbing ───────────────────────────────────────────

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|t| &t.token)
    }

    fn peek_at(&self, n: usize) -> Option<&Token> {
        self.tokens.get(self.pos + n).map(|t| &t.token)
    }

    fn advance(&mut self) -> Option<SpannedToken> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    /// Position of the current token, interned. Falls back to the last
    /// token's position at end of input.
    fn cur_pos(&mut self) -> PosIdx {
        let lc = self
            .tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|t| (t.line, t.col));
        match lc {
            Some((line, col)) => self.positions.add(line, col),
            None => PosIdx::NONE,
        }
    }

    fn expect(&mut self, expected: &Token) -> bool {
        match self.peek() {
            Some(t) if t == expected => {
                self.advance();
                true
            }
            Some(t) => {
                let msg = format!("expected `{}`, got `{}`", expected.display(), t.display());
                let pos = self.cur_pos();
                self.error_at(msg, pos);
                false
            }
            None => {
                let msg = format!("expected `{}`, got end of input", expected.display());
                let pos = self.cur_pos();
                self.error_at(msg, pos);
                false
            }
        }
    }

    // ── Arena / diagnostics ──────────────────────────────────────

    fn add(&mut self, expr: Expr) -> ExprId {
        let id = ExprId(self.exprs.len() as u32);
        self.exprs.push(expr);
        id
    }

    fn error_node(&mut self, pos: PosIdx) -> ExprId {
        self.add(Expr::Error(pos))
    }

    fn error_at(&mut self, message: impl Into<String>, pos: PosIdx) {
        let pos = self.positions.get(pos);
        self.errors.push(NixdError::parse(message, pos));
    }

    /// Skip tokens until one of `stops` (not consumed) or end of input.
    fn sync(&mut self, stops: &[Token]) {
        while let Some(tok) = self.peek() {
            if stops.contains(tok) {
                return;
            }
            self.advance();
        }
    }

    /// Deep-copy a subtree. Used when desugaring duplicates a shared
    /// expression (`inherit (e) a b;` needs one `e` per bound name).
    fn clone_subtree(&mut self, id: ExprId) -> ExprId {
        let expr = self.exprs[id.0 as usize].clone();
        let copied = match expr {
            Expr::Var(v) => Expr::Var(v),
            Expr::Int(..)
            | Expr::Float(..)
            | Expr::Str(..)
            | Expr::Path(..)
            | Expr::Error(..) => expr,
            Expr::List(l) => {
                let items = l.items.iter().map(|&i| self.clone_subtree(i)).collect();
                Expr::List(List { items, pos: l.pos })
            }
            Expr::Attrs(a) => {
                let bindings = a
                    .bindings
                    .iter()
                    .map(|b| Binding {
                        name: b.name,
                        name_pos: b.name_pos,
                        value: self.clone_subtree(b.value),
                        inherited: b.inherited,
                    })
                    .collect();
                Expr::Attrs(Attrs {
                    rec: a.rec,
                    bindings,
                    pos: a.pos,
                })
            }
            Expr::Let(l) => {
                let bindings = l
                    .bindings
                    .iter()
                    .map(|b| Binding {
                        name: b.name,
                        name_pos: b.name_pos,
                        value: self.clone_subtree(b.value),
                        inherited: b.inherited,
                    })
                    .collect();
                let body = self.clone_subtree(l.body);
                Expr::Let(Let {
                    bindings,
                    body,
                    pos: l.pos,
                })
            }
            Expr::With(w) => {
                let env = self.clone_subtree(w.env);
                let body = self.clone_subtree(w.body);
                Expr::With(With {
                    env,
                    body,
                    pos: w.pos,
                })
            }
            Expr::Lambda(l) => {
                let formals = l.formals.map(|f| Formals {
                    formals: f
                        .formals
                        .iter()
                        .map(|fm| Formal {
                            name: fm.name,
                            pos: fm.pos,
                            default: fm.default.map(|d| self.clone_subtree(d)),
                        })
                        .collect(),
                    ellipsis: f.ellipsis,
                });
                let body = self.clone_subtree(l.body);
                Expr::Lambda(Lambda {
                    arg: l.arg,
                    formals,
                    body,
                    pos: l.pos,
                })
            }
            Expr::Apply(a) => {
                let func = self.clone_subtree(a.func);
                let arg = self.clone_subtree(a.arg);
                Expr::Apply(Apply {
                    func,
                    arg,
                    pos: a.pos,
                })
            }
            Expr::Select(s) => {
                let subject = self.clone_subtree(s.subject);
                let or_default = s.or_default.map(|d| self.clone_subtree(d));
                Expr::Select(Select {
                    subject,
                    path: s.path,
                    or_default,
                    pos: s.pos,
                })
            }
            Expr::HasAttr(h) => {
                let subject = self.clone_subtree(h.subject);
                Expr::HasAttr(HasAttr {
                    subject,
                    path: h.path,
                    pos: h.pos,
                })
            }
            Expr::If(i) => {
                let cond = self.clone_subtree(i.cond);
                let then = self.clone_subtree(i.then);
                let else_ = self.clone_subtree(i.else_);
                Expr::If(If {
                    cond,
                    then,
                    else_,
                    pos: i.pos,
                })
            }
            Expr::Assert(a) => {
                let cond = self.clone_subtree(a.cond);
                let body = self.clone_subtree(a.body);
                Expr::Assert(Assert {
                    cond,
                    body,
                    pos: a.pos,
                })
            }
            Expr::UnaryOp(u) => {
                let operand = self.clone_subtree(u.operand);
                Expr::UnaryOp(UnaryOp {
                    op: u.op,
                    operand,
                    pos: u.pos,
                })
            }
            Expr::BinaryOp(b) => {
                let lhs = self.clone_subtree(b.lhs);
                let rhs = self.clone_subtree(b.rhs);
                Expr::BinaryOp(BinaryOp {
                    op: b.op,
                    lhs,
                    rhs,
                    pos: b.pos,
                })
            }
        };
        self.add(copied)
    }

    // ── Expression grammar ───────────────────────────────────────

    fn parse_expr(&mut self) -> ExprId {
        match self.peek() {
            Some(Token::Let) => self.parse_let(),
            Some(Token::With) => self.parse_with(),
            Some(Token::If) => self.parse_if(),
            Some(Token::Assert) => self.parse_assert(),
            _ if self.lambda_ahead() => self.parse_lambda(),
            _ => self.parse_op_impl(),
        }
    }

    /// Lookahead: does a lambda start here?
    /// `x: …`, `x@{…}: …`, `{…}: …`, `{…}@x: …`
    fn lambda_ahead(&self) -> bool {
        match self.peek() {
            Some(Token::Ident(_)) => matches!(self.peek_at(1), Some(Token::Colon | Token::At)),
            Some(Token::LBrace) => {
                // Scan to the matching brace, then check for `:` or `@x:`.
                let mut depth = 0usize;
                let mut i = self.pos;
                while let Some(t) = self.tokens.get(i) {
                    match t.token {
                        Token::LBrace => depth += 1,
                        Token::RBrace => {
                            depth -= 1;
                            if depth == 0 {
                                return match self.tokens.get(i + 1).map(|t| &t.token) {
                                    Some(Token::Colon) => true,
                                    Some(Token::At) => matches!(
                                        self.tokens.get(i + 3).map(|t| &t.token),
                                        Some(Token::Colon)
                                    ),
                                    _ => false,
                                };
                            }
                        }
                        _ => {}
                    }
                    i += 1;
                }
                false
            }
            _ => false,
        }
    }

    fn parse_let(&mut self) -> ExprId {
        let pos = self.cur_pos();
        self.advance(); // `let`
        let bindings = self.parse_bindings(&Token::In);
        self.expect(&Token::In);
        let body = if self.peek().is_some() {
            self.parse_expr()
        } else {
            let p = self.cur_pos();
            self.error_node(p)
        };
        self.add(Expr::Let(Let {
            bindings,
            body,
            pos,
        }))
    }

    fn parse_with(&mut self) -> ExprId {
        let pos = self.cur_pos();
        self.advance(); // `with`
        let env = self.parse_op_impl();
        self.expect(&Token::Semi);
        let body = if self.peek().is_some() {
            self.parse_expr()
        } else {
            let p = self.cur_pos();
            self.error_at("expected expression after `with`", p);
            self.error_node(p)
        };
        self.add(Expr::With(With { env, body, pos }))
    }

    fn parse_if(&mut self) -> ExprId {
        let pos = self.cur_pos();
        self.advance(); // `if`
        let cond = self.parse_expr();
        self.expect(&Token::Then);
        let then = self.parse_expr();
        self.expect(&Token::Else);
        let else_ = self.parse_expr();
        self.add(Expr::If(If {
            cond,
            then,
            else_,
            pos,
        }))
    }

    fn parse_assert(&mut self) -> ExprId {
        let pos = self.cur_pos();
        self.advance(); // `assert`
        let cond = self.parse_expr();
        self.expect(&Token::Semi);
        let body = self.parse_expr();
        self.add(Expr::Assert(Assert { cond, body, pos }))
    }

    fn parse_lambda(&mut self) -> ExprId {
        let pos = self.cur_pos();
        let (arg, formals) = match self.peek() {
            Some(Token::Ident(_)) => {
                let tok = self.advance().unwrap();
                let name = match tok.token {
                    Token::Ident(s) => self.symbols.intern(&s),
                    _ => unreachable!(),
                };
                let name_pos = self.positions.add(tok.line, tok.col);
                if self.peek() == Some(&Token::At) {
                    self.advance();
                    let formals = self.parse_formals();
                    (Some((name, name_pos)), Some(formals))
                } else {
                    (Some((name, name_pos)), None)
                }
            }
            Some(Token::LBrace) => {
                let formals = self.parse_formals();
                if self.peek() == Some(&Token::At) {
                    self.advance();
                    match self.advance() {
                        Some(SpannedToken {
                            token: Token::Ident(s),
                            line,
                            col,
                        }) => {
                            let name = self.symbols.intern(&s);
                            let name_pos = self.positions.add(line, col);
                            (Some((name, name_pos)), Some(formals))
                        }
                        _ => {
                            let p = self.cur_pos();
                            self.error_at("expected identifier after `@`", p);
                            (None, Some(formals))
                        }
                    }
                } else {
                    (None, Some(formals))
                }
            }
            _ => {
                let p = self.cur_pos();
                self.error_at("expected lambda parameter", p);
                (None, None)
            }
        };
        self.expect(&Token::Colon);
        let body = if self.peek().is_some() {
            self.parse_expr()
        } else {
            let p = self.cur_pos();
            self.error_at("expected lambda body", p);
            self.error_node(p)
        };
        self.add(Expr::Lambda(Lambda {
            arg,
            formals,
            body,
            pos,
        }))
    }

    fn parse_formals(&mut self) -> Formals {
        self.expect(&Token::LBrace);
        let mut formals = Vec::new();
        let mut ellipsis = false;
        loop {
            match self.peek() {
                Some(Token::RBrace) => {
                    self.advance();
                    break;
                }
                Some(Token::Ellipsis) => {
                    self.advance();
                    ellipsis = true;
                }
                Some(Token::Ident(_)) => {
                    let tok = self.advance().unwrap();
                    let name = match tok.token {
                        Token::Ident(s) => self.symbols.intern(&s),
                        _ => unreachable!(),
                    };
                    let fpos = self.positions.add(tok.line, tok.col);
                    let default = if self.peek() == Some(&Token::Question) {
                        self.advance();
                        Some(self.parse_expr())
                    } else {
                        None
                    };
                    formals.push(Formal {
                        name,
                        pos: fpos,
                        default,
                    });
                }
                Some(Token::Comma) => {
                    self.advance();
                }
                Some(other) => {
                    let msg = format!("unexpected `{}` in formals", other.display());
                    let pos = self.cur_pos();
                    self.error_at(msg, pos);
                    self.sync(&[Token::Comma, Token::RBrace]);
                }
                None => {
                    let pos = self.cur_pos();
                    self.error_at("unterminated formals, expected `}`", pos);
                    break;
                }
            }
        }
        Formals { formals, ellipsis }
    }

    // ── Operators (lowest precedence first) ──────────────────────

    fn parse_op_impl(&mut self) -> ExprId {
        let lhs = self.parse_op_or();
        if self.peek() == Some(&Token::Impl) {
            let pos = self.cur_pos();
            self.advance();
            let rhs = self.parse_op_impl(); // right-assoc
            return self.add(Expr::BinaryOp(BinaryOp {
                op: BinOp::Impl,
                lhs,
                rhs,
                pos,
            }));
        }
        lhs
    }

    fn parse_op_or(&mut self) -> ExprId {
        let mut lhs = self.parse_op_and();
        while self.peek() == Some(&Token::OrOr) {
            let pos = self.cur_pos();
            self.advance();
            let rhs = self.parse_op_and();
            lhs = self.add(Expr::BinaryOp(BinaryOp {
                op: BinOp::Or,
                lhs,
                rhs,
                pos,
            }));
        }
        lhs
    }

    fn parse_op_and(&mut self) -> ExprId {
        let mut lhs = self.parse_op_eq();
        while self.peek() == Some(&Token::AndAnd) {
            let pos = self.cur_pos();
            self.advance();
            let rhs = self.parse_op_eq();
            lhs = self.add(Expr::BinaryOp(BinaryOp {
                op: BinOp::And,
                lhs,
                rhs,
                pos,
            }));
        }
        lhs
    }

    fn parse_op_eq(&mut self) -> ExprId {
        let lhs = self.parse_op_cmp();
        let op = match self.peek() {
            Some(Token::Eq) => BinOp::Eq,
            Some(Token::Ne) => BinOp::Ne,
            _ => return lhs,
        };
        let pos = self.cur_pos();
        self.advance();
        let rhs = self.parse_op_cmp();
        self.add(Expr::BinaryOp(BinaryOp { op, lhs, rhs, pos }))
    }

    fn parse_op_cmp(&mut self) -> ExprId {
        let lhs = self.parse_op_update();
        let op = match self.peek() {
            Some(Token::Lt) => BinOp::Lt,
            Some(Token::Le) => BinOp::Le,
            Some(Token::Gt) => BinOp::Gt,
            Some(Token::Ge) => BinOp::Ge,
            _ => return lhs,
        };
        let pos = self.cur_pos();
        self.advance();
        let rhs = self.parse_op_update();
        self.add(Expr::BinaryOp(BinaryOp { op, lhs, rhs, pos }))
    }

    fn parse_op_update(&mut self) -> ExprId {
        let lhs = self.parse_op_not();
        if self.peek() == Some(&Token::Update) {
            let pos = self.cur_pos();
            self.advance();
            let rhs = self.parse_op_update(); // right-assoc
            return self.add(Expr::BinaryOp(BinaryOp {
                op: BinOp::Update,
                lhs,
                rhs,
                pos,
            }));
        }
        lhs
    }

    fn parse_op_not(&mut self) -> ExprId {
        if self.peek() == Some(&Token::Not) {
            let pos = self.cur_pos();
            self.advance();
            let operand = self.parse_op_not();
            return self.add(Expr::UnaryOp(UnaryOp {
                op: UnOp::Not,
                operand,
                pos,
            }));
        }
        self.parse_op_add()
    }

    fn parse_op_add(&mut self) -> ExprId {
        let mut lhs = self.parse_op_mul();
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => return lhs,
            };
            let pos = self.cur_pos();
            self.advance();
            let rhs = self.parse_op_mul();
            lhs = self.add(Expr::BinaryOp(BinaryOp { op, lhs, rhs, pos }));
        }
    }

    fn parse_op_mul(&mut self) -> ExprId {
        let mut lhs = self.parse_op_concat();
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                _ => return lhs,
            };
            let pos = self.cur_pos();
            self.advance();
            let rhs = self.parse_op_concat();
            lhs = self.add(Expr::BinaryOp(BinaryOp { op, lhs, rhs, pos }));
        }
    }

    fn parse_op_concat(&mut self) -> ExprId {
        let lhs = self.parse_op_has();
        if self.peek() == Some(&Token::Concat) {
            let pos = self.cur_pos();
            self.advance();
            let rhs = self.parse_op_concat(); // right-assoc
            return self.add(Expr::BinaryOp(BinaryOp {
                op: BinOp::Concat,
                lhs,
                rhs,
                pos,
            }));
        }
        lhs
    }

    fn parse_op_has(&mut self) -> ExprId {
        let lhs = self.parse_op_neg();
        if self.peek() == Some(&Token::Question) {
            let pos = self.cur_pos();
            self.advance();
            let path = self.parse_attrpath();
            return self.add(Expr::HasAttr(HasAttr {
                subject: lhs,
                path,
                pos,
            }));
        }
        lhs
    }

    fn parse_op_neg(&mut self) -> ExprId {
        if self.peek() == Some(&Token::Minus) {
            let pos = self.cur_pos();
            self.advance();
            let operand = self.parse_op_neg();
            return self.add(Expr::UnaryOp(UnaryOp {
                op: UnOp::Negate,
                operand,
                pos,
            }));
        }
        self.parse_apply()
    }

    fn parse_apply(&mut self) -> ExprId {
        let mut func = self.parse_select();
        while self.atom_ahead() {
            let pos = self.cur_pos();
            let arg = self.parse_select();
            func = self.add(Expr::Apply(Apply { func, arg, pos }));
        }
        func
    }

    /// Does the current token start an atom (and thus an application
    /// argument)?
    fn atom_ahead(&self) -> bool {
        matches!(
            self.peek(),
            Some(
                Token::Int(_)
                    | Token::Float(_)
                    | Token::Str(_)
                    | Token::Path(_)
                    | Token::Ident(_)
                    | Token::LParen
                    | Token::LBracket
                    | Token::LBrace
                    | Token::Rec
            )
        )
    }

    fn parse_select(&mut self) -> ExprId {
        let subject = self.parse_atom();
        if self.peek() != Some(&Token::Dot) {
            return subject;
        }
        let pos = self.cur_pos();
        self.advance(); // `.`
        let path = self.parse_attrpath();
        let or_default = if self.peek() == Some(&Token::Or) {
            self.advance();
            Some(self.parse_select())
        } else {
            None
        };
        self.add(Expr::Select(Select {
            subject,
            path,
            or_default,
            pos,
        }))
    }

    /// `a.b."c"` — static attribute path segments.
    fn parse_attrpath(&mut self) -> Vec<AttrName> {
        let mut path = Vec::new();
        loop {
            match self.peek() {
                Some(Token::Ident(_)) | Some(Token::Str(_)) => {
                    let tok = self.advance().unwrap();
                    let name = match tok.token {
                        Token::Ident(s) | Token::Str(s) => self.symbols.intern(&s),
                        _ => unreachable!(),
                    };
                    let pos = self.positions.add(tok.line, tok.col);
                    path.push(AttrName { sym: name, pos });
                }
                _ => {
                    let pos = self.cur_pos();
                    self.error_at("expected attribute name", pos);
                    break;
                }
            }
            if self.peek() == Some(&Token::Dot) {
                self.advance();
            } else {
                break;
            }
        }
        path
    }

    fn parse_atom(&mut self) -> ExprId {
        let pos = self.cur_pos();
        match self.peek() {
            Some(Token::Int(_)) => {
                let n = match self.advance().unwrap().token {
                    Token::Int(n) => n,
                    _ => unreachable!(),
                };
                self.add(Expr::Int(n, pos))
            }
            Some(Token::Float(_)) => {
                let x = match self.advance().unwrap().token {
                    Token::Float(x) => x,
                    _ => unreachable!(),
                };
                self.add(Expr::Float(x, pos))
            }
            Some(Token::Str(_)) => {
                let s = match self.advance().unwrap().token {
                    Token::Str(s) => s,
                    _ => unreachable!(),
                };
                self.add(Expr::Str(s, pos))
            }
            Some(Token::Path(_)) => {
                let s = match self.advance().unwrap().token {
                    Token::Path(s) => s,
                    _ => unreachable!(),
                };
                self.add(Expr::Path(s, pos))
            }
            Some(Token::Ident(_)) => {
                let s = match self.advance().unwrap().token {
                    Token::Ident(s) => s,
                    _ => unreachable!(),
                };
                let name = self.symbols.intern(&s);
                self.add(Expr::Var(Var {
                    name,
                    pos,
                    level: 0,
                    displ: 0,
                    from_with: false,
                }))
            }
            Some(Token::LParen) => {
                self.advance();
                let inner = self.parse_expr();
                self.expect(&Token::RParen);
                inner
            }
            Some(Token::LBracket) => {
                self.advance();
                let mut items = Vec::new();
                loop {
                    match self.peek() {
                        Some(Token::RBracket) => {
                            self.advance();
                            break;
                        }
                        None => {
                            let p = self.cur_pos();
                            self.error_at("unterminated list, expected `]`", p);
                            break;
                        }
                        _ if self.atom_ahead() => items.push(self.parse_select()),
                        Some(other) => {
                            let msg = format!("unexpected `{}` in list", other.display());
                            let p = self.cur_pos();
                            self.error_at(msg, p);
                            self.sync(&[Token::RBracket]);
                        }
                    }
                }
                self.add(Expr::List(List { items, pos }))
            }
            Some(Token::Rec) => {
                self.advance();
                if self.peek() == Some(&Token::LBrace) {
                    self.parse_attrs(true, pos)
                } else {
                    self.error_at("expected `{` after `rec`", pos);
                    self.error_node(pos)
                }
            }
            Some(Token::LBrace) => self.parse_attrs(false, pos),
            Some(other) => {
                // Do not consume: the offending token is usually a
                // recovery point (`;`, `}`) a caller syncs on.
                let msg = format!("unexpected `{}`", other.display());
                self.error_at(msg, pos);
                self.error_node(pos)
            }
            None => {
                self.error_at("unexpected end of input", pos);
                self.error_node(pos)
            }
        }
    }

    // ── Bindings (attribute sets and let) ────────────────────────

    fn parse_attrs(&mut self, rec: bool, pos: PosIdx) -> ExprId {
        self.expect(&Token::LBrace);
        let bindings = self.parse_bindings(&Token::RBrace);
        self.expect(&Token::RBrace);
        self.add(Expr::Attrs(Attrs { rec, bindings, pos }))
    }

    /// Parse `name = value;` / `inherit …;` bindings until `close` (or end
    /// of input). Dotted attribute paths are desugared into nested
    /// attribute sets, merging with sets synthesized by earlier bindings.
    fn parse_bindings(&mut self, close: &Token) -> Vec<Binding> {
        let mut builder = BindingBuilder::new();
        loop {
            match self.peek() {
                None => {
                    let msg = format!("expected `{}`, got end of input", close.display());
                    let pos = self.cur_pos();
                    self.error_at(msg, pos);
                    break;
                }
                Some(tok) if tok == close => break,
                Some(Token::Inherit) => {
                    self.advance();
                    self.parse_inherit(&mut builder);
                }
                Some(Token::Ident(_)) | Some(Token::Str(_)) => {
                    let path = self.parse_attrpath();
                    self.expect(&Token::Assign);
                    let value = if self.peek().is_some() && self.peek() != Some(close) {
                        self.parse_expr()
                    } else {
                        let p = self.cur_pos();
                        self.error_at("expected expression in binding", p);
                        self.error_node(p)
                    };
                    self.expect(&Token::Semi);
                    if !path.is_empty() {
                        self.insert_binding(&mut builder, &path, value, false);
                    }
                }
                Some(other) => {
                    let msg = format!("unexpected `{}` in bindings", other.display());
                    let pos = self.cur_pos();
                    self.error_at(msg, pos);
                    self.sync(&[Token::Semi, close.clone()]);
                    if self.peek() == Some(&Token::Semi) {
                        self.advance();
                    }
                }
            }
        }
        self.materialize(builder)
    }

    fn parse_inherit(&mut self, builder: &mut BindingBuilder) {
        let from = if self.peek() == Some(&Token::LParen) {
            self.advance();
            let e = self.parse_expr();
            self.expect(&Token::RParen);
            Some(e)
        } else {
            None
        };

        let mut first = true;
        loop {
            match self.peek() {
                Some(Token::Ident(_)) | Some(Token::Str(_)) => {
                    let tok = self.advance().unwrap();
                    let name = match tok.token {
                        Token::Ident(s) | Token::Str(s) => self.symbols.intern(&s),
                        _ => unreachable!(),
                    };
                    let name_pos = self.positions.add(tok.line, tok.col);
                    let value = match from {
                        Some(subject) => {
                            // Each name gets its own copy of the subject.
                            let subject = if first {
                                subject
                            } else {
                                self.clone_subtree(subject)
                            };
                            self.add(Expr::Select(Select {
                                subject,
                                path: vec![AttrName {
                                    sym: name,
                                    pos: name_pos,
                                }],
                                or_default: None,
                                pos: name_pos,
                            }))
                        }
                        None => self.add(Expr::Var(Var {
                            name,
                            pos: name_pos,
                            level: 0,
                            displ: 0,
                            from_with: false,
                        })),
                    };
                    first = false;
                    self.insert_binding(builder, &[AttrName { sym: name, pos: name_pos }], value, true);
                }
                Some(Token::Semi) => {
                    self.advance();
                    break;
                }
                _ => {
                    let pos = self.cur_pos();
                    self.error_at("expected attribute name in `inherit`", pos);
                    self.sync(&[Token::Semi, Token::RBrace, Token::In]);
                    if self.peek() == Some(&Token::Semi) {
                        self.advance();
                    }
                    break;
                }
            }
        }
    }

    fn insert_binding(
        &mut self,
        builder: &mut BindingBuilder,
        path: &[AttrName],
        value: ExprId,
        inherited: bool,
    ) {
        Self::insert_into(
            &mut self.errors,
            &self.symbols,
            &self.positions,
            &mut builder.nodes,
            path,
            value,
            inherited,
        );
    }

    fn insert_into(
        errors: &mut Vec<NixdError>,
        symbols: &SymbolTable,
        positions: &PosTable,
        nodes: &mut Vec<BindingNode>,
        path: &[AttrName],
        value: ExprId,
        inherited: bool,
    ) {
        let seg = path[0];
        let last = path.len() == 1;
        match nodes.iter().position(|n| n.name == seg.sym) {
            Some(_) if last => {
                let name = symbols.resolve(seg.sym);
                errors.push(NixdError::parse(
                    format!("duplicate attribute `{name}`"),
                    positions.get(seg.pos),
                ));
            }
            Some(at) => match &mut nodes[at].child {
                BindingChild::Nested(children) => {
                    Self::insert_into(errors, symbols, positions, children, &path[1..], value, inherited);
                }
                BindingChild::Leaf { .. } => {
                    let name = symbols.resolve(seg.sym);
                    errors.push(NixdError::parse(
                        format!("attribute `{name}` already defined"),
                        positions.get(seg.pos),
                    ));
                }
            },
            None => {
                let child = if last {
                    BindingChild::Leaf { value, inherited }
                } else {
                    BindingChild::Nested(Vec::new())
                };
                nodes.push(BindingNode {
                    name: seg.sym,
                    name_pos: seg.pos,
                    child,
                });
                if !last {
                    let at = nodes.len() - 1;
                    if let BindingChild::Nested(children) = &mut nodes[at].child {
                        Self::insert_into(
                            errors,
                            symbols,
                            positions,
                            children,
                            &path[1..],
                            value,
                            inherited,
                        );
                    }
                }
            }
        }
    }

    /// Turn the binding trie into source-ordered `Binding`s, synthesizing
    /// non-recursive attribute sets for dotted paths.
    fn materialize(&mut self, builder: BindingBuilder) -> Vec<Binding> {
        self.materialize_nodes(builder.nodes)
    }

    fn materialize_nodes(&mut self, nodes: Vec<BindingNode>) -> Vec<Binding> {
        nodes
            .into_iter()
            .map(|node| match node.child {
                BindingChild::Leaf { value, inherited } => Binding {
                    name: node.name,
                    name_pos: node.name_pos,
                    value,
                    inherited,
                },
                BindingChild::Nested(children) => {
                    let pos = node.name_pos;
                    let bindings = self.materialize_nodes(children);
                    let value = self.add(Expr::Attrs(Attrs {
                        rec: false,
                        bindings,
                        pos,
                    }));
                    Binding {
                        name: node.name,
                        name_pos: node.name_pos,
                        value,
                        inherited: false,
                    }
                }
            })
            .collect()
    }
}

/// Trie used while collecting bindings, so `a.b = 1; a.c = 2;` merges
/// into one synthesized `a` set while preserving source order.
struct BindingBuilder {
    nodes: Vec<BindingNode>,
}

impl BindingBuilder {
    fn new() -> Self {
        BindingBuilder { nodes: Vec::new() }
    }
}

struct BindingNode {
    name: Sym,
    name_pos: PosIdx,
    child: BindingChild,
}

enum BindingChild {
    Leaf { value: ExprId, inherited: bool },
    Nested(Vec<BindingNode>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use nixd_core::Pos;

    fn parse_ok(src: &str) -> Ast {
        let result = parse(src);
        assert!(
            result.errors.is_empty(),
            "unexpected errors for {src:?}: {:?}",
            result.errors
        );
        result.ast
    }

    fn find_pos(ast: &Ast, id: ExprId) -> Pos {
        ast.positions.get(ast.expr(id).pos()).unwrap()
    }

    // ── Basic shapes ─────────────────────────────────────────────

    #[test]
    fn parses_let_in() {
        let ast = parse_ok("let x = 1; in x");
        match ast.expr(ast.root()) {
            Expr::Let(l) => {
                assert_eq!(l.bindings.len(), 1);
                assert_eq!(ast.name(l.bindings[0].name), "x");
                assert!(matches!(ast.expr(l.body), Expr::Var(_)));
            }
            other => panic!("expected Let, got {}", other.kind_name()),
        }
    }

    #[test]
    fn binding_name_position() {
        let ast = parse_ok("let x = 1; in x");
        match ast.expr(ast.root()) {
            Expr::Let(l) => {
                let pos = ast.positions.get(l.bindings[0].name_pos).unwrap();
                assert_eq!((pos.line, pos.col), (1, 5));
            }
            _ => panic!("expected Let"),
        }
    }

    #[test]
    fn parses_rec_attrs() {
        let ast = parse_ok("rec { a = 1; b = a; }");
        match ast.expr(ast.root()) {
            Expr::Attrs(a) => {
                assert!(a.rec);
                assert_eq!(a.bindings.len(), 2);
            }
            _ => panic!("expected Attrs"),
        }
    }

    #[test]
    fn parses_lambda_forms() {
        for src in ["x: x", "{ a, b ? 1 }: a", "{ a, ... }@args: a", "args@{ a }: a"] {
            let ast = parse_ok(src);
            assert!(
                matches!(ast.expr(ast.root()), Expr::Lambda(_)),
                "expected lambda for {src:?}"
            );
        }
    }

    #[test]
    fn lambda_vs_attrset_disambiguation() {
        let ast = parse_ok("{ a = 1; }");
        assert!(matches!(ast.expr(ast.root()), Expr::Attrs(_)));
        let ast = parse_ok("{ a }: a");
        assert!(matches!(ast.expr(ast.root()), Expr::Lambda(_)));
        let ast = parse_ok("{ }: 1");
        assert!(matches!(ast.expr(ast.root()), Expr::Lambda(_)));
        let ast = parse_ok("{ }");
        assert!(matches!(ast.expr(ast.root()), Expr::Attrs(_)));
    }

    #[test]
    fn parses_select_with_or() {
        let ast = parse_ok("{ b = { c = 1; }; }.b.c or 3");
        match ast.expr(ast.root()) {
            Expr::Select(s) => {
                assert_eq!(s.path.len(), 2);
                assert!(s.or_default.is_some());
            }
            other => panic!("expected Select, got {}", other.kind_name()),
        }
    }

    #[test]
    fn application_is_left_associative() {
        let ast = parse_ok("let f = x: y: x; a = 1; b = 2; in f a b");
        let body = match ast.expr(ast.root()) {
            Expr::Let(l) => l.body,
            other => panic!("expected Let, got {}", other.kind_name()),
        };
        match ast.expr(body) {
            Expr::Apply(outer) => match ast.expr(outer.func) {
                Expr::Apply(inner) => {
                    assert!(matches!(ast.expr(inner.func), Expr::Var(_)));
                }
                other => panic!("expected inner Apply, got {}", other.kind_name()),
            },
            other => panic!("expected Apply, got {}", other.kind_name()),
        }
    }

    #[test]
    fn operator_precedence() {
        // `1 + 2 * 3` parses as `1 + (2 * 3)`
        let ast = parse_ok("1 + 2 * 3");
        match ast.expr(ast.root()) {
            Expr::BinaryOp(add) => {
                assert_eq!(add.op, BinOp::Add);
                match ast.expr(add.rhs) {
                    Expr::BinaryOp(mul) => assert_eq!(mul.op, BinOp::Mul),
                    other => panic!("expected Mul on rhs, got {}", other.kind_name()),
                }
            }
            other => panic!("expected BinaryOp, got {}", other.kind_name()),
        }
    }

    #[test]
    fn update_is_right_associative() {
        let ast = parse_ok("let a = { }; b = { }; c = { }; in a // b // c");
        let body = match ast.expr(ast.root()) {
            Expr::Let(l) => l.body,
            _ => panic!("expected Let"),
        };
        match ast.expr(body) {
            Expr::BinaryOp(outer) => {
                assert_eq!(outer.op, BinOp::Update);
                assert!(matches!(ast.expr(outer.lhs), Expr::Var(_)));
                assert!(matches!(ast.expr(outer.rhs), Expr::BinaryOp(_)));
            }
            _ => panic!("expected BinaryOp"),
        }
    }

    #[test]
    fn parses_with_if_assert() {
        let ast = parse_ok("with { hello = 1; }; hello");
        assert!(matches!(ast.expr(ast.root()), Expr::With(_)));
        let ast = parse_ok("if true then 1 else 2");
        assert!(matches!(ast.expr(ast.root()), Expr::If(_)));
        let ast = parse_ok("assert 1 == 1; 2");
        assert!(matches!(ast.expr(ast.root()), Expr::Assert(_)));
    }

    #[test]
    fn dotted_binding_paths_merge() {
        let ast = parse_ok("{ a.b = 1; a.c = 2; }");
        match ast.expr(ast.root()) {
            Expr::Attrs(attrs) => {
                assert_eq!(attrs.bindings.len(), 1);
                assert_eq!(ast.name(attrs.bindings[0].name), "a");
                match ast.expr(attrs.bindings[0].value) {
                    Expr::Attrs(inner) => {
                        let names: Vec<&str> =
                            inner.bindings.iter().map(|b| ast.name(b.name)).collect();
                        assert_eq!(names, vec!["b", "c"]);
                    }
                    _ => panic!("expected synthesized Attrs"),
                }
            }
            _ => panic!("expected Attrs"),
        }
    }

    #[test]
    fn duplicate_attribute_is_reported() {
        let result = parse("{ a = 1; a = 2; }");
        assert!(result
            .errors
            .iter()
            .any(|e| e.to_string().contains("duplicate attribute `a`")));
    }

    #[test]
    fn inherit_desugars_to_bindings() {
        let ast = parse_ok("let q = { a = 1; }; in { inherit (q) a; b = 2; }");
        match ast.expr(ast.root()) {
            Expr::Let(l) => match ast.expr(l.body) {
                Expr::Attrs(attrs) => {
                    assert_eq!(attrs.bindings.len(), 2);
                    assert!(attrs.bindings[0].inherited);
                    assert!(matches!(ast.expr(attrs.bindings[0].value), Expr::Select(_)));
                }
                _ => panic!("expected Attrs body"),
            },
            _ => panic!("expected Let"),
        }
    }

    // ── Recovery ─────────────────────────────────────────────────

    #[test]
    fn truncated_let_recovers_with_error_node() {
        let result = parse("let x = ");
        assert!(!result.errors.is_empty());
        // The AST still exists and contains an Error placeholder.
        let has_error = result
            .ast
            .ids()
            .any(|id| matches!(result.ast.expr(id), Expr::Error(_)));
        assert!(has_error, "expected an Error node in the recovered AST");
        assert!(matches!(result.ast.expr(result.ast.root()), Expr::Let(_)));
    }

    #[test]
    fn garbage_in_bindings_recovers() {
        let result = parse("{ a = 1; ???; b = 2; }");
        assert!(!result.errors.is_empty());
        match result.ast.expr(result.ast.root()) {
            Expr::Attrs(attrs) => {
                let names: Vec<&str> = attrs
                    .bindings
                    .iter()
                    .map(|b| result.ast.name(b.name))
                    .collect();
                assert!(names.contains(&"a"));
                assert!(names.contains(&"b"));
            }
            _ => panic!("expected Attrs"),
        }
    }

    #[test]
    fn empty_document_is_an_error_root() {
        let result = parse("");
        assert!(matches!(
            result.ast.expr(result.ast.root()),
            Expr::Error(_)
        ));
        assert!(!result.errors.is_empty());
    }

    #[test]
    fn positions_point_at_tokens() {
        let ast = parse_ok("let x = 1; in x");
        // The trailing `x` variable sits at column 15.
        let var = ast
            .ids()
            .find(|&id| {
                matches!(ast.expr(id), Expr::Var(v) if ast.name(v.name) == "x"
                    && ast.positions.get(v.pos).is_some_and(|p| p.col == 15))
            });
        assert!(var.is_some(), "expected to find `x` at column 15");
        let _ = find_pos(&ast, var.unwrap());
    }
}
