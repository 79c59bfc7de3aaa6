//! The lazy evaluator.
//!
//! Environments mirror the binder's scope stack exactly: every
//! scope-introducing node creates one env level whose slot layout is the
//! binder's displacement list, so `Var { level, displ }` lookups are two
//! array walks. Forced values are recorded per expression of the root
//! document, which is what evaluated hover reads back.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use nixd_core::{
    Ast, BinOp, Binding, Expr, ExprId, NixdError, Pos, PosIdx, UnOp, BUILTIN_LEVEL,
};

use crate::value::{AttrValue, AttrsValue, Closure, Env, EnvKind, ForceState, Thunk, Value};

pub type EvalResult = Result<Value, NixdError>;

const MAX_DEPTH: usize = 512;

pub struct Evaluator {
    root_ast: Rc<Ast>,
    base_dir: Option<PathBuf>,
    /// Expression id -> last forced value, root document only.
    trace: RefCell<HashMap<ExprId, Value>>,
    depth: Cell<usize>,
    import_cache: RefCell<HashMap<PathBuf, Value>>,
    importing: RefCell<HashSet<PathBuf>>,
}

impl Evaluator {
    pub fn new(ast: Rc<Ast>, base_dir: Option<PathBuf>) -> Self {
        Evaluator {
            root_ast: ast,
            base_dir,
            trace: RefCell::new(HashMap::new()),
            depth: Cell::new(0),
            import_cache: RefCell::new(HashMap::new()),
            importing: RefCell::new(HashSet::new()),
        }
    }

    pub fn ast(&self) -> &Rc<Ast> {
        &self.root_ast
    }

    /// Evaluate the root expression of the document (shallow force).
    pub fn eval_root(&self) -> EvalResult {
        let ast = self.root_ast.clone();
        let root = ast.root();
        self.eval(&ast, root, &Env::root())
    }

    /// The recorded value of a root-document expression, if evaluation
    /// has reached it.
    pub fn traced(&self, id: ExprId) -> Option<Value> {
        self.trace.borrow().get(&id).cloned()
    }

    // ── Core evaluation ──────────────────────────────────────────

    pub fn eval(&self, ast: &Rc<Ast>, id: ExprId, env: &Env) -> EvalResult {
        let depth = self.depth.get();
        if depth > MAX_DEPTH {
            return Err(NixdError::eval(
                "evaluation depth limit exceeded",
                self.pos_of(ast, id),
            ));
        }
        self.depth.set(depth + 1);
        let result = self.eval_inner(ast, id, env);
        self.depth.set(depth);

        if let Ok(value) = &result {
            if Rc::ptr_eq(ast, &self.root_ast) {
                self.trace.borrow_mut().insert(id, value.clone());
            }
        }
        result
    }

    fn eval_inner(&self, ast: &Rc<Ast>, id: ExprId, env: &Env) -> EvalResult {
        match ast.expr(id) {
            Expr::Var(v) => {
                if v.level == BUILTIN_LEVEL {
                    return self.builtin_value(ast.name(v.name), self.pos_of(ast, id));
                }
                let target = env.at_level(v.level).ok_or_else(|| {
                    NixdError::eval("internal scope error", self.pos_of(ast, id))
                })?;
                match &target.0.kind {
                    EnvKind::Static(slots) => {
                        let thunk = slots
                            .borrow()
                            .get(v.displ as usize)
                            .cloned()
                            .ok_or_else(|| {
                                NixdError::eval("internal scope error", self.pos_of(ast, id))
                            })?;
                        self.force(&thunk)
                    }
                    EnvKind::With(attrs) => {
                        let attrs = self.force(attrs)?;
                        let name = ast.name(v.name);
                        match attrs.as_attrs().and_then(|a| a.entries.get(name)) {
                            Some(attr) => self.force(&attr.thunk),
                            None => Err(NixdError::Undefined {
                                name: name.to_string(),
                                pos: self.pos_of(ast, id).into(),
                            }),
                        }
                    }
                }
            }

            Expr::Int(n, _) => Ok(Value::Int(*n)),
            Expr::Float(x, _) => Ok(Value::Float(*x)),
            Expr::Str(s, _) => Ok(Value::Str(s.as_str().into())),
            Expr::Path(p, _) => Ok(Value::Path(p.as_str().into())),

            Expr::List(l) => {
                let items = l
                    .items
                    .iter()
                    .map(|&item| Thunk::suspended(ast.clone(), item, env.clone()))
                    .collect();
                Ok(Value::List(Rc::new(items)))
            }

            Expr::Attrs(a) => {
                if a.rec {
                    let (_, value) = self.eval_recursive_scope(ast, &a.bindings, env);
                    Ok(value)
                } else {
                    let mut entries = BTreeMap::new();
                    for b in &a.bindings {
                        entries.insert(
                            ast.name(b.name).to_string(),
                            AttrValue {
                                thunk: Thunk::suspended(ast.clone(), b.value, env.clone()),
                                pos: b.name_pos,
                            },
                        );
                    }
                    Ok(Value::Attrs(Rc::new(AttrsValue { entries })))
                }
            }

            Expr::Let(l) => {
                let (scope_env, _) = self.eval_recursive_scope(ast, &l.bindings, env);
                self.eval(ast, l.body, &scope_env)
            }

            Expr::With(w) => {
                let attrs = Thunk::suspended(ast.clone(), w.env, env.clone());
                let with_env = Env::new_with(env, attrs);
                self.eval(ast, w.body, &with_env)
            }

            Expr::Lambda(_) => Ok(Value::Lambda(Rc::new(Closure {
                ast: ast.clone(),
                lambda: id,
                env: env.clone(),
            }))),

            Expr::Apply(a) => {
                let func = self.eval(ast, a.func, env)?;
                let arg = Thunk::suspended(ast.clone(), a.arg, env.clone());
                self.apply(func, arg, self.pos_of(ast, id))
            }

            Expr::Select(s) => {
                let mut value = self.eval(ast, s.subject, env)?;
                for attr in &s.path {
                    let name = ast.name(attr.sym);
                    let next = value
                        .as_attrs()
                        .and_then(|a| a.entries.get(name))
                        .map(|a| a.thunk.clone());
                    match next {
                        Some(thunk) => value = self.force(&thunk)?,
                        None => {
                            return match s.or_default {
                                Some(default) => self.eval(ast, default, env),
                                None => Err(NixdError::eval(
                                    format!("attribute `{name}` missing"),
                                    ast.positions.get(attr.pos),
                                )),
                            };
                        }
                    }
                }
                Ok(value)
            }

            Expr::HasAttr(h) => {
                let mut value = self.eval(ast, h.subject, env)?;
                for attr in &h.path {
                    let name = ast.name(attr.sym);
                    let next = value
                        .as_attrs()
                        .and_then(|a| a.entries.get(name))
                        .map(|a| a.thunk.clone());
                    match next {
                        Some(thunk) => value = self.force(&thunk)?,
                        None => return Ok(Value::Bool(false)),
                    }
                }
                Ok(Value::Bool(true))
            }

            Expr::If(i) => {
                let cond = self.eval(ast, i.cond, env)?;
                match cond {
                    Value::Bool(true) => self.eval(ast, i.then, env),
                    Value::Bool(false) => self.eval(ast, i.else_, env),
                    other => Err(NixdError::Type {
                        expected: "a boolean",
                        got: other.type_name(),
                        pos: self.pos_of(ast, i.cond).into(),
                    }),
                }
            }

            Expr::Assert(a) => {
                let cond = self.eval(ast, a.cond, env)?;
                match cond {
                    Value::Bool(true) => self.eval(ast, a.body, env),
                    Value::Bool(false) => Err(NixdError::eval(
                        "assertion failed",
                        self.pos_of(ast, a.cond),
                    )),
                    other => Err(NixdError::Type {
                        expected: "a boolean",
                        got: other.type_name(),
                        pos: self.pos_of(ast, a.cond).into(),
                    }),
                }
            }

            Expr::UnaryOp(u) => {
                let operand = self.eval(ast, u.operand, env)?;
                match (u.op, operand) {
                    (UnOp::Not, Value::Bool(b)) => Ok(Value::Bool(!b)),
                    (UnOp::Negate, Value::Int(n)) => Ok(Value::Int(-n)),
                    (UnOp::Negate, Value::Float(x)) => Ok(Value::Float(-x)),
                    (UnOp::Not, other) => Err(NixdError::Type {
                        expected: "a boolean",
                        got: other.type_name(),
                        pos: self.pos_of(ast, u.operand).into(),
                    }),
                    (UnOp::Negate, other) => Err(NixdError::Type {
                        expected: "a number",
                        got: other.type_name(),
                        pos: self.pos_of(ast, u.operand).into(),
                    }),
                }
            }

            Expr::BinaryOp(b) => self.eval_binop(ast, b.op, b.lhs, b.rhs, b.pos, env),

            Expr::Error(pos) => Err(NixdError::eval(
                "cannot evaluate code with syntax errors",
                ast.positions.get(*pos),
            )),
        }
    }

    /// Build the env + attrset value for a recursive scope (`let` or
    /// `rec { … }`). Inherited bindings suspend in the enclosing env.
    fn eval_recursive_scope(
        &self,
        ast: &Rc<Ast>,
        bindings: &[Binding],
        env: &Env,
    ) -> (Env, Value) {
        let scope_env = Env::new_static(env, Vec::new());
        let mut slots = Vec::with_capacity(bindings.len());
        let mut entries = BTreeMap::new();
        for b in bindings {
            let value_env = if b.inherited { env } else { &scope_env };
            let thunk = Thunk::suspended(ast.clone(), b.value, value_env.clone());
            slots.push(thunk.clone());
            entries.insert(
                ast.name(b.name).to_string(),
                AttrValue {
                    thunk,
                    pos: b.name_pos,
                },
            );
        }
        if let EnvKind::Static(env_slots) = &scope_env.0.kind {
            *env_slots.borrow_mut() = slots;
        }
        (scope_env, Value::Attrs(Rc::new(AttrsValue { entries })))
    }

    fn eval_binop(
        &self,
        ast: &Rc<Ast>,
        op: BinOp,
        lhs_id: ExprId,
        rhs_id: ExprId,
        pos: PosIdx,
        env: &Env,
    ) -> EvalResult {
        let pos = ast.positions.get(pos);

        // Short-circuiting operators force only what they need.
        match op {
            BinOp::And | BinOp::Or | BinOp::Impl => {
                let lhs = self.expect_bool(ast, lhs_id, env)?;
                return match (op, lhs) {
                    (BinOp::And, false) => Ok(Value::Bool(false)),
                    (BinOp::Or, true) => Ok(Value::Bool(true)),
                    (BinOp::Impl, false) => Ok(Value::Bool(true)),
                    _ => Ok(Value::Bool(self.expect_bool(ast, rhs_id, env)?)),
                };
            }
            _ => {}
        }

        let lhs = self.eval(ast, lhs_id, env)?;
        let rhs = self.eval(ast, rhs_id, env)?;

        match op {
            BinOp::Add => match (&lhs, &rhs) {
                (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a + b)),
                (Value::Str(a), Value::Str(b)) => {
                    Ok(Value::Str(format!("{a}{b}").into()))
                }
                _ => self.arith(lhs, rhs, pos, |a, b| a + b),
            },
            BinOp::Sub => self.arith(lhs, rhs, pos, |a, b| a - b),
            BinOp::Mul => self.arith(lhs, rhs, pos, |a, b| a * b),
            BinOp::Div => {
                if matches!(rhs, Value::Int(0)) {
                    return Err(NixdError::eval("division by zero", pos));
                }
                match (&lhs, &rhs) {
                    (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a / b)),
                    _ => self.arith(lhs, rhs, pos, |a, b| a / b),
                }
            }
            BinOp::Eq => Ok(Value::Bool(self.values_equal(&lhs, &rhs, pos)?)),
            BinOp::Ne => Ok(Value::Bool(!self.values_equal(&lhs, &rhs, pos)?)),
            BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
                let ord = self.compare(&lhs, &rhs, pos)?;
                Ok(Value::Bool(match op {
                    BinOp::Lt => ord.is_lt(),
                    BinOp::Le => ord.is_le(),
                    BinOp::Gt => ord.is_gt(),
                    _ => ord.is_ge(),
                }))
            }
            BinOp::Update => match (&lhs, &rhs) {
                (Value::Attrs(a), Value::Attrs(b)) => {
                    let mut entries = a.entries.clone();
                    for (k, v) in &b.entries {
                        entries.insert(k.clone(), v.clone());
                    }
                    Ok(Value::Attrs(Rc::new(AttrsValue { entries })))
                }
                _ => Err(NixdError::Type {
                    expected: "an attribute set",
                    got: if lhs.as_attrs().is_some() {
                        rhs.type_name()
                    } else {
                        lhs.type_name()
                    },
                    pos: pos.into(),
                }),
            },
            BinOp::Concat => match (&lhs, &rhs) {
                (Value::List(a), Value::List(b)) => {
                    let mut items = (**a).clone();
                    items.extend(b.iter().cloned());
                    Ok(Value::List(Rc::new(items)))
                }
                _ => Err(NixdError::Type {
                    expected: "a list",
                    got: if matches!(lhs, Value::List(_)) {
                        rhs.type_name()
                    } else {
                        lhs.type_name()
                    },
                    pos: pos.into(),
                }),
            },
            BinOp::And | BinOp::Or | BinOp::Impl => unreachable!(),
        }
    }

    fn expect_bool(&self, ast: &Rc<Ast>, id: ExprId, env: &Env) -> Result<bool, NixdError> {
        match self.eval(ast, id, env)? {
            Value::Bool(b) => Ok(b),
            other => Err(NixdError::Type {
                expected: "a boolean",
                got: other.type_name(),
                pos: self.pos_of(ast, id).into(),
            }),
        }
    }

    fn arith(
        &self,
        lhs: Value,
        rhs: Value,
        pos: Option<Pos>,
        f: fn(f64, f64) -> f64,
    ) -> EvalResult {
        let (a, b) = match (&lhs, &rhs) {
            (Value::Int(a), Value::Int(b)) => (*a as f64, *b as f64),
            (Value::Int(a), Value::Float(b)) => (*a as f64, *b),
            (Value::Float(a), Value::Int(b)) => (*a, *b as f64),
            (Value::Float(a), Value::Float(b)) => (*a, *b),
            _ => {
                let got = if matches!(lhs, Value::Int(_) | Value::Float(_)) {
                    rhs.type_name()
                } else {
                    lhs.type_name()
                };
                return Err(NixdError::Type {
                    expected: "a number",
                    got,
                    pos: pos.into(),
                });
            }
        };
        let result = f(a, b);
        if matches!((&lhs, &rhs), (Value::Int(_), Value::Int(_))) {
            Ok(Value::Int(result as i64))
        } else {
            Ok(Value::Float(result))
        }
    }

    fn values_equal(&self, a: &Value, b: &Value, pos: Option<Pos>) -> Result<bool, NixdError> {
        Ok(match (a, b) {
            (Value::Int(x), Value::Int(y)) => x == y,
            (Value::Float(x), Value::Float(y)) => x == y,
            (Value::Int(x), Value::Float(y)) | (Value::Float(y), Value::Int(x)) => {
                *x as f64 == *y
            }
            (Value::Bool(x), Value::Bool(y)) => x == y,
            (Value::Str(x), Value::Str(y)) => x == y,
            (Value::Path(x), Value::Path(y)) => x == y,
            (Value::Null, Value::Null) => true,
            (Value::List(x), Value::List(y)) => {
                if x.len() != y.len() {
                    return Ok(false);
                }
                for (tx, ty) in x.iter().zip(y.iter()) {
                    let vx = self.force(tx)?;
                    let vy = self.force(ty)?;
                    if !self.values_equal(&vx, &vy, pos)? {
                        return Ok(false);
                    }
                }
                true
            }
            (Value::Attrs(x), Value::Attrs(y)) => {
                if x.entries.len() != y.entries.len() {
                    return Ok(false);
                }
                for ((kx, ax), (ky, ay)) in x.entries.iter().zip(y.entries.iter()) {
                    if kx != ky {
                        return Ok(false);
                    }
                    let vx = self.force(&ax.thunk)?;
                    let vy = self.force(&ay.thunk)?;
                    if !self.values_equal(&vx, &vy, pos)? {
                        return Ok(false);
                    }
                }
                true
            }
            (Value::Lambda(_) | Value::Builtin(..), _)
            | (_, Value::Lambda(_) | Value::Builtin(..)) => {
                return Err(NixdError::eval("cannot compare functions", pos));
            }
            _ => false,
        })
    }

    fn compare(
        &self,
        a: &Value,
        b: &Value,
        pos: Option<Pos>,
    ) -> Result<std::cmp::Ordering, NixdError> {
        use std::cmp::Ordering;
        match (a, b) {
            (Value::Int(x), Value::Int(y)) => Ok(x.cmp(y)),
            (Value::Str(x), Value::Str(y)) => Ok(x.cmp(y)),
            (Value::Int(x), Value::Float(y)) => Ok((*x as f64).total_cmp(y)),
            (Value::Float(x), Value::Int(y)) => Ok(x.total_cmp(&(*y as f64))),
            (Value::Float(x), Value::Float(y)) => Ok(x.total_cmp(y)),
            _ => Err(NixdError::eval(
                format!("cannot compare {} with {}", a.type_name(), b.type_name()),
                pos,
            )),
        }
    }

    // ── Application ──────────────────────────────────────────────

    fn apply(&self, func: Value, arg: Thunk, pos: Option<Pos>) -> EvalResult {
        match func {
            Value::Lambda(closure) => self.apply_lambda(&closure, arg, pos),
            Value::Builtin(name, args) => {
                let mut args = (*args).clone();
                args.push(self.force(&arg)?);
                if args.len() < builtin_arity(name) {
                    return Ok(Value::Builtin(name, Rc::new(args)));
                }
                self.call_builtin(name, &args, pos)
            }
            other => Err(NixdError::Type {
                expected: "a function",
                got: other.type_name(),
                pos: pos.into(),
            }),
        }
    }

    fn apply_lambda(&self, closure: &Closure, arg: Thunk, pos: Option<Pos>) -> EvalResult {
        let ast = &closure.ast;
        let lambda = match ast.expr(closure.lambda) {
            Expr::Lambda(l) => l,
            _ => return Err(NixdError::eval("internal closure error", pos)),
        };

        // Slot layout mirrors the binder: simple arg first, then formals
        // in source order.
        let mut slots = Vec::new();
        if lambda.arg.is_some() {
            slots.push(arg.clone());
        }
        if let Some(formals) = &lambda.formals {
            let attrs = match self.force(&arg)? {
                Value::Attrs(a) => a,
                other => {
                    return Err(NixdError::Type {
                        expected: "an attribute set",
                        got: other.type_name(),
                        pos: pos.into(),
                    })
                }
            };
            if !formals.ellipsis {
                for name in attrs.entries.keys() {
                    if !formals
                        .formals
                        .iter()
                        .any(|f| ast.name(f.name) == name.as_str())
                    {
                        return Err(NixdError::eval(
                            format!("unexpected argument `{name}`"),
                            pos,
                        ));
                    }
                }
            }
            for f in &formals.formals {
                let name = ast.name(f.name);
                match attrs.entries.get(name) {
                    Some(attr) => slots.push(attr.thunk.clone()),
                    None => match f.default {
                        // Defaults are bound outside the lambda scope,
                        // matching the binder.
                        Some(d) => {
                            slots.push(Thunk::suspended(ast.clone(), d, closure.env.clone()))
                        }
                        None => {
                            return Err(NixdError::eval(
                                format!("missing argument `{name}`"),
                                ast.positions.get(f.pos),
                            ))
                        }
                    },
                }
            }
        }

        let call_env = Env::new_static(&closure.env, slots);
        self.eval(ast, lambda.body, &call_env)
    }

    // ── Forcing ──────────────────────────────────────────────────

    pub fn force(&self, thunk: &Thunk) -> EvalResult {
        match thunk.begin_force() {
            ForceState::Done(v) => Ok(v),
            ForceState::Cycle { ast, expr } => Err(NixdError::eval(
                "infinite recursion encountered",
                self.pos_of(&ast, expr),
            )),
            ForceState::Eval { ast, expr, env } => {
                let value = self.eval(&ast, expr, &env)?;
                thunk.finish_force(value.clone());
                Ok(value)
            }
        }
    }

    /// Force nested structure down to `depth` levels. Used to surface
    /// evaluation errors as diagnostics.
    pub fn force_deep(&self, value: &Value, depth: usize) -> Result<(), NixdError> {
        if depth == 0 {
            return Ok(());
        }
        match value {
            Value::List(items) => {
                for t in items.iter() {
                    let v = self.force(t)?;
                    self.force_deep(&v, depth - 1)?;
                }
            }
            Value::Attrs(attrs) => {
                for attr in attrs.entries.values() {
                    let v = self.force(&attr.thunk)?;
                    self.force_deep(&v, depth - 1)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Follow a dotted attribute path from `value`, forcing along the
    /// way. Returns the reached value and the defining position of the
    /// last attribute.
    pub fn value_at_path(
        &self,
        value: &Value,
        path: &[&str],
    ) -> Result<Option<(Value, PosIdx)>, NixdError> {
        let mut current = value.clone();
        let mut pos = PosIdx::NONE;
        for seg in path {
            let next = match current.as_attrs().and_then(|a| a.entries.get(*seg)) {
                Some(attr) => (self.force(&attr.thunk)?, attr.pos),
                None => return Ok(None),
            };
            current = next.0;
            pos = next.1;
        }
        Ok(Some((current, pos)))
    }

    // ── Builtins ─────────────────────────────────────────────────

    fn builtin_value(&self, name: &str, pos: Option<Pos>) -> EvalResult {
        Ok(match name {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            "null" => Value::Null,
            "builtins" => {
                let mut entries = BTreeMap::new();
                for n in [
                    "toString",
                    "length",
                    "baseNameOf",
                    "dirOf",
                    "abort",
                    "throw",
                    "import",
                    "map",
                    "removeAttrs",
                ] {
                    entries.insert(
                        n.to_string(),
                        AttrValue {
                            thunk: Thunk::forced(Value::builtin(leak_name(n))),
                            pos: PosIdx::NONE,
                        },
                    );
                }
                Value::Attrs(Rc::new(AttrsValue { entries }))
            }
            "toString" | "length" | "baseNameOf" | "dirOf" | "abort" | "throw" | "import"
            | "map" | "removeAttrs" | "derivation" => Value::builtin(leak_name(name)),
            other => {
                return Err(NixdError::Undefined {
                    name: other.to_string(),
                    pos: pos.into(),
                })
            }
        })
    }

    fn call_builtin(&self, name: &str, args: &[Value], pos: Option<Pos>) -> EvalResult {
        match name {
            "toString" => Ok(Value::Str(coerce_to_string(&args[0]).into())),
            "length" => match &args[0] {
                Value::List(items) => Ok(Value::Int(items.len() as i64)),
                other => Err(NixdError::Type {
                    expected: "a list",
                    got: other.type_name(),
                    pos: pos.into(),
                }),
            },
            "baseNameOf" => {
                let s = coerce_to_string(&args[0]);
                Ok(Value::Str(
                    s.rsplit('/').next().unwrap_or(s.as_str()).into(),
                ))
            }
            "dirOf" => {
                let s = coerce_to_string(&args[0]);
                let dir = match s.rfind('/') {
                    Some(0) => "/",
                    Some(i) => &s[..i],
                    None => ".",
                };
                Ok(Value::Str(dir.into()))
            }
            "abort" | "throw" => Err(NixdError::eval(
                format!("{name}: {}", coerce_to_string(&args[0])),
                pos,
            )),
            "import" => self.import(&args[0], pos),
            "map" => {
                let list = match &args[1] {
                    Value::List(items) => items,
                    other => {
                        return Err(NixdError::Type {
                            expected: "a list",
                            got: other.type_name(),
                            pos: pos.into(),
                        })
                    }
                };
                let mut mapped = Vec::with_capacity(list.len());
                for t in list.iter() {
                    let v = self.apply(args[0].clone(), t.clone(), pos)?;
                    mapped.push(Thunk::forced(v));
                }
                Ok(Value::List(Rc::new(mapped)))
            }
            "removeAttrs" => {
                let attrs = match &args[0] {
                    Value::Attrs(a) => a,
                    other => {
                        return Err(NixdError::Type {
                            expected: "an attribute set",
                            got: other.type_name(),
                            pos: pos.into(),
                        })
                    }
                };
                let names: Vec<String> = match &args[1] {
                    Value::List(items) => {
                        let mut names = Vec::new();
                        for t in items.iter() {
                            match self.force(t)? {
                                Value::Str(s) => names.push(s.to_string()),
                                other => {
                                    return Err(NixdError::Type {
                                        expected: "a string",
                                        got: other.type_name(),
                                        pos: pos.into(),
                                    })
                                }
                            }
                        }
                        names
                    }
                    other => {
                        return Err(NixdError::Type {
                            expected: "a list",
                            got: other.type_name(),
                            pos: pos.into(),
                        })
                    }
                };
                let mut entries = attrs.entries.clone();
                for name in names {
                    entries.remove(&name);
                }
                Ok(Value::Attrs(Rc::new(AttrsValue { entries })))
            }
            "derivation" => Err(NixdError::eval(
                "derivation is not supported by the language server evaluator",
                pos,
            )),
            other => Err(NixdError::eval(format!("unknown builtin `{other}`"), pos)),
        }
    }

    fn import(&self, arg: &Value, pos: Option<Pos>) -> EvalResult {
        let raw = match arg {
            Value::Path(p) => p.to_string(),
            Value::Str(s) => s.to_string(),
            other => {
                return Err(NixdError::Type {
                    expected: "a path",
                    got: other.type_name(),
                    pos: pos.into(),
                })
            }
        };

        let mut path = PathBuf::from(&raw);
        if path.is_relative() {
            match &self.base_dir {
                Some(base) => path = base.join(path),
                None => {
                    return Err(NixdError::eval(
                        format!("cannot resolve relative import `{raw}`"),
                        pos,
                    ))
                }
            }
        }
        let path = path.canonicalize().map_err(|e| {
            NixdError::eval(format!("cannot import `{raw}`: {e}"), pos)
        })?;

        if let Some(v) = self.import_cache.borrow().get(&path) {
            return Ok(v.clone());
        }
        if !self.importing.borrow_mut().insert(path.clone()) {
            return Err(NixdError::eval(
                format!("import cycle via `{}`", path.display()),
                pos,
            ));
        }

        let result = self.import_file(&path, pos);

        self.importing.borrow_mut().remove(&path);
        if let Ok(v) = &result {
            self.import_cache.borrow_mut().insert(path, v.clone());
        }
        result
    }

    fn import_file(&self, path: &Path, pos: Option<Pos>) -> EvalResult {
        let source = std::fs::read_to_string(path)
            .map_err(|e| NixdError::eval(format!("cannot read `{}`: {e}", path.display()), pos))?;
        let parsed = nixd_parser::parse(&source);
        if let Some(err) = parsed.errors.first() {
            return Err(NixdError::eval(
                format!("while importing `{}`: {err}", path.display()),
                pos,
            ));
        }
        let ast = Rc::new(parsed.ast);
        let root = ast.root();
        self.eval(&ast, root, &Env::root())
            .map_err(|e| NixdError::eval(format!("while importing `{}`: {e}", path.display()), pos))
    }

    fn pos_of(&self, ast: &Ast, id: ExprId) -> Option<Pos> {
        ast.positions.get(ast.expr(id).pos())
    }
}

/// Builtin names come from a fixed set, so interning them as `&'static`
/// is a table lookup, never an actual leak.
fn leak_name(name: &str) -> &'static str {
    match name {
        "toString" => "toString",
        "length" => "length",
        "baseNameOf" => "baseNameOf",
        "dirOf" => "dirOf",
        "abort" => "abort",
        "throw" => "throw",
        "import" => "import",
        "map" => "map",
        "removeAttrs" => "removeAttrs",
        "derivation" => "derivation",
        _ => "unknown",
    }
}

fn builtin_arity(name: &str) -> usize {
    match name {
        "map" | "removeAttrs" => 2,
        _ => 1,
    }
}

fn coerce_to_string(value: &Value) -> String {
    match value {
        Value::Str(s) => s.to_string(),
        Value::Path(p) => p.to_string(),
        Value::Int(n) => n.to_string(),
        Value::Float(x) => x.to_string(),
        Value::Bool(true) => "1".to_string(),
        Value::Bool(false) => String::new(),
        Value::Null => String::new(),
        other => other.render(1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval_str(src: &str) -> EvalResult {
        let parsed = nixd_parser::parse(src);
        assert!(
            parsed.errors.is_empty(),
            "parse errors for {src:?}: {:?}",
            parsed.errors
        );
        Evaluator::new(Rc::new(parsed.ast), None).eval_root()
    }

    fn eval_int(src: &str) -> i64 {
        match eval_str(src) {
            Ok(Value::Int(n)) => n,
            other => panic!("expected Int for {src:?}, got {other:?}"),
        }
    }

    // ── Basics ───────────────────────────────────────────────────

    #[test]
    fn arithmetic_and_precedence() {
        assert_eq!(eval_int("1 + 2 * 3"), 7);
        assert_eq!(eval_int("10 / 2 - 3"), 2);
    }

    #[test]
    fn division_by_zero_errors() {
        let err = eval_str("1 / 0").unwrap_err();
        assert!(err.to_string().contains("division by zero"));
    }

    #[test]
    fn let_and_select() {
        assert_eq!(eval_int("let a = { b = 40; }; in a.b + 2"), 42);
    }

    #[test]
    fn select_or_default() {
        assert_eq!(eval_int("{ a = 1; }.b or 7"), 7);
        assert_eq!(eval_int("{ a = 1; }.a or 7"), 1);
    }

    #[test]
    fn rec_attrs_see_their_siblings() {
        assert_eq!(eval_int("rec { a = 1; b = a + 1; }.b"), 2);
    }

    #[test]
    fn with_provides_dynamic_scope() {
        assert_eq!(eval_int("with { a = 2; }; a + 1"), 3);
    }

    #[test]
    fn static_binding_shadows_with() {
        assert_eq!(eval_int("let a = 1; in with { a = 2; }; a"), 1);
    }

    #[test]
    fn lambdas_and_currying() {
        assert_eq!(eval_int("(x: y: x + y) 1 2"), 3);
    }

    #[test]
    fn formals_with_defaults() {
        assert_eq!(eval_int("({ x, y ? 10 }: x + y) { x = 1; }"), 11);
    }

    #[test]
    fn formals_reject_unexpected_arguments() {
        let err = eval_str("({ x }: x) { x = 1; y = 2; }").unwrap_err();
        assert!(err.to_string().contains("unexpected argument `y`"));
    }

    #[test]
    fn ellipsis_accepts_extra_arguments() {
        assert_eq!(eval_int("({ x, ... }: x) { x = 1; y = 2; }"), 1);
    }

    #[test]
    fn at_pattern_binds_whole_argument() {
        assert_eq!(eval_int("(args@{ x, ... }: args.y) { x = 1; y = 5; }"), 5);
    }

    // ── Laziness ─────────────────────────────────────────────────

    #[test]
    fn unused_bindings_are_not_forced() {
        // `boom` would throw if forced.
        assert_eq!(eval_int("let boom = throw \"no\"; ok = 1; in ok"), 1);
    }

    #[test]
    fn unselected_attrs_are_not_forced() {
        assert_eq!(eval_int("{ bad = 1 / 0; good = 3; }.good"), 3);
    }

    #[test]
    fn infinite_recursion_is_detected() {
        let err = eval_str("let x = x; in x").unwrap_err();
        assert!(err.to_string().contains("infinite recursion"));
        // The diagnostic points at the cyclic binding's expression.
        assert_eq!(err.pos(), Some(Pos { line: 1, col: 9 }));
    }

    // ── Operators ────────────────────────────────────────────────

    #[test]
    fn update_prefers_rhs() {
        assert_eq!(eval_int("({ a = 1; } // { a = 2; }).a"), 2);
    }

    #[test]
    fn concat_joins_lists() {
        let v = eval_str("[ 1 ] ++ [ 2 3 ]").unwrap();
        match v {
            Value::List(items) => assert_eq!(items.len(), 3),
            other => panic!("expected list, got {other:?}"),
        }
    }

    #[test]
    fn equality_is_structural() {
        assert!(matches!(
            eval_str("{ a = 1; } == { a = 1; }").unwrap(),
            Value::Bool(true)
        ));
        assert!(matches!(
            eval_str("[ 1 2 ] == [ 1 3 ]").unwrap(),
            Value::Bool(false)
        ));
    }

    #[test]
    fn has_attr_checks_path() {
        assert!(matches!(
            eval_str("{ a = { b = 1; }; } ? a.b").unwrap(),
            Value::Bool(true)
        ));
        assert!(matches!(
            eval_str("{ a = 1; } ? b").unwrap(),
            Value::Bool(false)
        ));
    }

    #[test]
    fn logical_operators_short_circuit() {
        assert!(matches!(
            eval_str("false && (1 / 0 == 0)").unwrap(),
            Value::Bool(false)
        ));
        assert!(matches!(
            eval_str("true || (1 / 0 == 0)").unwrap(),
            Value::Bool(true)
        ));
        assert!(matches!(
            eval_str("false -> (1 / 0 == 0)").unwrap(),
            Value::Bool(true)
        ));
    }

    // ── Control flow ─────────────────────────────────────────────

    #[test]
    fn if_and_assert() {
        assert_eq!(eval_int("if 1 < 2 then 10 else 20"), 10);
        assert_eq!(eval_int("assert true; 5"), 5);
        let err = eval_str("assert 1 == 2; 5").unwrap_err();
        assert!(err.to_string().contains("assertion failed"));
    }

    #[test]
    fn non_boolean_condition_is_a_type_error() {
        let err = eval_str("if 1 then 2 else 3").unwrap_err();
        assert!(err.to_string().contains("expected a boolean"));
    }

    // ── Builtins ─────────────────────────────────────────────────

    #[test]
    fn builtin_functions() {
        assert_eq!(eval_int("length [ 1 2 3 ]"), 3);
        assert!(matches!(
            eval_str("toString 42").unwrap(),
            Value::Str(s) if &*s == "42"
        ));
        assert!(matches!(
            eval_str("baseNameOf \"/a/b/c\"").unwrap(),
            Value::Str(s) if &*s == "c"
        ));
    }

    #[test]
    fn builtins_attrset_exposes_functions() {
        assert_eq!(eval_int("builtins.length [ 1 ]"), 1);
    }

    #[test]
    fn map_applies_function() {
        let v = eval_str("map (x: x + 1) [ 1 2 ]").unwrap();
        match v {
            Value::List(items) => {
                assert!(matches!(items[0].peek(), Some(Value::Int(2))));
                assert!(matches!(items[1].peek(), Some(Value::Int(3))));
            }
            other => panic!("expected list, got {other:?}"),
        }
    }

    #[test]
    fn remove_attrs() {
        assert!(matches!(
            eval_str("removeAttrs { a = 1; b = 2; } [ \"a\" ] ? a").unwrap(),
            Value::Bool(false)
        ));
    }

    // ── Import ───────────────────────────────────────────────────

    #[test]
    fn import_reads_and_evaluates() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("lib.nix"), "{ answer = 42; }").unwrap();

        let parsed = nixd_parser::parse("(import ./lib.nix).answer");
        assert!(parsed.errors.is_empty());
        let eval = Evaluator::new(Rc::new(parsed.ast), Some(dir.path().to_path_buf()));
        match eval.eval_root() {
            Ok(Value::Int(42)) => {}
            other => panic!("expected 42, got {other:?}"),
        }
    }

    #[test]
    fn import_cycle_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.nix"), "import ./a.nix").unwrap();

        let parsed = nixd_parser::parse("import ./a.nix");
        assert!(parsed.errors.is_empty());
        let eval = Evaluator::new(Rc::new(parsed.ast), Some(dir.path().to_path_buf()));
        let err = eval.eval_root().unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    // ── Trace / deep force ───────────────────────────────────────

    #[test]
    fn trace_records_forced_expressions() {
        let parsed = nixd_parser::parse("let a = 1 + 1; in a");
        assert!(parsed.errors.is_empty());
        let ast = Rc::new(parsed.ast);
        let eval = Evaluator::new(ast.clone(), None);
        eval.eval_root().unwrap();

        // The `1 + 1` binary op has been forced and recorded.
        let binop = ast
            .ids()
            .find(|&id| matches!(ast.expr(id), Expr::BinaryOp(_)))
            .unwrap();
        assert!(matches!(eval.traced(binop), Some(Value::Int(2))));
    }

    #[test]
    fn force_deep_surfaces_nested_errors() {
        let parsed = nixd_parser::parse("{ a = { b = 1 / 0; }; }");
        assert!(parsed.errors.is_empty());
        let eval = Evaluator::new(Rc::new(parsed.ast), None);
        let root = eval.eval_root().unwrap();
        let err = eval.force_deep(&root, 8).unwrap_err();
        assert!(err.to_string().contains("division by zero"));
    }

    #[test]
    fn value_at_path_walks_attrs() {
        let parsed = nixd_parser::parse("{ a = { b = 7; }; }");
        assert!(parsed.errors.is_empty());
        let eval = Evaluator::new(Rc::new(parsed.ast), None);
        let root = eval.eval_root().unwrap();
        let (v, pos) = eval.value_at_path(&root, &["a", "b"]).unwrap().unwrap();
        assert!(matches!(v, Value::Int(7)));
        assert!(!pos.is_none());
        assert!(eval.value_at_path(&root, &["a", "zzz"]).unwrap().is_none());
    }
}
