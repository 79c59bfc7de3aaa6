//! Runtime values.
//!
//! Everything is reference-counted and lazy: lists and attribute sets
//! hold [`Thunk`]s, and a thunk is forced at most once. Values are only
//! ever used inside a single worker thread, so plain `Rc`/`RefCell` do.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use nixd_core::{Ast, ExprId, PosIdx};

#[derive(Clone)]
pub enum Value {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(Rc<str>),
    Path(Rc<str>),
    Null,
    List(Rc<Vec<Thunk>>),
    Attrs(Rc<AttrsValue>),
    Lambda(Rc<Closure>),
    /// A builtin, possibly partially applied.
    Builtin(&'static str, Rc<Vec<Value>>),
}

impl Value {
    pub fn builtin(name: &'static str) -> Value {
        Value::Builtin(name, Rc::new(Vec::new()))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "an integer",
            Value::Float(_) => "a float",
            Value::Bool(_) => "a boolean",
            Value::Str(_) => "a string",
            Value::Path(_) => "a path",
            Value::Null => "null",
            Value::List(_) => "a list",
            Value::Attrs(_) => "an attribute set",
            Value::Lambda(_) | Value::Builtin(..) => "a function",
        }
    }

    pub fn as_attrs(&self) -> Option<&Rc<AttrsValue>> {
        match self {
            Value::Attrs(a) => Some(a),
            _ => None,
        }
    }
}

/// An attribute set value. Each attribute remembers the position of its
/// defining binding, which powers evaluated go-to-definition.
pub struct AttrsValue {
    pub entries: BTreeMap<String, AttrValue>,
}

#[derive(Clone)]
pub struct AttrValue {
    pub thunk: Thunk,
    pub pos: PosIdx,
}

/// A lambda together with its captured environment and owning AST.
pub struct Closure {
    pub ast: Rc<Ast>,
    pub lambda: ExprId,
    pub env: Env,
}

// ── Thunks ───────────────────────────────────────────────────────

enum ThunkState {
    Suspended {
        ast: Rc<Ast>,
        expr: ExprId,
        env: Env,
    },
    /// Being forced right now; hitting it again is a cycle. Keeps the
    /// suspension site so the cycle diagnostic has a position.
    Blackhole { ast: Rc<Ast>, expr: ExprId },
    Forced(Value),
}

#[derive(Clone)]
pub struct Thunk(Rc<RefCell<ThunkState>>);

impl Thunk {
    pub fn suspended(ast: Rc<Ast>, expr: ExprId, env: Env) -> Thunk {
        Thunk(Rc::new(RefCell::new(ThunkState::Suspended {
            ast,
            expr,
            env,
        })))
    }

    pub fn forced(value: Value) -> Thunk {
        Thunk(Rc::new(RefCell::new(ThunkState::Forced(value))))
    }

    /// Take the suspension out, leaving a blackhole. `Done` if already
    /// forced, `Cycle` (with the suspension site) if forcing is in
    /// progress.
    pub(crate) fn begin_force(&self) -> ForceState {
        let mut state = self.0.borrow_mut();
        match &*state {
            ThunkState::Forced(v) => ForceState::Done(v.clone()),
            ThunkState::Blackhole { ast, expr } => ForceState::Cycle {
                ast: ast.clone(),
                expr: *expr,
            },
            ThunkState::Suspended { .. } => {
                let prev = std::mem::replace(&mut *state, ThunkState::Forced(Value::Null));
                match prev {
                    ThunkState::Suspended { ast, expr, env } => {
                        *state = ThunkState::Blackhole {
                            ast: ast.clone(),
                            expr,
                        };
                        ForceState::Eval { ast, expr, env }
                    }
                    _ => unreachable!(),
                }
            }
        }
    }

    pub(crate) fn finish_force(&self, value: Value) {
        *self.0.borrow_mut() = ThunkState::Forced(value);
    }

    /// The value, if this thunk has already been forced.
    pub fn peek(&self) -> Option<Value> {
        match &*self.0.borrow() {
            ThunkState::Forced(v) => Some(v.clone()),
            _ => None,
        }
    }
}

pub(crate) enum ForceState {
    Done(Value),
    Cycle { ast: Rc<Ast>, expr: ExprId },
    Eval { ast: Rc<Ast>, expr: ExprId, env: Env },
}

// ── Environments ─────────────────────────────────────────────────

/// One environment level. The slot layout of a `Static` env mirrors the
/// binder's displacement list for the scope that created it.
pub struct EnvData {
    pub up: Option<Env>,
    pub kind: EnvKind,
}

pub enum EnvKind {
    /// Displacement-indexed slots. `RefCell` because recursive scopes
    /// fill their slots after the env exists.
    Static(RefCell<Vec<Thunk>>),
    /// A `with` env: the attrset expression, forced on first dynamic
    /// lookup.
    With(Thunk),
}

#[derive(Clone)]
pub struct Env(pub Rc<EnvData>);

impl Env {
    pub fn root() -> Env {
        Env(Rc::new(EnvData {
            up: None,
            kind: EnvKind::Static(RefCell::new(Vec::new())),
        }))
    }

    pub fn new_static(up: &Env, slots: Vec<Thunk>) -> Env {
        Env(Rc::new(EnvData {
            up: Some(up.clone()),
            kind: EnvKind::Static(RefCell::new(slots)),
        }))
    }

    pub fn new_with(up: &Env, attrs: Thunk) -> Env {
        Env(Rc::new(EnvData {
            up: Some(up.clone()),
            kind: EnvKind::With(attrs),
        }))
    }

    /// Walk `level` parents up.
    pub fn at_level(&self, level: u32) -> Option<Env> {
        let mut env = self.clone();
        for _ in 0..level {
            env = env.0.up.clone()?;
        }
        Some(env)
    }
}

// ── Rendering ────────────────────────────────────────────────────

impl Value {
    /// One-line rendering with a depth budget, for hover and logs.
    /// Unforced thunks render as `…` rather than triggering evaluation.
    pub fn render(&self, depth: usize) -> String {
        match self {
            Value::Int(n) => n.to_string(),
            Value::Float(x) => x.to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Str(s) => format!("{s:?}"),
            Value::Path(p) => p.to_string(),
            Value::Null => "null".to_string(),
            Value::List(items) => {
                if depth == 0 {
                    return "[ … ]".to_string();
                }
                let mut parts = Vec::new();
                for t in items.iter().take(8) {
                    match t.peek() {
                        Some(v) => parts.push(v.render(depth - 1)),
                        None => parts.push("…".to_string()),
                    }
                }
                if items.len() > 8 {
                    parts.push("…".to_string());
                }
                format!("[ {} ]", parts.join(" "))
            }
            Value::Attrs(attrs) => {
                if depth == 0 {
                    return "{ … }".to_string();
                }
                let mut parts = Vec::new();
                for (name, attr) in attrs.entries.iter().take(8) {
                    match attr.thunk.peek() {
                        Some(v) => parts.push(format!("{name} = {};", v.render(depth - 1))),
                        None => parts.push(format!("{name} = …;")),
                    }
                }
                if attrs.entries.len() > 8 {
                    parts.push("…".to_string());
                }
                format!("{{ {} }}", parts.join(" "))
            }
            Value::Lambda(_) => "«lambda»".to_string(),
            Value::Builtin(name, _) => format!("«builtin {name}»"),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.render(2))
    }
}
