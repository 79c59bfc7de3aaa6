mod eval;
mod value;

pub use eval::{EvalResult, Evaluator};
pub use value::{AttrValue, AttrsValue, Closure, Env, EnvKind, Thunk, Value};
