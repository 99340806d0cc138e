//! Tree-walking evaluator over [`Expr`] and the six-namespace context.

use serde_json::{Map, Value, json};

use super::ExpressionError;
use super::parser::{BinaryOp, Expr, Function, PathSegment, PropertyPath};

/// The legal roots of a property access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    Parameters,
    Stages,
    Context,
    Env,
    Run,
    Workflow,
}

impl Namespace {
    pub const ALL: [Namespace; 6] = [
        Namespace::Parameters,
        Namespace::Stages,
        Namespace::Context,
        Namespace::Env,
        Namespace::Run,
        Namespace::Workflow,
    ];

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "parameters" => Some(Namespace::Parameters),
            "stages" => Some(Namespace::Stages),
            "context" => Some(Namespace::Context),
            "env" => Some(Namespace::Env),
            "run" => Some(Namespace::Run),
            "workflow" => Some(Namespace::Workflow),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Namespace::Parameters => "parameters",
            Namespace::Stages => "stages",
            Namespace::Context => "context",
            Namespace::Env => "env",
            Namespace::Run => "run",
            Namespace::Workflow => "workflow",
        }
    }
}

/// Values visible to expressions, one JSON object per namespace.
///
/// The `stages` namespace holds `{ <stage_id>: { "outputs": {...}, "status": "..." } }`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExpressionContext {
    parameters: Map<String, Value>,
    stages: Map<String, Value>,
    context: Map<String, Value>,
    env: Map<String, Value>,
    run: Map<String, Value>,
    workflow: Map<String, Value>,
}

impl ExpressionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_parameters<I, K>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        self.parameters
            .extend(params.into_iter().map(|(k, v)| (k.into(), v)));
        self
    }

    pub fn with_env<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env.extend(
            vars.into_iter()
                .map(|(k, v)| (k.into(), Value::String(v.into()))),
        );
        self
    }

    pub fn with_context<I, K>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        self.context
            .extend(values.into_iter().map(|(k, v)| (k.into(), v)));
        self
    }

    /// Non-object values leave the namespace empty.
    pub fn with_run(mut self, run: Value) -> Self {
        self.run = into_map(run);
        self
    }

    /// Non-object values leave the namespace empty.
    pub fn with_workflow(mut self, workflow: Value) -> Self {
        self.workflow = into_map(workflow);
        self
    }

    /// Record a stage's status and (possibly empty) outputs.
    pub fn set_stage(&mut self, stage_id: &str, status: &str, outputs: Value) {
        self.stages.insert(
            stage_id.to_string(),
            json!({ "outputs": outputs, "status": status }),
        );
    }

    pub fn namespace(&self, ns: Namespace) -> &Map<String, Value> {
        match ns {
            Namespace::Parameters => &self.parameters,
            Namespace::Stages => &self.stages,
            Namespace::Context => &self.context,
            Namespace::Env => &self.env,
            Namespace::Run => &self.run,
            Namespace::Workflow => &self.workflow,
        }
    }
}

fn into_map(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Evaluate a parsed expression.
pub fn evaluate(expr: &Expr, ctx: &ExpressionContext) -> Result<Value, ExpressionError> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Path(path) => resolve_path(path, ctx),
        Expr::Not(inner) => Ok(Value::Bool(!is_truthy(&evaluate(inner, ctx)?))),
        Expr::Ternary {
            condition,
            then_branch,
            else_branch,
        } => {
            if is_truthy(&evaluate(condition, ctx)?) {
                evaluate(then_branch, ctx)
            } else {
                evaluate(else_branch, ctx)
            }
        }
        Expr::Binary { op, lhs, rhs } => match op {
            BinaryOp::And => {
                if !is_truthy(&evaluate(lhs, ctx)?) {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(is_truthy(&evaluate(rhs, ctx)?)))
            }
            BinaryOp::Or => {
                if is_truthy(&evaluate(lhs, ctx)?) {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(is_truthy(&evaluate(rhs, ctx)?)))
            }
            BinaryOp::Eq => Ok(Value::Bool(values_equal(
                &evaluate(lhs, ctx)?,
                &evaluate(rhs, ctx)?,
            ))),
            BinaryOp::Ne => Ok(Value::Bool(!values_equal(
                &evaluate(lhs, ctx)?,
                &evaluate(rhs, ctx)?,
            ))),
            BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
                compare(*op, &evaluate(lhs, ctx)?, &evaluate(rhs, ctx)?)
            }
        },
        Expr::Call { function, args } => {
            let values = args
                .iter()
                .map(|a| evaluate(a, ctx))
                .collect::<Result<Vec<_>, _>>()?;
            call(*function, values)
        }
    }
}

/// Walk a property path. Missing keys and non-indexable intermediates yield
/// `null`; only an unknown root is an error.
fn resolve_path(path: &PropertyPath, ctx: &ExpressionContext) -> Result<Value, ExpressionError> {
    let ns = Namespace::from_name(&path.root)
        .ok_or_else(|| ExpressionError::UnknownNamespace(path.root.clone()))?;

    let root = ctx.namespace(ns);
    let Some((first, rest)) = path.segments.split_first() else {
        return Ok(Value::Object(root.clone()));
    };
    let mut current = match first {
        PathSegment::Key(key) => match root.get(key) {
            Some(v) => v,
            None => return Ok(Value::Null),
        },
        PathSegment::Index(_) => return Ok(Value::Null),
    };
    for segment in rest {
        let next = match (segment, current) {
            (PathSegment::Key(key), Value::Object(map)) => map.get(key),
            (PathSegment::Index(idx), Value::Array(items)) => items.get(*idx),
            (PathSegment::Key(key), Value::Array(items)) => {
                key.parse::<usize>().ok().and_then(|idx| items.get(idx))
            }
            _ => None,
        };
        match next {
            Some(v) => current = v,
            None => return Ok(Value::Null),
        }
    }
    Ok(current.clone())
}

/// `null`, `false`, `0`, `""` and empty collections are falsy.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Structural equality with `1 == 1.0`.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(a, b)| values_equal(a, b))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x
                    .iter()
                    .all(|(k, v)| y.get(k).is_some_and(|w| values_equal(v, w)))
        }
        _ => a == b,
    }
}

pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn compare(op: BinaryOp, lhs: &Value, rhs: &Value) -> Result<Value, ExpressionError> {
    let ordering = match (lhs, rhs) {
        (Value::Number(a), Value::Number(b)) => {
            let (a, b) = (a.as_f64().unwrap_or(f64::NAN), b.as_f64().unwrap_or(f64::NAN));
            a.partial_cmp(&b)
        }
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    };
    let Some(ordering) = ordering else {
        return Err(ExpressionError::IncomparableTypes {
            op: op.symbol(),
            left: type_name(lhs),
            right: type_name(rhs),
        });
    };

    let result = match op {
        BinaryOp::Lt => ordering.is_lt(),
        BinaryOp::Le => ordering.is_le(),
        BinaryOp::Gt => ordering.is_gt(),
        BinaryOp::Ge => ordering.is_ge(),
        _ => false,
    };
    Ok(Value::Bool(result))
}

fn call(function: Function, mut args: Vec<Value>) -> Result<Value, ExpressionError> {
    let bad = |message: String| ExpressionError::BadArguments {
        function: function.name().to_string(),
        message,
    };
    if args.len() != function.arity() {
        return Err(bad(format!(
            "expected {} argument(s), got {}",
            function.arity(),
            args.len()
        )));
    }

    match function {
        Function::Length => {
            let len = match &args[0] {
                Value::Null => 0,
                Value::String(s) => s.chars().count(),
                Value::Array(a) => a.len(),
                Value::Object(o) => o.len(),
                other => return Err(bad(format!("cannot take length of {}", type_name(other)))),
            };
            Ok(json!(len))
        }
        Function::Contains => {
            let needle = args.pop().unwrap_or(Value::Null);
            let haystack = args.pop().unwrap_or(Value::Null);
            let found = match (&haystack, &needle) {
                (Value::Null, _) => false,
                (Value::String(h), Value::String(n)) => h.contains(n.as_str()),
                (Value::String(h), Value::Number(n)) => h.contains(&n.to_string()),
                (Value::Array(items), n) => items.iter().any(|item| values_equal(item, n)),
                (Value::Object(map), Value::String(key)) => map.contains_key(key),
                (h, n) => {
                    return Err(bad(format!(
                        "cannot search {} for {}",
                        type_name(h),
                        type_name(n)
                    )));
                }
            };
            Ok(Value::Bool(found))
        }
        Function::ToJson => serde_json::to_string(&args[0])
            .map(Value::String)
            .map_err(|e| ExpressionError::Json(e.to_string())),
        Function::FromJson => match &args[0] {
            Value::String(s) => {
                serde_json::from_str(s).map_err(|e| ExpressionError::Json(e.to_string()))
            }
            other => Err(ExpressionError::Json(format!(
                "fromJSON expects a string, got {}",
                type_name(other)
            ))),
        },
    }
}
