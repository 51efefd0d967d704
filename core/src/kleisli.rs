//! The host-function bridge.
//!
//! A [`Kleisli`] is a named function from values to a program. Calling one eagerly builds the
//! `DoExpr` tree for the call: arguments are collected left-to-right (subprogram arguments are
//! evaluated first), then the function produces the body program, which runs under a call frame
//! carrying the function's name and source location. The kernel never sees a host coroutine.

use std::{collections::BTreeMap, fmt, sync::Arc};

use crate::{
    expr::{Arg, DoExpr},
    meta::{CallMeta, SourceLocation},
    value::{BindFn, Exception, HostFn, Value},
};

type KleisliFn =
    dyn Fn(Vec<Value>, BTreeMap<String, Value>) -> Result<DoExpr, Exception> + Send + Sync;

/// A named, program-returning function.
#[derive(Clone)]
pub struct Kleisli {
    meta: Arc<CallMeta>,
    func: Arc<KleisliFn>,
}

impl Kleisli {
    pub fn new(
        name: impl AsRef<str>,
        func: impl Fn(Vec<Value>) -> Result<DoExpr, Exception> + Send + Sync + 'static,
    ) -> Self {
        Self {
            meta: Arc::new(CallMeta::new(name)),
            func: Arc::new(move |positional, _keyword| func(positional)),
        }
    }

    pub fn with_kwargs(
        name: impl AsRef<str>,
        func: impl Fn(Vec<Value>, BTreeMap<String, Value>) -> Result<DoExpr, Exception>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            meta: Arc::new(CallMeta::new(name)),
            func: Arc::new(func),
        }
    }

    /// Attaches the definition site so failure reports can point at it.
    pub fn at(mut self, location: SourceLocation) -> Self {
        self.meta = Arc::new(CallMeta {
            function_name: self.meta.function_name.clone(),
            created_at: Some(location),
        });
        self
    }

    pub fn name(&self) -> &str {
        &self.meta.function_name
    }

    pub fn meta(&self) -> &Arc<CallMeta> {
        &self.meta
    }

    /// Builds the call expression.
    ///
    /// Subprogram arguments (`Arg::Perform`) are resolved left-to-right before the function is
    /// invoked; the body program then runs under a call frame.
    pub fn call(&self, args: impl IntoIterator<Item = Arg>) -> DoExpr {
        self.call_with_kwargs(args, [])
    }

    pub fn call_with_kwargs(
        &self,
        args: impl IntoIterator<Item = Arg>,
        kwargs: impl IntoIterator<Item = (String, Arg)>,
    ) -> DoExpr {
        let positional: Vec<Arg> = args.into_iter().collect();
        let keyword: Vec<(String, Arg)> = kwargs.into_iter().collect();
        let arity = positional.len();
        let func = self.func.clone();

        // Collect resolved arguments into one list value: positional first, then keyword pairs.
        let collect = DoExpr::Apply {
            func: HostFn::new(move |positional, keyword| {
                let mut packed: Vec<Value> = positional;
                for (key, value) in keyword {
                    packed.push(Value::list([Value::str(key), value]));
                }
                Ok(Value::List(Arc::new(packed)))
            }),
            positional,
            keyword,
            meta: None,
        };

        DoExpr::FlatMap {
            source: Box::new(collect),
            binder: BindFn::new(move |packed| {
                let items = packed.as_list()?.to_vec();
                let (positional, keyword_items) = items.split_at(arity.min(items.len()));
                let mut keyword = BTreeMap::new();
                for pair in keyword_items {
                    let pair = pair.as_list()?;
                    keyword.insert(pair[0].as_str()?.to_string(), pair[1].clone());
                }
                func(positional.to_vec(), keyword)
            }),
            meta: Some(self.meta.clone()),
        }
    }
}

impl fmt::Debug for Kleisli {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<kleisli {}>", self.meta.function_name)
    }
}

/// Defines a [`Kleisli`] from a closure over positional values, capturing the call site.
#[macro_export]
macro_rules! kleisli {
    ($name:literal, $func:expr) => {
        $crate::kleisli::Kleisli::new($name, $func).at($crate::here!())
    };
}

// TESTS
// ================================================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::DoExpr;

    #[test]
    fn call_builds_a_flat_map_with_meta() {
        let double = Kleisli::new("double", |args| {
            let n = args[0].as_int()?;
            Ok(DoExpr::pure(n * 2))
        });
        let expr = double.call([Arg::Pure(Value::Int(21))]);
        match expr {
            DoExpr::FlatMap { meta, .. } => {
                assert_eq!(&*meta.unwrap().function_name, "double");
            },
            other => panic!("unexpected expression: {}", other.kind()),
        }
    }

    #[test]
    fn binder_produces_the_body_program() {
        let double = Kleisli::new("double", |args| {
            let n = args[0].as_int()?;
            Ok(DoExpr::pure(n * 2))
        });
        let expr = double.call([Arg::Pure(Value::Int(21))]);
        let DoExpr::FlatMap { binder, .. } = expr else {
            panic!("expected FlatMap");
        };
        let body = binder.apply(Value::list([Value::Int(21)])).unwrap();
        assert!(matches!(body, DoExpr::Pure(Value::Int(42))));
    }
}
