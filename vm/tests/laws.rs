//! Algebraic laws of the program monad, checked over generated program trees: bind
//! associativity, the identities, and irrelevance of handler position for effects a handler
//! does not recognize.

use std::collections::BTreeMap;

use doeff_vm::{effects, run, DoExpr, Exception, Handler, HandlerOutcome, Value};
use pretty_assertions::assert_eq;
use proptest::prelude::*;

// PROGRAM GENERATION
// ================================================================================================

/// A deterministic, int-valued program. Effects are fine: both sides of every law run the
/// same effects in the same order.
#[derive(Clone, Debug)]
enum ProgramSpec {
    Pure(i64),
    /// Logs the number and yields it.
    Tell(i64),
    /// Writes the number into the store under `key` and yields it.
    Put(u8, i64),
    Seq(Box<ProgramSpec>, Box<ProgramSpec>),
}

impl ProgramSpec {
    fn build(&self) -> DoExpr {
        match self {
            Self::Pure(n) => DoExpr::pure(*n),
            Self::Tell(n) => {
                let n = *n;
                effects::tell(n).then(DoExpr::pure(n))
            },
            Self::Put(key, n) => {
                let n = *n;
                effects::put(format!("k{key}"), n).then(DoExpr::pure(n))
            },
            Self::Seq(first, second) => first.build().then(second.build()),
        }
    }
}

fn program_strategy() -> impl Strategy<Value = ProgramSpec> {
    let leaf = prop_oneof![
        (-100i64..100).prop_map(ProgramSpec::Pure),
        (-100i64..100).prop_map(ProgramSpec::Tell),
        (0u8..4, -100i64..100).prop_map(|(key, n)| ProgramSpec::Put(key, n)),
    ];
    leaf.prop_recursive(3, 12, 2, |inner| {
        (inner.clone(), inner)
            .prop_map(|(a, b)| ProgramSpec::Seq(Box::new(a), Box::new(b)))
    })
}

/// A deterministic binder from a value to a program.
#[derive(Clone, Copy, Debug)]
enum BinderSpec {
    Add(i64),
    Double,
    TellThen(i64),
}

impl BinderSpec {
    fn bind(self, value: Value) -> Result<DoExpr, Exception> {
        let n = value.as_int()?;
        Ok(match self {
            Self::Add(k) => DoExpr::pure(n + k),
            Self::Double => DoExpr::pure(n * 2),
            Self::TellThen(k) => effects::tell(n + k).then(DoExpr::pure(n + k)),
        })
    }

    fn apply_to(self, program: DoExpr) -> DoExpr {
        program.flat_map(move |value| self.bind(value))
    }
}

fn binder_strategy() -> impl Strategy<Value = BinderSpec> {
    prop_oneof![
        (-10i64..10).prop_map(BinderSpec::Add),
        Just(BinderSpec::Double),
        (-10i64..10).prop_map(BinderSpec::TellThen),
    ]
}

// OBSERVATION
// ================================================================================================

/// Everything observable about a run: the outcome, the log, and the user store.
fn observe(program: DoExpr) -> (Result<Value, Exception>, Vec<Value>, BTreeMap<String, Value>) {
    let result = run(program).expect("interpreter error");
    let log = result.log().to_vec();
    let store = result.store().user_entries().clone();
    let outcome = match result {
        doeff_vm::RunResult::Ok { value, .. } => Ok(value),
        doeff_vm::RunResult::Err { failure, .. } => Err(failure.exception),
    };
    (outcome, log, store)
}

// LAWS
// ================================================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn bind_is_associative(
        spec in program_strategy(),
        f in binder_strategy(),
        g in binder_strategy(),
    ) {
        let left = g.apply_to(f.apply_to(spec.build()));
        let right = spec.build().flat_map(move |value| {
            Ok(g.apply_to(f.bind(value)?))
        });
        prop_assert_eq!(observe(left), observe(right));
    }

    #[test]
    fn pure_is_a_left_identity(n in -100i64..100, f in binder_strategy()) {
        let left = f.apply_to(DoExpr::pure(n));
        let right = f.bind(Value::Int(n)).expect("binder accepts ints");
        prop_assert_eq!(observe(left), observe(right));
    }

    #[test]
    fn pure_is_a_right_identity(spec in program_strategy()) {
        let left = spec.build().flat_map(|value| Ok(DoExpr::Pure(value)));
        let right = spec.build();
        prop_assert_eq!(observe(left), observe(right));
    }

    #[test]
    fn an_unrelated_handler_does_not_change_the_result(spec in program_strategy()) {
        let bystander = || {
            Handler::user("bystander", |_effect, _k| Ok(HandlerOutcome::Pass))
        };
        let bare = spec.build();
        let wrapped = effects::with_handler(bystander(), spec.build());
        let nested = effects::with_handler(
            bystander(),
            effects::with_handler(bystander(), spec.build()),
        );
        prop_assert_eq!(observe(bare.clone()), observe(wrapped));
        prop_assert_eq!(observe(bare), observe(nested));
    }
}

// CONCRETE EQUIVALENCES
// ================================================================================================

#[test]
fn safe_of_pure_is_ok() {
    let (outcome, _, _) = observe(effects::safe(DoExpr::pure(5)));
    assert_eq!(outcome.unwrap(), Value::ok(Value::Int(5)));
}

#[test]
fn safe_of_fail_is_err() {
    let (outcome, _, _) = observe(effects::safe(effects::fail(Exception::value_error("e"))));
    assert_eq!(outcome.unwrap(), Value::err(Exception::value_error("e")));
}

#[test]
fn unwrap_of_ok_is_pure() {
    let program = effects::unwrap(DoExpr::Pure(Value::ok(Value::Int(9))));
    assert_eq!(observe(program).0.unwrap(), Value::Int(9));
}

#[test]
fn unwrap_of_err_is_fail() {
    let program = effects::unwrap(DoExpr::Pure(Value::err(Exception::value_error("raised"))));
    assert_eq!(observe(program).0.unwrap_err(), Exception::value_error("raised"));
}

#[test]
fn listen_of_tell_returns_the_value_and_the_message() {
    let program = effects::listen(effects::tell("m").then(DoExpr::pure(3)));
    let (outcome, log, _) = observe(program);
    assert_eq!(
        outcome.unwrap(),
        Value::list([Value::Int(3), Value::list([Value::str("m")])]),
    );
    assert_eq!(log, vec![Value::str("m")]);
}
