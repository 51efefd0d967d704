use std::{collections::BTreeMap, fmt, sync::Arc};

use crate::value::Value;

// SOURCE LOCATION
// ================================================================================================

/// Host source position captured when a program or effect is constructed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SourceLocation {
    pub file: &'static str,
    pub line: u32,
}

impl SourceLocation {
    pub const fn new(file: &'static str, line: u32) -> Self {
        Self { file, line }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

/// Captures the caller's source location.
#[macro_export]
macro_rules! here {
    () => {
        $crate::meta::SourceLocation::new(file!(), line!())
    };
}

// CALL METADATA
// ================================================================================================

/// Static description of a program-producing function, attached to `Apply`, `Map` and `FlatMap`
/// expressions so failures can name the user function they occurred in.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CallMeta {
    pub function_name: Arc<str>,
    pub created_at: Option<SourceLocation>,
}

impl CallMeta {
    pub fn new(function_name: impl AsRef<str>) -> Self {
        Self {
            function_name: Arc::from(function_name.as_ref()),
            created_at: None,
        }
    }

    pub fn at(function_name: impl AsRef<str>, location: SourceLocation) -> Self {
        Self {
            function_name: Arc::from(function_name.as_ref()),
            created_at: Some(location),
        }
    }
}

// CALL FRAME
// ================================================================================================

/// One entry of the program call stack.
///
/// This stack tracks user-visible functions and is independent of the continuation stack: the
/// continuation stack tracks continuation shape, this tracks what the user would call a call
/// stack. Frames are pure metadata; dropping them never changes program behavior.
#[derive(Clone, Debug)]
pub struct CallFrame {
    pub function_name: Arc<str>,
    pub args: Vec<Value>,
    pub kwargs: BTreeMap<String, Value>,
    pub depth: usize,
    pub created_at: Option<SourceLocation>,
}

impl CallFrame {
    pub fn new(meta: &CallMeta, args: Vec<Value>, kwargs: BTreeMap<String, Value>, depth: usize) -> Self {
        Self {
            function_name: meta.function_name.clone(),
            args,
            kwargs,
            depth,
            created_at: meta.created_at,
        }
    }
}

impl fmt::Display for CallFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.function_name)?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{arg}")?;
        }
        for (i, (key, value)) in self.kwargs.iter().enumerate() {
            if i > 0 || !self.args.is_empty() {
                write!(f, ", ")?;
            }
            write!(f, "{key}={value}")?;
        }
        write!(f, ")")
    }
}
