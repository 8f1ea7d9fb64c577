//! Host-side view of script values
//!
//! Debuggers and REPLs never look inside interpreter values directly. A
//! [`ValueInspector`] provided by the backend enumerates members, and
//! [`Variable`] wraps each member with lazily built children.

use crate::error::{Result, ScriptError};
use crate::frame::StackFrame;
use once_cell::sync::OnceCell;
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::warn;

/// Universal host value
///
/// `()` is the resolved-null value. An unresolved job result is modelled
/// separately as `None`, so the two never collide.
pub type Value = rhai::Dynamic;

/// Name of the placeholder variable produced when enumeration fails
pub const INSPECTION_ERROR_NAME: &str = "<error>";

/// One named member of a value
#[derive(Debug, Clone)]
pub struct Member {
    /// Member name (`"[0]"` style for indexed collections)
    pub name: String,
    /// Member value, or the error raised while reading it
    pub value: Result<Value>,
}

impl Member {
    /// Create a member holding a value
    pub fn new<S: Into<String>>(name: S, value: Value) -> Self {
        Self {
            name: name.into(),
            value: Ok(value),
        }
    }

    /// Create a member whose value could not be read
    pub fn failed<S: Into<String>>(name: S, error: ScriptError) -> Self {
        Self {
            name: name.into(),
            value: Err(error),
        }
    }
}

/// Host types that expose their own members to inspectors
pub trait Inspect {
    /// Enumerate the members of `self`
    fn members(&self) -> Result<Vec<Member>>;
}

/// Backend-provided capability for looking inside values
///
/// Inspectors are shared with the debugger's controller thread, so they
/// must not touch interpreter state that only the worker thread may use.
pub trait ValueInspector: Send + Sync + fmt::Debug {
    /// Enumerate the members of `value` in declaration order
    ///
    /// Primitives and opaque values have no members.
    fn enumerate_members(&self, value: &Value) -> Result<Vec<Member>>;

    /// Type name shown next to a value
    fn type_name(&self, value: &Value) -> String {
        value.type_name().to_string()
    }

    /// Single line rendering of a value
    fn display(&self, value: &Value) -> String {
        format!("{value:?}")
    }
}

/// Named value in a stack frame or inside another variable
#[derive(Clone)]
pub struct Variable {
    inner: Arc<VariableInner>,
}

struct VariableInner {
    name: String,
    value: Result<Value>,
    inspector: Arc<dyn ValueInspector>,
    frame: Weak<StackFrame>,
    children: OnceCell<Vec<Variable>>,
}

impl Variable {
    /// Create a variable from a member
    pub fn new(
        member: Member,
        inspector: Arc<dyn ValueInspector>,
        frame: Weak<StackFrame>,
    ) -> Self {
        Self {
            inner: Arc::new(VariableInner {
                name: member.name,
                value: member.value,
                inspector,
                frame,
                children: OnceCell::new(),
            }),
        }
    }

    /// Variable name
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Underlying value, or the error raised while reading it
    pub fn value(&self) -> std::result::Result<&Value, &ScriptError> {
        self.inner.value.as_ref()
    }

    /// Whether reading this variable failed
    pub fn is_error(&self) -> bool {
        self.inner.value.is_err()
    }

    /// Type name of the value
    pub fn type_name(&self) -> String {
        match &self.inner.value {
            Ok(value) => self.inner.inspector.type_name(value),
            Err(_) => "error".to_string(),
        }
    }

    /// Rendering of the value (or error message)
    pub fn display(&self) -> String {
        match &self.inner.value {
            Ok(value) => self.inner.inspector.display(value),
            Err(err) => err.to_string(),
        }
    }

    /// Frame this variable was captured in, if it is still alive
    pub fn frame(&self) -> Option<Arc<StackFrame>> {
        self.inner.frame.upgrade()
    }

    /// Child variables, enumerated on first access and cached after
    pub fn children(&self) -> &[Variable] {
        self.inner.children.get_or_init(|| match &self.inner.value {
            Ok(value) => build_variables_in(value, &self.inner.inspector, self.inner.frame.clone()),
            Err(_) => Vec::new(),
        })
    }

    /// Whether children have been enumerated yet
    pub fn is_expanded(&self) -> bool {
        self.inner.children.get().is_some()
    }

    /// Look up a direct child by name
    pub fn child(&self, name: &str) -> Option<&Variable> {
        self.children().iter().find(|c| c.name() == name)
    }
}

impl fmt::Debug for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Variable")
            .field("name", &self.inner.name)
            .field("value", &self.display())
            .field("expanded", &self.is_expanded())
            .finish()
    }
}

/// Build the variables describing the members of `value`
///
/// Never fails: if enumeration raises, the result is a single
/// [`INSPECTION_ERROR_NAME`] variable carrying the error.
pub fn build_variables(value: &Value, inspector: &Arc<dyn ValueInspector>) -> Vec<Variable> {
    build_variables_in(value, inspector, Weak::new())
}

pub(crate) fn build_variables_in(
    value: &Value,
    inspector: &Arc<dyn ValueInspector>,
    frame: Weak<StackFrame>,
) -> Vec<Variable> {
    match inspector.enumerate_members(value) {
        Ok(members) => members
            .into_iter()
            .map(|member| Variable::new(member, Arc::clone(inspector), frame.clone()))
            .collect(),
        Err(err) => {
            warn!(error = %err, type_name = value.type_name(), "Failed to enumerate value members");
            vec![Variable::new(
                Member::failed(INSPECTION_ERROR_NAME, err),
                Arc::clone(inspector),
                frame,
            )]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Treats arrays as `[i]` collections and fails on strings
    #[derive(Debug, Default)]
    struct TestInspector {
        calls: AtomicUsize,
    }

    impl ValueInspector for TestInspector {
        fn enumerate_members(&self, value: &Value) -> Result<Vec<Member>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if value.is_string() {
                return Err(ScriptError::inspection("strings are opaque"));
            }
            match value.clone().try_cast::<rhai::Array>() {
                Some(items) => Ok(items
                    .into_iter()
                    .enumerate()
                    .map(|(i, v)| Member::new(format!("[{i}]"), v))
                    .collect()),
                None => Ok(Vec::new()),
            }
        }
    }

    #[test]
    fn test_primitive_has_no_children() {
        let inspector: Arc<dyn ValueInspector> = Arc::new(TestInspector::default());
        assert!(build_variables(&Value::from(42_i64), &inspector).is_empty());
    }

    #[test]
    fn test_collection_members_in_order() {
        let inspector: Arc<dyn ValueInspector> = Arc::new(TestInspector::default());
        let value = Value::from(vec![Value::from(1_i64), Value::from(2_i64)]);

        let vars = build_variables(&value, &inspector);
        let names: Vec<_> = vars.iter().map(Variable::name).collect();
        assert_eq!(names, ["[0]", "[1]"]);
        assert_eq!(vars[1].display(), "2");
    }

    #[test]
    fn test_enumeration_error_becomes_placeholder() {
        let inspector: Arc<dyn ValueInspector> = Arc::new(TestInspector::default());
        let vars = build_variables(&Value::from("text"), &inspector);

        assert_eq!(vars.len(), 1);
        assert_eq!(vars[0].name(), INSPECTION_ERROR_NAME);
        assert!(vars[0].is_error());
        assert!(vars[0].children().is_empty());
    }

    #[test]
    fn test_children_are_lazy_and_cached() {
        let inspector = Arc::new(TestInspector::default());
        let dyn_inspector: Arc<dyn ValueInspector> = inspector.clone();
        let nested = Value::from(vec![Value::from(vec![Value::from(7_i64)])]);

        let vars = build_variables(&nested, &dyn_inspector);
        assert_eq!(inspector.calls.load(Ordering::SeqCst), 1);
        assert!(!vars[0].is_expanded());

        assert_eq!(vars[0].children().len(), 1);
        assert_eq!(vars[0].children().len(), 1);
        assert_eq!(inspector.calls.load(Ordering::SeqCst), 2);
        assert_eq!(vars[0].child("[0]").map(Variable::display).as_deref(), Some("7"));
    }
}
