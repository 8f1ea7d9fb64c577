//! Stack frames captured while a job is suspended

use crate::value::{Member, Value, ValueInspector, Variable};
use std::fmt;
use std::sync::Arc;

/// Label used for frames of code without a resource identity
pub const DYNAMIC_FRAME_NAME: &str = "<dynamic>";

/// One level of the script call stack at a suspension point
///
/// Frames are immutable snapshots. Their variables hold a weak
/// back-reference to the frame so the two can be created together.
pub struct StackFrame {
    index: usize,
    resource: Option<String>,
    line: usize,
    variables: Vec<Variable>,
}

impl StackFrame {
    /// Capture a frame with the given scope entries
    ///
    /// `index` 0 is the innermost frame.
    pub fn capture(
        index: usize,
        resource: Option<String>,
        line: usize,
        scope: Vec<(String, Value)>,
        inspector: &Arc<dyn ValueInspector>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            index,
            resource,
            line,
            variables: scope
                .into_iter()
                .map(|(name, value)| {
                    Variable::new(Member::new(name, value), Arc::clone(inspector), weak.clone())
                })
                .collect(),
        })
    }

    /// Position in the stack, 0 being innermost
    pub fn index(&self) -> usize {
        self.index
    }

    /// Resource identity of the code this frame runs
    pub fn resource(&self) -> Option<&str> {
        self.resource.as_deref()
    }

    /// Current line (1-based)
    pub fn line(&self) -> usize {
        self.line
    }

    /// Display name, `resource:line`
    pub fn name(&self) -> String {
        format!(
            "{}:{}",
            self.resource.as_deref().unwrap_or(DYNAMIC_FRAME_NAME),
            self.line
        )
    }

    /// Variables visible in this frame
    pub fn variables(&self) -> &[Variable] {
        &self.variables
    }

    /// Look up a variable by name
    pub fn variable(&self, name: &str) -> Option<&Variable> {
        self.variables.iter().find(|v| v.name() == name)
    }
}

impl fmt::Debug for StackFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StackFrame")
            .field("index", &self.index)
            .field("name", &self.name())
            .field("variables", &self.variables.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;

    #[derive(Debug)]
    struct Flat;

    impl ValueInspector for Flat {
        fn enumerate_members(&self, _value: &Value) -> Result<Vec<Member>> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_variables_point_back_to_frame() {
        let inspector: Arc<dyn ValueInspector> = Arc::new(Flat);
        let frame = StackFrame::capture(
            0,
            Some("main.rhai".to_string()),
            3,
            vec![("a".to_string(), Value::from(1_i64))],
            &inspector,
        );

        assert_eq!(frame.name(), "main.rhai:3");
        let var = frame.variable("a").unwrap();
        assert!(Arc::ptr_eq(&var.frame().unwrap(), &frame));
    }

    #[test]
    fn test_back_reference_is_weak() {
        let inspector: Arc<dyn ValueInspector> = Arc::new(Flat);
        let frame = StackFrame::capture(1, None, 1, vec![("x".into(), Value::UNIT)], &inspector);
        let var = frame.variables()[0].clone();

        assert_eq!(frame.name(), "<dynamic>:1");
        drop(frame);
        assert!(var.frame().is_none());
    }
}
