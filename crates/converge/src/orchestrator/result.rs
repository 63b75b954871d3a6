use crate::error::ErrorKind;

/// How a component ended up in this run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Already satisfied; nothing was applied.
    Skipped,
    /// Verified without a marker and recorded as-is.
    Adopted,
    Applied,
    Failed {
        kind: ErrorKind,
        reason: String,
    },
    /// Not attempted because something it depends on failed.
    DependencyFailed {
        dependency: String,
    },
    Disabled,
    /// Dry run: `apply` would have been called.
    WouldApply {
        reason: String,
    },
    Cancelled,
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Skipped => "skipped",
            Outcome::Adopted => "adopted",
            Outcome::Applied => "applied",
            Outcome::Failed { .. } => "failed",
            Outcome::DependencyFailed { .. } => "skipped-due-to-dependency-failure",
            Outcome::Disabled => "disabled",
            Outcome::WouldApply { .. } => "would-apply",
            Outcome::Cancelled => "cancelled",
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Outcome::Failed { .. } | Outcome::DependencyFailed { .. } | Outcome::Cancelled
        )
    }
}

#[derive(Debug, Clone)]
pub struct ComponentReport {
    pub name: String,
    pub outcome: Outcome,
    /// `apply` calls made; 0 when nothing was attempted.
    pub attempts: u32,
    pub required: bool,
    pub elapsed_ms: u128,
}

/// Per-component reports in the order components finished.
#[derive(Debug, Clone, Default)]
pub struct RunResult {
    reports: Vec<ComponentReport>,
}

impl RunResult {
    pub(crate) fn push(&mut self, report: ComponentReport) {
        self.reports.push(report);
    }

    pub fn len(&self) -> usize {
        self.reports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reports.is_empty()
    }

    pub fn reports(&self) -> &[ComponentReport] {
        &self.reports
    }

    pub fn get(&self, name: &str) -> Option<&ComponentReport> {
        self.reports.iter().find(|r| r.name == name)
    }

    pub fn outcome(&self, name: &str) -> Option<&Outcome> {
        self.get(name).map(|r| &r.outcome)
    }

    /// True unless a required component failed, was skipped for a failed
    /// dependency, or was cancelled.
    pub fn success(&self) -> bool {
        !self
            .reports
            .iter()
            .any(|r| r.required && r.outcome.is_failure())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(name: &str, outcome: Outcome, required: bool) -> ComponentReport {
        ComponentReport {
            name: name.into(),
            outcome,
            attempts: 1,
            required,
            elapsed_ms: 0,
        }
    }

    #[test]
    fn success_ignores_optional_failures() {
        let mut r = RunResult::default();
        r.push(report("a", Outcome::Applied, true));
        r.push(report(
            "b",
            Outcome::Failed {
                kind: ErrorKind::Transient,
                reason: "x".into(),
            },
            false,
        ));
        assert!(r.success());
        r.push(report(
            "c",
            Outcome::DependencyFailed {
                dependency: "b".into(),
            },
            true,
        ));
        assert!(!r.success());
        assert_eq!(r.len(), 3);
        assert_eq!(
            r.outcome("c").map(Outcome::label),
            Some("skipped-due-to-dependency-failure")
        );
    }
}
