mod builder;
mod evaluate;

pub use builder::{ExpressionBuilder, RuleSpec};
pub use evaluate::EvaluationContext;

use std::fmt;

use crate::check::CheckRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Deny,
    /// Not decidable with the information available yet.
    Defer,
}

impl Verdict {
    pub fn and(self, other: Verdict) -> Verdict {
        match (self, other) {
            (Verdict::Deny, _) | (_, Verdict::Deny) => Verdict::Deny,
            (Verdict::Allow, Verdict::Allow) => Verdict::Allow,
            _ => Verdict::Defer,
        }
    }

    pub fn or(self, other: Verdict) -> Verdict {
        match (self, other) {
            (Verdict::Allow, _) | (_, Verdict::Allow) => Verdict::Allow,
            (Verdict::Deny, Verdict::Deny) => Verdict::Deny,
            _ => Verdict::Defer,
        }
    }

    /// DEFER has no negation and passes through.
    pub fn negate(self) -> Verdict {
        match self {
            Verdict::Allow => Verdict::Deny,
            Verdict::Deny => Verdict::Allow,
            Verdict::Defer => Verdict::Defer,
        }
    }
}

impl From<bool> for Verdict {
    fn from(allowed: bool) -> Self {
        if allowed {
            Verdict::Allow
        } else {
            Verdict::Deny
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Allow => f.write_str("ALLOW"),
            Verdict::Deny => f.write_str("DENY"),
            Verdict::Defer => f.write_str("DEFER"),
        }
    }
}

/// Compiled permission rule. Immutable once built and shared between every
/// evaluation of the binding it belongs to.
#[derive(Debug, Clone)]
pub enum Expression {
    Check(CheckRef),
    And(Box<Expression>, Box<Expression>),
    Or(Box<Expression>, Box<Expression>),
    Not(Box<Expression>),
}

impl Expression {
    pub fn check(check: CheckRef) -> Self {
        Expression::Check(check)
    }

    pub fn and(left: Expression, right: Expression) -> Self {
        Expression::And(Box::new(left), Box::new(right))
    }

    pub fn or(left: Expression, right: Expression) -> Self {
        Expression::Or(Box::new(left), Box::new(right))
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(inner: Expression) -> Self {
        Expression::Not(Box::new(inner))
    }

    /// Names of the checks referenced, in evaluation order, without duplicates.
    pub fn check_names(&self) -> Vec<&str> {
        let mut names = Vec::new();
        self.collect_names(&mut names);
        names
    }

    fn collect_names<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expression::Check(check) => {
                if !out.contains(&check.name()) {
                    out.push(check.name());
                }
            }
            Expression::And(left, right) | Expression::Or(left, right) => {
                left.collect_names(out);
                right.collect_names(out);
            }
            Expression::Not(inner) => inner.collect_names(out),
        }
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expression::Check(check) => f.write_str(check.name()),
            Expression::And(left, right) => write!(f, "({left} AND {right})"),
            Expression::Or(left, right) => write!(f, "({left} OR {right})"),
            Expression::Not(inner) => write!(f, "NOT {inner}"),
        }
    }
}
