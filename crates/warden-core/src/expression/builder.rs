use pest::Parser;
use pest::iterators::Pair;
use pest_derive::Parser;
use serde::{Deserialize, Serialize};

use crate::check::CheckRegistry;
use crate::error::RuleError;

use super::Expression;

#[derive(Parser)]
#[grammar = "expression/grammar.pest"]
struct RuleParser;

/// Declarative form of a permission rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleSpec {
    /// Granted when any named check grants.
    Any(Vec<String>),
    /// Granted when every named check grants.
    All(Vec<String>),
    /// Boolean expression over check names with `AND`, `OR`, `NOT` and
    /// parentheses. `NOT` binds tighter than `AND`, which binds tighter than `OR`.
    Expression(String),
}

pub struct ExpressionBuilder<'a> {
    registry: &'a CheckRegistry,
}

impl<'a> ExpressionBuilder<'a> {
    pub fn new(registry: &'a CheckRegistry) -> Self {
        Self { registry }
    }

    pub fn build(&self, rule: &RuleSpec) -> Result<Expression, RuleError> {
        match rule {
            RuleSpec::Any(names) => self.fold_right(names, Expression::or),
            RuleSpec::All(names) => self.fold_right(names, Expression::and),
            RuleSpec::Expression(text) => self.parse(text),
        }
    }

    fn leaf(&self, name: &str) -> Result<Expression, RuleError> {
        Ok(Expression::check(self.registry.resolve(name)?))
    }

    fn fold_right(
        &self,
        names: &[String],
        combine: fn(Expression, Expression) -> Expression,
    ) -> Result<Expression, RuleError> {
        let (last, rest) = names.split_last().ok_or(RuleError::EmptyCheckList)?;
        let mut expr = self.leaf(last)?;
        for name in rest.iter().rev() {
            expr = combine(self.leaf(name)?, expr);
        }
        Ok(expr)
    }

    fn parse(&self, text: &str) -> Result<Expression, RuleError> {
        let syntax = |message: String| RuleError::Syntax {
            rule: text.to_string(),
            message,
        };

        let root = RuleParser::parse(Rule::expression, text)
            .map_err(|e| syntax(e.to_string()))?
            .next()
            .ok_or_else(|| syntax("empty rule".to_string()))?;
        let or_expr = root
            .into_inner()
            .find(|p| p.as_rule() == Rule::or_expr)
            .ok_or_else(|| syntax("missing expression".to_string()))?;

        self.build_pair(or_expr).map_err(|e| match e {
            RuleError::Syntax { message, .. } => syntax(message),
            other => other,
        })
    }

    fn build_pair(&self, pair: Pair<'_, Rule>) -> Result<Expression, RuleError> {
        match pair.as_rule() {
            Rule::or_expr => self.fold_left(pair, Expression::or),
            Rule::and_expr => self.fold_left(pair, Expression::and),
            Rule::unary => {
                let mut negations = 0;
                let mut operand = None;
                for inner in pair.into_inner() {
                    match inner.as_rule() {
                        Rule::not_op => negations += 1,
                        _ => operand = Some(self.build_pair(inner)?),
                    }
                }
                let mut expr = operand.ok_or_else(|| unexpected("missing operand"))?;
                for _ in 0..negations {
                    expr = Expression::not(expr);
                }
                Ok(expr)
            }
            Rule::check_name => self.leaf(pair.as_str().trim()),
            other => Err(unexpected(&format!("unexpected rule: {other:?}"))),
        }
    }

    fn fold_left(
        &self,
        pair: Pair<'_, Rule>,
        combine: fn(Expression, Expression) -> Expression,
    ) -> Result<Expression, RuleError> {
        let mut operands = pair
            .into_inner()
            .filter(|p| !matches!(p.as_rule(), Rule::and_op | Rule::or_op));
        let first = operands
            .next()
            .ok_or_else(|| unexpected("missing operand"))?;
        let mut expr = self.build_pair(first)?;
        for operand in operands {
            expr = combine(expr, self.build_pair(operand)?);
        }
        Ok(expr)
    }
}

fn unexpected(message: &str) -> RuleError {
    RuleError::Syntax {
        rule: String::new(),
        message: message.to_string(),
    }
}
