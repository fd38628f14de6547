//! Row qualification for scans.
//!
//! Qualifiers are passed in conjunctive normal form as a list of clauses.
//! The first clause is a list of terms that must all hold; every later
//! clause is a list of terms of which at least one must hold:
//!
//! ```text
//! (q[0][0] AND q[0][1] ...) AND (q[1][0] OR q[1][1] ...) AND (q[2][0] OR ...)
//! ```

use std::cmp::Ordering;

use arbor_common::Value;

/// Comparison a qualifier applies between a row column and its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    #[inline]
    fn holds(self, ord: Ordering) -> bool {
        match self {
            CompareOp::Eq => ord == Ordering::Equal,
            CompareOp::Lt => ord == Ordering::Less,
            CompareOp::Le => ord != Ordering::Greater,
            CompareOp::Gt => ord == Ordering::Greater,
            CompareOp::Ge => ord != Ordering::Less,
        }
    }
}

/// One term of a qualifier clause: `row[column] <op> value`.
#[derive(Debug, Clone, PartialEq)]
pub struct Qualifier {
    /// Column of the full index row the term reads.
    pub column: usize,
    pub op: CompareOp,
    pub value: Value,
    /// Compare NULLs as values, greater than every non-NULL, instead of
    /// answering `unknown_rv`.
    pub ordered_nulls: bool,
    /// Result when either side is NULL and NULLs are not ordered.
    pub unknown_rv: bool,
    /// Invert the result of the comparison.
    pub negate: bool,
}

impl Qualifier {
    /// A term under SQL NULL semantics: a comparison with NULL is false.
    pub fn new(column: usize, op: CompareOp, value: Value) -> Self {
        Self {
            column,
            op,
            value,
            ordered_nulls: false,
            unknown_rv: false,
            negate: false,
        }
    }

    /// Inverts the term.
    pub fn negated(mut self) -> Self {
        self.negate = !self.negate;
        self
    }

    /// Compares NULLs as the greatest value.
    pub fn with_ordered_nulls(mut self) -> Self {
        self.ordered_nulls = true;
        self
    }

    /// Evaluates the term against a full index row. A column the row does
    /// not have reads as NULL.
    pub fn evaluate(&self, row: &[Value]) -> bool {
        let column = row.get(self.column).unwrap_or(&Value::Null);
        let result = if !self.ordered_nulls && (column.is_null() || self.value.is_null()) {
            self.unknown_rv
        } else {
            self.op.holds(column.compare(&self.value))
        };
        result != self.negate
    }
}

/// True if the row satisfies every clause. No clauses qualify every row.
pub(crate) fn row_qualifies(qualifiers: &[Vec<Qualifier>], row: &[Value]) -> bool {
    let Some((conjuncts, disjunctions)) = qualifiers.split_first() else {
        return true;
    };
    if !conjuncts.iter().all(|q| q.evaluate(row)) {
        return false;
    }
    disjunctions
        .iter()
        .all(|clause| clause.iter().any(|q| q.evaluate(row)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(a: i64, b: Option<&str>) -> Vec<Value> {
        vec![
            Value::Int64(a),
            b.map_or(Value::Null, |s| Value::Varchar(s.to_string())),
        ]
    }

    #[test]
    fn test_compare_ops() {
        let r = row(5, None);
        assert!(Qualifier::new(0, CompareOp::Eq, Value::Int64(5)).evaluate(&r));
        assert!(Qualifier::new(0, CompareOp::Le, Value::Int64(5)).evaluate(&r));
        assert!(Qualifier::new(0, CompareOp::Ge, Value::Int64(5)).evaluate(&r));
        assert!(!Qualifier::new(0, CompareOp::Lt, Value::Int64(5)).evaluate(&r));
        assert!(Qualifier::new(0, CompareOp::Gt, Value::Int64(4)).evaluate(&r));
        assert!(!Qualifier::new(0, CompareOp::Gt, Value::Int64(4))
            .negated()
            .evaluate(&r));
    }

    #[test]
    fn test_null_semantics() {
        let r = row(1, None);
        let eq_null = Qualifier::new(1, CompareOp::Eq, Value::Varchar("x".into()));
        assert!(!eq_null.evaluate(&r));
        // NOT (NULL = 'x') is still unknown, answered by unknown_rv after
        // negation
        assert!(eq_null.clone().negated().evaluate(&r));

        let ordered = Qualifier::new(1, CompareOp::Gt, Value::Varchar("zzz".into())).with_ordered_nulls();
        assert!(ordered.evaluate(&r));

        let mut unknown_true = Qualifier::new(1, CompareOp::Lt, Value::Varchar("a".into()));
        unknown_true.unknown_rv = true;
        assert!(unknown_true.evaluate(&r));
    }

    #[test]
    fn test_conjunctive_normal_form() {
        let r = row(3, Some("b"));
        let ands = vec![
            Qualifier::new(0, CompareOp::Ge, Value::Int64(1)),
            Qualifier::new(0, CompareOp::Le, Value::Int64(10)),
        ];
        let ors = vec![
            Qualifier::new(1, CompareOp::Eq, Value::Varchar("a".into())),
            Qualifier::new(1, CompareOp::Eq, Value::Varchar("b".into())),
        ];
        assert!(row_qualifies(&[], &r));
        assert!(row_qualifies(&[ands.clone()], &r));
        assert!(row_qualifies(&[ands.clone(), ors.clone()], &r));

        let miss = vec![Qualifier::new(1, CompareOp::Eq, Value::Varchar("c".into()))];
        assert!(!row_qualifies(&[ands.clone(), ors, miss], &r));
        assert!(!row_qualifies(
            &[vec![Qualifier::new(0, CompareOp::Gt, Value::Int64(3))]],
            &r
        ));
    }
}
