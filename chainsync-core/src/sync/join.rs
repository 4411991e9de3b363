//! Left join of aspect records onto primary records.

use std::collections::HashMap;
use std::fmt;

use crate::domain::{Record, RecordSet, Value};

/// Aspect rows dropped because there was no primary row to attach them to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmptyAspectWarning {
    pub aspect: String,
    pub discarded_rows: usize,
}

impl fmt::Display for EmptyAspectWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} row(s) of '{}' discarded: primary aspect returned no rows",
            self.discarded_rows, self.aspect
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JoinOutcome {
    pub records: RecordSet,
    pub warnings: Vec<EmptyAspectWarning>,
}

/// Joins aspect record sets onto a primary record set by a fixed key.
#[derive(Debug, Clone)]
pub struct RecordJoiner {
    key: Vec<String>,
}

impl RecordJoiner {
    pub fn new<I, S>(key: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            key: key.into_iter().map(Into::into).collect(),
        }
    }

    pub fn key(&self) -> &[String] {
        &self.key
    }

    /// Every primary row appears exactly once in the output, in input order.
    ///
    /// Aspect rows are matched on the join key; within one aspect the last
    /// row for a key wins, and across aspects later ones override earlier
    /// ones on shared non-key columns. The output header is the union of all
    /// headers, so unmatched rows read `Null` for aspect columns.
    pub fn join(&self, primary: RecordSet, aspects: Vec<(String, RecordSet)>) -> JoinOutcome {
        let (columns, mut rows) = primary.into_parts();
        let mut header = RecordSet::new(columns);
        let mut warnings = Vec::new();

        let mut indexes = Vec::with_capacity(aspects.len());
        for (name, aspect) in aspects {
            for c in aspect.columns() {
                header.add_column(c.as_str());
            }
            if rows.is_empty() {
                if !aspect.is_empty() {
                    warnings.push(EmptyAspectWarning {
                        aspect: name,
                        discarded_rows: aspect.len(),
                    });
                }
                continue;
            }
            indexes.push(self.index(aspect));
        }

        for row in &mut rows {
            let key = row.key(&self.key);
            for index in &indexes {
                if let Some(matched) = index.get(&key) {
                    for (column, value) in matched.iter() {
                        if !self.key.iter().any(|k| k == column) {
                            row.set(column, value.clone());
                        }
                    }
                }
            }
        }

        let mut records = header;
        for row in rows {
            records.push(row);
        }
        JoinOutcome { records, warnings }
    }

    fn index(&self, aspect: RecordSet) -> HashMap<Vec<Value>, Record> {
        aspect
            .into_rows()
            .into_iter()
            .map(|r| (r.key(&self.key), r))
            .collect()
    }
}
