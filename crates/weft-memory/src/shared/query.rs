//! Structured queries over JSON entries.
//!
//! Entries are either an array of row objects or a columnar object mapping
//! each column name to an array of values (all arrays the same length).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;

use crate::error::{MemoryError, MemoryResult};

pub const MAX_TOP_N: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    Asc,
    #[default]
    Desc,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Query {
    /// The `n` rows with the largest (or smallest) `sort_by` values.
    TopN {
        n: usize,
        sort_by: String,
        #[serde(default)]
        direction: SortDirection,
    },
    /// One row per distinct combination of `columns`, with `count` and
    /// `sum_<col>` / `avg_<col>` for every numeric column.
    GroupBy { columns: Vec<String> },
}

impl Query {
    pub fn validate(&self) -> MemoryResult<()> {
        match self {
            Query::TopN { n, sort_by, .. } => {
                if !(1..=MAX_TOP_N).contains(n) {
                    return Err(MemoryError::InvalidQuery(format!(
                        "top_n n must be between 1 and {MAX_TOP_N}, got {n}"
                    )));
                }
                if sort_by.is_empty() {
                    return Err(MemoryError::InvalidQuery(
                        "top_n requires a sort_by column".to_string(),
                    ));
                }
            }
            Query::GroupBy { columns } => {
                if columns.is_empty() {
                    return Err(MemoryError::InvalidQuery(
                        "group_by requires at least one column".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Evaluate against a JSON document.
    pub fn run(&self, data: &Value) -> MemoryResult<Value> {
        self.validate()?;
        let rows = rows_of(data)?;
        match self {
            Query::TopN {
                n,
                sort_by,
                direction,
            } => Ok(Value::Array(top_n(rows, *n, sort_by, *direction))),
            Query::GroupBy { columns } => Ok(Value::Array(group_by(&rows, columns))),
        }
    }
}

fn rows_of(data: &Value) -> MemoryResult<Vec<Map<String, Value>>> {
    match data {
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::Object(row) => Ok(row.clone()),
                other => Err(MemoryError::InvalidQuery(format!(
                    "expected an array of objects, found element {other}"
                ))),
            })
            .collect(),
        Value::Object(columns) => {
            let mut len = None;
            for (name, values) in columns {
                let Value::Array(values) = values else {
                    return Err(MemoryError::InvalidQuery(format!(
                        "column '{name}' is not an array"
                    )));
                };
                match len {
                    None => len = Some(values.len()),
                    Some(l) if l != values.len() => {
                        return Err(MemoryError::InvalidQuery(format!(
                            "column '{name}' has {} values, expected {l}",
                            values.len()
                        )));
                    }
                    Some(_) => {}
                }
            }
            let rows = (0..len.unwrap_or(0))
                .map(|i| {
                    columns
                        .iter()
                        .map(|(name, values)| {
                            (name.clone(), values.get(i).cloned().unwrap_or(Value::Null))
                        })
                        .collect()
                })
                .collect();
            Ok(rows)
        }
        _ => Err(MemoryError::InvalidQuery(
            "query source must be a JSON array or a columnar object".to_string(),
        )),
    }
}

fn compare(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Null) | None, Some(Value::Null) | None) => Ordering::Equal,
        (Some(Value::Null) | None, _) => Ordering::Less,
        (_, Some(Value::Null) | None) => Ordering::Greater,
        (Some(x), Some(y)) => x.to_string().cmp(&y.to_string()),
    }
}

fn top_n(
    mut rows: Vec<Map<String, Value>>,
    n: usize,
    sort_by: &str,
    direction: SortDirection,
) -> Vec<Value> {
    // stable sort keeps input order among equal keys; missing values sort last
    rows.sort_by(|a, b| {
        let (a, b) = (a.get(sort_by), b.get(sort_by));
        let a_missing = matches!(a, None | Some(Value::Null));
        let b_missing = matches!(b, None | Some(Value::Null));
        match (a_missing, b_missing) {
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            _ => match direction {
                SortDirection::Asc => compare(a, b),
                SortDirection::Desc => compare(b, a),
            },
        }
    });
    rows.into_iter().take(n).map(Value::Object).collect()
}

fn group_by(rows: &[Map<String, Value>], columns: &[String]) -> Vec<Value> {
    let numeric: Vec<String> = {
        let mut names: Vec<String> = Vec::new();
        for row in rows {
            for name in row.keys() {
                if !columns.contains(name) && !names.contains(name) {
                    names.push(name.clone());
                }
            }
        }
        names
            .into_iter()
            .filter(|name| {
                let mut present = rows.iter().filter_map(|r| r.get(name)).peekable();
                present.peek().is_some() && present.all(Value::is_number)
            })
            .collect()
    };

    struct Group {
        key: Vec<Value>,
        count: u64,
        sums: Vec<f64>,
        seen: Vec<u64>,
    }

    let mut groups: Vec<Group> = Vec::new();
    for row in rows {
        let key: Vec<Value> = columns
            .iter()
            .map(|c| row.get(c).cloned().unwrap_or(Value::Null))
            .collect();
        let index = match groups.iter().position(|g| g.key == key) {
            Some(i) => i,
            None => {
                groups.push(Group {
                    key,
                    count: 0,
                    sums: vec![0.0; numeric.len()],
                    seen: vec![0; numeric.len()],
                });
                groups.len() - 1
            }
        };
        let group = &mut groups[index];
        group.count += 1;
        for (i, name) in numeric.iter().enumerate() {
            if let Some(v) = row.get(name).and_then(Value::as_f64) {
                group.sums[i] += v;
                group.seen[i] += 1;
            }
        }
    }

    groups
        .into_iter()
        .map(|group| {
            let mut out = Map::new();
            for (column, value) in columns.iter().zip(group.key) {
                out.insert(column.clone(), value);
            }
            out.insert("count".to_string(), Value::from(group.count));
            for (i, name) in numeric.iter().enumerate() {
                let sum = group.sums[i];
                out.insert(format!("sum_{name}"), Value::from(sum));
                if group.seen[i] > 0 {
                    out.insert(
                        format!("avg_{name}"),
                        Value::from(sum / group.seen[i] as f64),
                    );
                }
            }
            Value::Object(out)
        })
        .collect()
}
