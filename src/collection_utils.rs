//! Small, allocation-light helpers over parsed router rows: index, group,
//! paginate, sort. Deliberately free functions — the fluent query-builder
//! DSL these feed into is an external collaborator (§1, out of scope).

use std::collections::HashMap;

use serde_json::Value;

use crate::parser::RouterRow;

/// Index rows by the string value of `key`, dropping rows where the field
/// is absent or not a string/number.
pub fn index_by<'a>(rows: &'a [RouterRow], key: &str) -> HashMap<String, &'a RouterRow> {
    rows.iter()
        .filter_map(|row| field_as_key(row, key).map(|k| (k, row)))
        .collect()
}

/// Group rows by the string value of `key`. Rows missing the field are
/// dropped, matching [`index_by`].
pub fn group_by<'a>(rows: &'a [RouterRow], key: &str) -> HashMap<String, Vec<&'a RouterRow>> {
    let mut groups: HashMap<String, Vec<&'a RouterRow>> = HashMap::new();
    for row in rows {
        if let Some(k) = field_as_key(row, key) {
            groups.entry(k).or_default().push(row);
        }
    }
    groups
}

/// Return the `limit`-sized slice of `rows` starting at `offset`, clamped
/// to the collection bounds.
pub fn paginate(rows: &[RouterRow], offset: usize, limit: usize) -> &[RouterRow] {
    if offset >= rows.len() {
        return &[];
    }
    let end = (offset + limit).min(rows.len());
    &rows[offset..end]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

/// Sort `rows` by `key` in place. Numeric fields compare numerically;
/// everything else (including mixed-type fields) falls back to string
/// comparison of the field's JSON representation.
pub fn sort_by_field(rows: &mut [RouterRow], key: &str, direction: SortDirection) {
    rows.sort_by(|a, b| {
        let ordering = match (a.get(key), b.get(key)) {
            (Some(Value::Number(x)), Some(Value::Number(y))) => x
                .as_f64()
                .partial_cmp(&y.as_f64())
                .unwrap_or(std::cmp::Ordering::Equal),
            (a, b) => field_sort_string(a).cmp(&field_sort_string(b)),
        };
        match direction {
            SortDirection::Ascending => ordering,
            SortDirection::Descending => ordering.reverse(),
        }
    });
}

fn field_sort_string(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

pub(crate) fn field_as_key(row: &RouterRow, key: &str) -> Option<String> {
    match row.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rows() -> Vec<RouterRow> {
        vec![
            json!({"id": "*1", "name": "ether1", "mtu": 1500}).as_object().unwrap().clone(),
            json!({"id": "*2", "name": "ether2", "mtu": 1400}).as_object().unwrap().clone(),
            json!({"id": "*3", "name": "ether1", "mtu": 9000}).as_object().unwrap().clone(),
        ]
    }

    #[test]
    fn index_by_keys_on_the_given_field() {
        let rows = rows();
        let idx = index_by(&rows, "id");
        assert_eq!(idx.len(), 3);
        assert_eq!(idx["*2"].get("name").unwrap(), "ether2");
    }

    #[test]
    fn group_by_buckets_rows_sharing_a_field_value() {
        let rows = rows();
        let groups = group_by(&rows, "name");
        assert_eq!(groups["ether1"].len(), 2);
        assert_eq!(groups["ether2"].len(), 1);
    }

    #[test]
    fn paginate_clamps_to_bounds() {
        let rows = rows();
        assert_eq!(paginate(&rows, 1, 10).len(), 2);
        assert_eq!(paginate(&rows, 10, 10).len(), 0);
    }

    #[test]
    fn sort_by_field_orders_numerically() {
        let mut rows = rows();
        sort_by_field(&mut rows, "mtu", SortDirection::Ascending);
        let mtus: Vec<i64> = rows.iter().map(|r| r["mtu"].as_i64().unwrap()).collect();
        assert_eq!(mtus, vec![1400, 1500, 9000]);
    }

    #[test]
    fn sort_by_field_descending_reverses_order() {
        let mut rows = rows();
        sort_by_field(&mut rows, "mtu", SortDirection::Descending);
        let mtus: Vec<i64> = rows.iter().map(|r| r["mtu"].as_i64().unwrap()).collect();
        assert_eq!(mtus, vec![9000, 1500, 1400]);
    }
}
