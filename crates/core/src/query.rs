//! Canonical structured-query representation handed to the semantic layer.

use serde::{Deserialize, Serialize};

use crate::filter::FilterNode;
use crate::time::{DateRange, Granularity};

/// One result row keyed by member name.
pub type Row = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeDimension {
    pub dimension: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub granularity: Option<Granularity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_range: Option<DateRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compare_date_range: Option<Vec<DateRange>>,
}

impl TimeDimension {
    pub fn new(dimension: impl Into<String>, granularity: Granularity) -> Self {
        Self {
            dimension: dimension.into(),
            granularity: Some(granularity),
            date_range: None,
            compare_date_range: None,
        }
    }

    /// Column name the semantic layer uses for this member in result rows.
    pub fn result_key(&self) -> String {
        match self.granularity {
            Some(g) => format!("{}.{}", self.dimension, g),
            None => self.dimension.clone(),
        }
    }
}

/// Immutable query value; rebuilt from configuration on every change.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Query {
    #[serde(default)]
    pub measures: Vec<String>,
    #[serde(default)]
    pub dimensions: Vec<String>,
    #[serde(default)]
    pub time_dimensions: Vec<TimeDimension>,
    #[serde(default)]
    pub filters: Vec<FilterNode>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub order: Vec<(String, SortDirection)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

impl Query {
    /// A query is executable when it selects at least one member.
    pub fn is_valid(&self) -> bool {
        self.measures.len() + self.dimensions.len() + self.time_dimensions.len() > 0
    }

    pub fn has_dimension(&self, name: &str) -> bool {
        self.dimensions.iter().any(|d| d == name)
    }

    pub fn has_time_dimension(&self, name: &str) -> bool {
        self.time_dimensions.iter().any(|td| td.dimension == name)
    }

    /// Returns a copy that also selects `name`, unless it already does.
    pub fn with_dimension(mut self, name: &str) -> Self {
        if !self.has_dimension(name) {
            self.dimensions.push(name.to_string());
        }
        self
    }

    /// Returns a copy with `filter` ANDed onto the root filter list.
    pub fn with_filter(mut self, filter: FilterNode) -> Self {
        self.filters.push(filter);
        self
    }

    /// Every member name the query touches, in first-reference order.
    pub fn members(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        let mut push = |m: &str| {
            if !out.iter().any(|x| x == m) {
                out.push(m.to_string());
            }
        };
        self.measures.iter().for_each(|m| push(m));
        self.dimensions.iter().for_each(|d| push(d));
        self.time_dimensions.iter().for_each(|td| push(&td.dimension));
        for node in &self.filters {
            node.visit_simple(&mut |f| push(&f.member));
        }
        out
    }

    /// Cube of the first referenced `Cube.member`.
    pub fn primary_cube(&self) -> Option<String> {
        self.members()
            .iter()
            .find_map(|m| cube_of(m).map(str::to_string))
    }

    /// Every distinct cube referenced by the query.
    pub fn cubes(&self) -> Vec<String> {
        let mut cubes: Vec<String> = Vec::new();
        for member in self.members() {
            if let Some(cube) = cube_of(&member) {
                if !cubes.iter().any(|c| c == cube) {
                    cubes.push(cube.to_string());
                }
            }
        }
        cubes
    }
}

/// `"Orders.count"` → `Some("Orders")`.
pub fn cube_of(member: &str) -> Option<&str> {
    member.split_once('.').map(|(cube, _)| cube).filter(|c| !c.is_empty())
}

/// Cell lookup that tolerates the semantic layer's `member.granularity`
/// column naming for time dimensions.
pub fn cell<'a>(row: &'a Row, member: &str) -> Option<&'a serde_json::Value> {
    row.get(member).or_else(|| {
        row.iter()
            .find(|(k, _)| {
                k.strip_prefix(member)
                    .is_some_and(|rest| rest.starts_with('.') && !rest[1..].contains('.'))
            })
            .map(|(_, v)| v)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{FilterOperator, SimpleFilter};

    #[test]
    fn test_validity() {
        assert!(!Query::default().is_valid());
        let q = Query {
            measures: vec!["Orders.count".into()],
            ..Default::default()
        };
        assert!(q.is_valid());
        let q = Query {
            time_dimensions: vec![TimeDimension::new("Orders.createdAt", Granularity::Day)],
            ..Default::default()
        };
        assert!(q.is_valid());
        // filters alone never make a query executable
        let q = Query {
            filters: vec![FilterNode::Simple(SimpleFilter::new(
                "Orders.status",
                FilterOperator::Equals,
                vec!["paid".into()],
            ))],
            ..Default::default()
        };
        assert!(!q.is_valid());
    }

    #[test]
    fn test_with_dimension_is_idempotent() {
        let q = Query::default()
            .with_dimension("Users.id")
            .with_dimension("Users.id");
        assert_eq!(q.dimensions, vec!["Users.id".to_string()]);
    }

    #[test]
    fn test_cubes_and_primary_cube() {
        let q = Query {
            measures: vec!["Orders.count".into()],
            dimensions: vec!["Users.country".into(), "Orders.status".into()],
            ..Default::default()
        };
        assert_eq!(q.primary_cube().as_deref(), Some("Orders"));
        assert_eq!(q.cubes(), vec!["Orders".to_string(), "Users".to_string()]);
    }

    #[test]
    fn test_serializes_camel_case() {
        let q = Query {
            measures: vec!["Orders.count".into()],
            time_dimensions: vec![TimeDimension::new("Orders.createdAt", Granularity::Month)],
            ..Default::default()
        };
        let json = serde_json::to_value(&q).unwrap();
        assert_eq!(json["timeDimensions"][0]["granularity"], "month");
        assert!(json.get("order").is_none());
    }

    #[test]
    fn test_cell_falls_back_to_granular_key() {
        let row: Row = serde_json::from_str(
            r#"{"Events.ts.day": "2024-01-01T00:00:00.000", "Events.userId": "u1"}"#,
        )
        .unwrap();
        assert_eq!(cell(&row, "Events.userId").unwrap(), "u1");
        assert_eq!(cell(&row, "Events.ts").unwrap(), "2024-01-01T00:00:00.000");
        assert!(cell(&row, "Orders.id").is_none());
    }
}
