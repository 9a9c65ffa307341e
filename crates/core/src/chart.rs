//! Per-chart display option schemas.
//!
//! Each chart type owns an ordered list of option descriptors (the registry)
//! and a typed display record. Loose key/value maps coming from the
//! presentation layer are checked against the descriptors and translated into
//! the typed record in one place, [`ChartDisplayConfig::from_options`].

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::error::{DrilldownError, DrilldownResult};

pub const PALETTE_SIZE: u64 = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChartType {
    Table,
    Bar,
    Line,
    Area,
    Pie,
    Scatter,
    KpiNumber,
    Funnel,
    Sankey,
    Sunburst,
    RetentionHeatmap,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AxisFormat {
    #[default]
    Number,
    Percent,
    Currency,
    Compact,
    Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum OptionKind {
    Boolean,
    String,
    Number { min: f64, max: f64 },
    Select { choices: &'static [&'static str] },
    Color,
    AxisFormat,
    StringArray,
    ButtonGroup { choices: &'static [&'static str] },
    PaletteColor,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DisplayOptionDescriptor {
    pub key: &'static str,
    pub label: &'static str,
    pub kind: OptionKind,
    pub default: Value,
}

impl DisplayOptionDescriptor {
    fn new(key: &'static str, label: &'static str, kind: OptionKind, default: Value) -> Self {
        Self {
            key,
            label,
            kind,
            default,
        }
    }

    /// Checks that `value` fits this option's kind.
    pub fn accepts(&self, value: &Value) -> bool {
        match &self.kind {
            OptionKind::Boolean => value.is_boolean(),
            OptionKind::String => value.is_string(),
            OptionKind::Number { min, max } => value
                .as_f64()
                .is_some_and(|n| n >= *min && n <= *max),
            OptionKind::Select { choices } | OptionKind::ButtonGroup { choices } => value
                .as_str()
                .is_some_and(|s| choices.iter().any(|c| *c == s)),
            OptionKind::Color => value.as_str().is_some_and(is_hex_color),
            OptionKind::AxisFormat => serde_json::from_value::<AxisFormat>(value.clone()).is_ok(),
            OptionKind::StringArray => value
                .as_array()
                .is_some_and(|items| items.iter().all(Value::is_string)),
            OptionKind::PaletteColor => value.as_u64().is_some_and(|i| i < PALETTE_SIZE),
        }
    }
}

fn is_hex_color(s: &str) -> bool {
    s.len() == 7 && s.starts_with('#') && s[1..].chars().all(|c| c.is_ascii_hexdigit())
}

const ORIENTATIONS: &[&str] = &["vertical", "horizontal"];
const NODE_LABELS: &[&str] = &["name", "value", "both"];

/// Ordered option descriptors for `chart`.
pub fn display_options(chart: ChartType) -> Vec<DisplayOptionDescriptor> {
    use OptionKind as K;
    let d = DisplayOptionDescriptor::new;
    match chart {
        ChartType::Table => vec![
            d("pageSize", "Rows per page", K::Number { min: 5.0, max: 500.0 }, json!(50)),
            d("showTotals", "Show totals", K::Boolean, json!(false)),
            d("columnOrder", "Column order", K::StringArray, json!([])),
        ],
        ChartType::Bar | ChartType::Line | ChartType::Area | ChartType::Scatter => vec![
            d("stacked", "Stacked", K::Boolean, json!(false)),
            d("showLegend", "Show legend", K::Boolean, json!(true)),
            d("xAxisFormat", "X axis format", K::AxisFormat, json!("number")),
            d("yAxisFormat", "Y axis format", K::AxisFormat, json!("number")),
            d("orientation", "Orientation", K::ButtonGroup { choices: ORIENTATIONS }, json!("vertical")),
            d("palette", "Palette color", K::PaletteColor, json!(0)),
        ],
        ChartType::Pie => vec![
            d("showLegend", "Show legend", K::Boolean, json!(true)),
            d("innerRadius", "Inner radius", K::Number { min: 0.0, max: 0.9 }, json!(0.0)),
            d("palette", "Palette color", K::PaletteColor, json!(0)),
        ],
        ChartType::KpiNumber => vec![
            d("prefix", "Prefix", K::String, json!("")),
            d("suffix", "Suffix", K::String, json!("")),
            d("format", "Number format", K::AxisFormat, json!("number")),
            d("valueColor", "Value color", K::Color, json!("#111827")),
        ],
        ChartType::Funnel => vec![
            d("showConversion", "Show conversion rates", K::Boolean, json!(true)),
            d("orientation", "Orientation", K::ButtonGroup { choices: ORIENTATIONS }, json!("horizontal")),
            d("palette", "Palette color", K::PaletteColor, json!(0)),
        ],
        ChartType::Sankey | ChartType::Sunburst => vec![
            d("nodeLabel", "Node label", K::Select { choices: NODE_LABELS }, json!("name")),
            d("linkOpacity", "Link opacity", K::Number { min: 0.0, max: 1.0 }, json!(0.5)),
            d("palette", "Palette color", K::PaletteColor, json!(0)),
        ],
        ChartType::RetentionHeatmap => vec![
            d("showCounts", "Show counts", K::Boolean, json!(false)),
            d("rateFormat", "Rate format", K::AxisFormat, json!("percent")),
            d("heatmapColor", "Heatmap color", K::Color, json!("#2563eb")),
        ],
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableDisplay {
    pub page_size: u32,
    pub show_totals: bool,
    pub column_order: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartesianDisplay {
    pub stacked: bool,
    pub show_legend: bool,
    pub x_axis_format: AxisFormat,
    pub y_axis_format: AxisFormat,
    pub orientation: String,
    pub palette: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PieDisplay {
    pub show_legend: bool,
    pub inner_radius: f64,
    pub palette: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KpiDisplay {
    pub prefix: String,
    pub suffix: String,
    pub format: AxisFormat,
    pub value_color: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunnelDisplay {
    pub show_conversion: bool,
    pub orientation: String,
    pub palette: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowDisplay {
    pub node_label: String,
    pub link_opacity: f64,
    pub palette: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionDisplay {
    pub show_counts: bool,
    pub rate_format: AxisFormat,
    pub heatmap_color: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "chart", rename_all = "snake_case")]
pub enum ChartDisplayConfig {
    Table(TableDisplay),
    Cartesian(CartesianDisplay),
    Pie(PieDisplay),
    Kpi(KpiDisplay),
    Funnel(FunnelDisplay),
    Flow(FlowDisplay),
    Retention(RetentionDisplay),
}

impl ChartDisplayConfig {
    /// Translates a loose option map into the chart's typed record.
    /// Missing keys take the descriptor default; unknown keys are dropped;
    /// a value of the wrong kind is an error.
    pub fn from_options(
        chart: ChartType,
        options: &serde_json::Map<String, Value>,
    ) -> DrilldownResult<Self> {
        let descriptors = display_options(chart);
        let mut normalized = serde_json::Map::new();
        for descriptor in &descriptors {
            let value = match options.get(descriptor.key) {
                Some(v) if descriptor.accepts(v) => v.clone(),
                Some(v) => {
                    return Err(DrilldownError::Config(format!(
                        "display option {} rejects {v}",
                        descriptor.key
                    )))
                }
                None => descriptor.default.clone(),
            };
            normalized.insert(descriptor.key.to_string(), value);
        }
        for key in options.keys() {
            if !descriptors.iter().any(|d| d.key == key.as_str()) {
                debug!(?chart, key = %key, "dropping unknown display option");
            }
        }

        let value = Value::Object(normalized);
        Ok(match chart {
            ChartType::Table => Self::Table(serde_json::from_value(value)?),
            ChartType::Bar | ChartType::Line | ChartType::Area | ChartType::Scatter => {
                Self::Cartesian(serde_json::from_value(value)?)
            }
            ChartType::Pie => Self::Pie(serde_json::from_value(value)?),
            ChartType::KpiNumber => Self::Kpi(serde_json::from_value(value)?),
            ChartType::Funnel => Self::Funnel(serde_json::from_value(value)?),
            ChartType::Sankey | ChartType::Sunburst => Self::Flow(serde_json::from_value(value)?),
            ChartType::RetentionHeatmap => Self::Retention(serde_json::from_value(value)?),
        })
    }

    /// Default display for `chart`.
    pub fn defaults(chart: ChartType) -> DrilldownResult<Self> {
        Self::from_options(chart, &serde_json::Map::new())
    }
}
