//! Tools the direct model may call mid-turn.

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub const WEATHER_UNAVAILABLE: &str = "Weather service unavailable";
pub const UNKNOWN_TOOL: &str = "Unknown tool";

/// A tool advertised to the model. Tools never fail: errors become text the
/// model can read aloud.
#[async_trait]
pub trait PhoneTool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON schema of the tool input
    fn input_schema(&self) -> serde_json::Value;

    async fn execute(&self, input: &serde_json::Value) -> String;
}

/// Tool definition as sent to the inference provider.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// Local wall clock at a fixed UTC offset.
#[derive(Debug, Clone)]
pub struct ClockTool {
    offset: FixedOffset,
    description: String,
}

impl ClockTool {
    pub fn new(offset: FixedOffset, description: impl Into<String>) -> Self {
        Self {
            offset,
            description: description.into(),
        }
    }

    /// Long spoken form, e.g. "Tuesday, May 7, 2024, 3:05 PM".
    pub fn format(&self, at: DateTime<Utc>) -> String {
        at.with_timezone(&self.offset)
            .format("%A, %B %-d, %Y, %-I:%M %p")
            .to_string()
    }
}

#[async_trait]
impl PhoneTool for ClockTool {
    fn name(&self) -> &str {
        "get_time"
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({ "type": "object", "properties": {}, "required": [] })
    }

    async fn execute(&self, _input: &serde_json::Value) -> String {
        self.format(Utc::now())
    }
}

/// Current conditions from a wttr.in style one-line endpoint.
#[derive(Debug, Clone)]
pub struct WeatherTool {
    client: reqwest::Client,
    base_url: String,
    default_location: String,
}

impl WeatherTool {
    pub fn new(base_url: impl Into<String>, default_location: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.into(),
            default_location: default_location.into(),
        }
    }

    async fn lookup(&self, location: &str) -> Option<String> {
        let mut url = reqwest::Url::parse(&self.base_url).ok()?;
        url.path_segments_mut().ok()?.pop_if_empty().push(location);
        url.set_query(Some("format=%C+%t+%h"));

        let res = self.client.get(url).send().await.ok()?;
        if !res.status().is_success() {
            return None;
        }
        let body = res.text().await.ok()?;
        let body = body.trim();
        (!body.is_empty()).then(|| body.to_string())
    }
}

#[async_trait]
impl PhoneTool for WeatherTool {
    fn name(&self) -> &str {
        "get_weather"
    }

    fn description(&self) -> &str {
        "Get current weather for a location"
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "location": {
                    "type": "string",
                    "description": format!("City name (default: {})", self.default_location)
                }
            },
            "required": []
        })
    }

    async fn execute(&self, input: &serde_json::Value) -> String {
        let location = input
            .get("location")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(&self.default_location);
        match self.lookup(location).await {
            Some(report) => report,
            None => {
                warn!("🌦️ Weather lookup failed for {}", location);
                WEATHER_UNAVAILABLE.to_string()
            }
        }
    }
}

/// Registry of tools offered to the model.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn PhoneTool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: Vec::new() }
    }

    /// Clock and weather, the two tools a phone line needs.
    pub fn phone_defaults(
        offset: FixedOffset,
        zone_label: &str,
        weather_url: &str,
        weather_location: &str,
    ) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ClockTool::new(
            offset,
            format!("Get current date and time in {}", zone_label),
        )));
        registry.register(Arc::new(WeatherTool::new(weather_url, weather_location)));
        registry
    }

    pub fn register(&mut self, tool: Arc<dyn PhoneTool>) {
        self.tools.push(tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn PhoneTool>> {
        self.tools.iter().find(|t| t.name() == name).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tools
            .iter()
            .map(|t| ToolSpec {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.input_schema(),
            })
            .collect()
    }

    /// Run a tool by name; unknown names answer with [`UNKNOWN_TOOL`].
    pub async fn execute(&self, name: &str, input: &serde_json::Value) -> String {
        info!("🔧 Tool {} {}", name, input);
        match self.get(name) {
            Some(tool) => tool.execute(input).await,
            None => UNKNOWN_TOOL.to_string(),
        }
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.tools.iter().map(|t| t.name()))
            .finish()
    }
}
