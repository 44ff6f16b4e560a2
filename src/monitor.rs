//! Resource usage monitoring
//!
//! Samples CPU, memory, battery and temperature into a bounded history,
//! raises threshold warnings, and summarizes sessions and trends.

use crate::ring::RingBuffer;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use sysinfo::{Components, System};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Samples considered by trend analysis
const TREND_WINDOW: usize = 50;
const TREND_MIN_SAMPLES: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSample {
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: f64,
    pub memory_mb: f64,
    /// None on devices without a battery
    pub battery_percent: Option<f64>,
    pub temperature_c: Option<f64>,
    pub model_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceThresholds {
    pub cpu_warning: f64,
    pub cpu_critical: f64,
    pub memory_warning_mb: f64,
    pub memory_critical_mb: f64,
    pub battery_warning: f64,
    pub temperature_warning_c: f64,
}

impl Default for ResourceThresholds {
    fn default() -> Self {
        Self {
            cpu_warning: 70.0,
            cpu_critical: 90.0,
            memory_warning_mb: 3000.0,
            memory_critical_mb: 4000.0,
            battery_warning: 20.0,
            temperature_warning_c: 45.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceWarning {
    pub severity: Severity,
    pub message: String,
}

impl ResourceThresholds {
    /// Warnings raised by a single sample
    pub fn evaluate(&self, sample: &ResourceSample) -> Vec<ResourceWarning> {
        let mut warnings = Vec::new();
        let mut push =
            |severity, message: String| warnings.push(ResourceWarning { severity, message });

        if sample.cpu_percent >= self.cpu_critical {
            push(Severity::Critical, format!("Critical CPU usage: {:.0}%", sample.cpu_percent));
        } else if sample.cpu_percent >= self.cpu_warning {
            push(Severity::Warning, format!("High CPU usage: {:.0}%", sample.cpu_percent));
        }

        if sample.memory_mb >= self.memory_critical_mb {
            push(Severity::Critical, format!("Critical memory usage: {:.0}MB", sample.memory_mb));
        } else if sample.memory_mb >= self.memory_warning_mb {
            push(Severity::Warning, format!("High memory usage: {:.0}MB", sample.memory_mb));
        }

        if let Some(battery) = sample.battery_percent
            && battery <= self.battery_warning
        {
            push(Severity::Warning, format!("Low battery: {:.0}%", battery));
        }

        if let Some(temperature) = sample.temperature_c
            && temperature >= self.temperature_warning_c
        {
            push(Severity::Warning, format!("High temperature: {:.0}°C", temperature));
        }

        warnings
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Increasing,
    Decreasing,
    Stable,
}

impl fmt::Display for Trend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Increasing => write!(f, "increasing"),
            Self::Decreasing => write!(f, "decreasing"),
            Self::Stable => write!(f, "stable"),
        }
    }
}

/// Compare the mean of the second half against the first
///
/// Moves smaller than 10% of the first-half mean, or 5 units, are stable.
pub fn analyze_trend(values: &[f64]) -> Trend {
    if values.len() < TREND_MIN_SAMPLES {
        return Trend::Stable;
    }

    let (first, second) = values.split_at(values.len() / 2);
    let mean = |xs: &[f64]| xs.iter().sum::<f64>() / xs.len() as f64;
    let (first_avg, second_avg) = (mean(first), mean(second));
    let threshold = (first_avg.abs() * 0.1).max(5.0);

    if second_avg > first_avg + threshold {
        Trend::Increasing
    } else if second_avg < first_avg - threshold {
        Trend::Decreasing
    } else {
        Trend::Stable
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub average_cpu_percent: f64,
    pub peak_cpu_percent: f64,
    pub average_memory_mb: f64,
    pub peak_memory_mb: f64,
    /// Battery percentage points lost over the session
    pub battery_drain: f64,
    pub duration_secs: i64,
    /// 0-100, higher is better
    pub performance_score: u32,
}

impl Default for SessionMetrics {
    fn default() -> Self {
        Self {
            average_cpu_percent: 0.0,
            peak_cpu_percent: 0.0,
            average_memory_mb: 0.0,
            peak_memory_mb: 0.0,
            battery_drain: 0.0,
            duration_secs: 0,
            performance_score: 100,
        }
    }
}

impl SessionMetrics {
    pub fn from_samples(samples: &[ResourceSample]) -> Self {
        let (Some(first), Some(last)) = (samples.first(), samples.last()) else {
            return Self::default();
        };

        let n = samples.len() as f64;
        let average_cpu = samples.iter().map(|s| s.cpu_percent).sum::<f64>() / n;
        let peak_cpu = samples.iter().map(|s| s.cpu_percent).fold(0.0, f64::max);
        let average_memory = samples.iter().map(|s| s.memory_mb).sum::<f64>() / n;
        let peak_memory = samples.iter().map(|s| s.memory_mb).fold(0.0, f64::max);

        let mut batteries = samples.iter().filter_map(|s| s.battery_percent);
        let battery_drain = match (batteries.next(), batteries.next_back()) {
            (Some(start), Some(end)) => start - end,
            _ => 0.0,
        };

        let cpu_score = (100.0 - average_cpu).max(0.0);
        let memory_score = (100.0 - average_memory / 50.0).max(0.0);
        let battery_score = (100.0 - battery_drain * 2.0).max(0.0);
        let performance_score = ((cpu_score + memory_score + battery_score) / 3.0).round() as u32;

        Self {
            average_cpu_percent: average_cpu.round(),
            peak_cpu_percent: peak_cpu,
            average_memory_mb: average_memory.round(),
            peak_memory_mb: peak_memory.round(),
            battery_drain: (battery_drain * 10.0).round() / 10.0,
            duration_secs: (last.timestamp - first.timestamp).num_seconds(),
            performance_score,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceTrends {
    pub cpu: Trend,
    pub memory: Trend,
    /// Increasing means the battery level is rising
    pub battery: Trend,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceReport {
    pub summary: String,
    pub metrics: Option<SessionMetrics>,
    pub recommendations: Vec<String>,
    pub trends: ResourceTrends,
}

#[derive(Debug, Clone)]
struct Session {
    model_id: Option<String>,
    started_at: DateTime<Utc>,
}

/// Source of live usage readings
#[async_trait]
pub trait UsageSampler: Send + Sync {
    async fn sample(&self) -> Result<ResourceSample>;
}

/// Sampler backed by `sysinfo`; battery is not reported
pub struct SystemUsageSampler {
    system: std::sync::Mutex<System>,
}

impl SystemUsageSampler {
    pub fn new() -> Self {
        let mut system = System::new();
        // CPU usage is a delta between refreshes
        system.refresh_cpu_usage();
        Self {
            system: std::sync::Mutex::new(system),
        }
    }
}

impl Default for SystemUsageSampler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UsageSampler for SystemUsageSampler {
    async fn sample(&self) -> Result<ResourceSample> {
        let (cpu_percent, memory_mb) = {
            let mut system = self
                .system
                .lock()
                .map_err(|_| anyhow::anyhow!("System sampler lock poisoned"))?;
            system.refresh_cpu_usage();
            system.refresh_memory();
            (
                system.global_cpu_info().cpu_usage() as f64,
                system.used_memory() as f64 / (1024.0 * 1024.0),
            )
        };

        let components = Components::new_with_refreshed_list();
        let temperature_c = components
            .list()
            .iter()
            .map(|c| c.temperature() as f64)
            .filter(|t| t.is_finite() && *t > 0.0)
            .reduce(f64::max);

        Ok(ResourceSample {
            timestamp: Utc::now(),
            cpu_percent,
            memory_mb,
            battery_percent: None,
            temperature_c,
            model_id: None,
        })
    }
}

/// Bounded usage history with threshold checks and session summaries
pub struct ResourceMonitor {
    history: RwLock<RingBuffer<ResourceSample>>,
    thresholds: RwLock<ResourceThresholds>,
    session: RwLock<Option<Session>>,
}

impl ResourceMonitor {
    pub fn new(history_capacity: usize) -> Self {
        Self {
            history: RwLock::new(RingBuffer::new(history_capacity)),
            thresholds: RwLock::new(ResourceThresholds::default()),
            session: RwLock::new(None),
        }
    }

    pub async fn thresholds(&self) -> ResourceThresholds {
        self.thresholds.read().await.clone()
    }

    pub async fn set_thresholds(&self, thresholds: ResourceThresholds) {
        *self.thresholds.write().await = thresholds;
    }

    /// Start a session, ending any previous one
    pub async fn start_session(&self, model_id: Option<String>) -> Option<SessionMetrics> {
        let previous = self.stop_session().await;
        *self.session.write().await = Some(Session {
            model_id,
            started_at: Utc::now(),
        });
        previous
    }

    /// End the current session and summarize its samples
    pub async fn stop_session(&self) -> Option<SessionMetrics> {
        let session = self.session.write().await.take()?;
        Some(self.metrics_since(session.started_at).await)
    }

    pub async fn is_monitoring(&self) -> bool {
        self.session.read().await.is_some()
    }

    /// Append a sample and return the warnings it raises
    ///
    /// Samples without a model id inherit the active session's model.
    pub async fn record(&self, mut sample: ResourceSample) -> Vec<ResourceWarning> {
        if sample.model_id.is_none()
            && let Some(session) = self.session.read().await.as_ref()
        {
            sample.model_id = session.model_id.clone();
        }

        let warnings = self.thresholds.read().await.evaluate(&sample);
        for warning in &warnings {
            tracing::warn!(severity = ?warning.severity, "{}", warning.message);
        }

        self.history.write().await.push(sample);
        warnings
    }

    pub async fn current(&self) -> Option<ResourceSample> {
        self.history.read().await.latest().cloned()
    }

    /// The newest `limit` samples (all when None), oldest first
    pub async fn history(&self, limit: Option<usize>) -> Vec<ResourceSample> {
        let history = self.history.read().await;
        history
            .last_n(limit.unwrap_or(history.len()))
            .cloned()
            .collect()
    }

    pub async fn history_for_model(
        &self,
        model_id: &str,
        limit: Option<usize>,
    ) -> Vec<ResourceSample> {
        let matching: Vec<ResourceSample> = self
            .history
            .read()
            .await
            .iter()
            .filter(|s| s.model_id.as_deref() == Some(model_id))
            .cloned()
            .collect();
        let skip = limit.map_or(0, |l| matching.len().saturating_sub(l));
        matching.into_iter().skip(skip).collect()
    }

    pub async fn clear(&self) {
        self.history.write().await.clear();
    }

    async fn metrics_since(&self, since: DateTime<Utc>) -> SessionMetrics {
        let samples: Vec<ResourceSample> = self
            .history
            .read()
            .await
            .iter()
            .filter(|s| s.timestamp >= since)
            .cloned()
            .collect();
        SessionMetrics::from_samples(&samples)
    }

    pub async fn trends(&self) -> ResourceTrends {
        let recent = self.history(Some(TREND_WINDOW)).await;
        let cpu: Vec<f64> = recent.iter().map(|s| s.cpu_percent).collect();
        let memory: Vec<f64> = recent.iter().map(|s| s.memory_mb).collect();
        let battery: Vec<f64> = recent.iter().filter_map(|s| s.battery_percent).collect();

        ResourceTrends {
            cpu: analyze_trend(&cpu),
            memory: analyze_trend(&memory),
            battery: analyze_trend(&battery),
        }
    }

    /// Advice based on the latest sample
    pub async fn recommendations(&self) -> Vec<String> {
        let Some(current) = self.current().await else {
            return vec!["Start monitoring to get resource recommendations".to_string()];
        };

        let mut recommendations = Vec::new();
        if current.cpu_percent > 80.0 {
            recommendations.push(
                "High CPU usage detected. Consider using a smaller model or closing other apps."
                    .to_string(),
            );
        }
        if current.memory_mb > 3000.0 {
            recommendations.push(
                "High memory usage detected. Consider freeing up memory or using a more heavily quantized model."
                    .to_string(),
            );
        }
        if current.battery_percent.is_some_and(|b| b < 30.0)
            && matches!(self.trends().await.battery, Trend::Decreasing)
        {
            recommendations.push(
                "High battery drain detected. Consider reducing model inference frequency."
                    .to_string(),
            );
        }
        if current.temperature_c.is_some_and(|t| t > 40.0) {
            recommendations.push(
                "Device temperature is high. Consider taking a break or reducing workload."
                    .to_string(),
            );
        }

        if recommendations.is_empty() {
            recommendations
                .push("Resource usage is optimal. Continue current operation.".to_string());
        }
        recommendations
    }

    pub async fn report(&self) -> PerformanceReport {
        let started_at = self.session.read().await.as_ref().map(|s| s.started_at);
        let metrics = match started_at {
            Some(since) => Some(self.metrics_since(since).await),
            None => None,
        };

        let summary = match &metrics {
            Some(m) => format!(
                "Performance score: {}/100. Average CPU: {}%, memory: {}MB, battery drain: {}%",
                m.performance_score, m.average_cpu_percent, m.average_memory_mb, m.battery_drain
            ),
            None => "No monitoring data available".to_string(),
        };

        PerformanceReport {
            summary,
            metrics,
            recommendations: self.recommendations().await,
            trends: self.trends().await,
        }
    }

    /// Sample every `interval` until `cancel` fires
    ///
    /// Sampler errors are logged and the loop keeps going.
    pub async fn run(
        &self,
        sampler: &dyn UsageSampler,
        interval: Duration,
        cancel: &CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        tracing::info!(interval_ms = interval.as_millis() as u64, "Resource monitor started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match sampler.sample().await {
                Ok(sample) => {
                    tracing::debug!(
                        cpu = sample.cpu_percent,
                        memory_mb = sample.memory_mb,
                        "Captured resource sample"
                    );
                    self.record(sample).await;
                }
                Err(e) => tracing::warn!(error = %e, "Failed to capture resource sample"),
            }
        }
        tracing::info!("Resource monitor stopped");
    }
}
