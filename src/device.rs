//! Static device facts
//!
//! Facts are gathered once per benchmark: memory, cores, storage, OS, and
//! the identifiers (CPU brand, device name, GPU names) that accelerator
//! heuristics work from.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Command;
use sysinfo::{Disks, System};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceFacts {
    pub device_name: String,
    pub os_version: String,
    pub total_memory_mb: u64,
    pub available_memory_mb: u64,
    pub cpu_cores: usize,
    pub cpu_brand: String,
    pub cpu_frequency_mhz: u64,
    pub storage_total_bytes: u64,
    pub storage_available_bytes: u64,
    /// GPU names reported by the driver, if any
    #[serde(default)]
    pub gpu_names: Vec<String>,
}

impl DeviceFacts {
    /// Lowercased identifiers used for accelerator detection
    pub fn identifiers(&self) -> Vec<String> {
        let mut identifiers = vec![self.cpu_brand.to_lowercase(), self.device_name.to_lowercase()];
        identifiers.extend(self.gpu_names.iter().map(|n| n.to_lowercase()));
        identifiers.retain(|s| !s.is_empty());
        identifiers
    }
}

impl Default for DeviceFacts {
    /// Conservative facts for an unknown handheld device
    fn default() -> Self {
        Self {
            device_name: "Unknown device".to_string(),
            os_version: "unknown".to_string(),
            total_memory_mb: 4000,
            available_memory_mb: 2000,
            cpu_cores: 4,
            cpu_brand: String::new(),
            cpu_frequency_mhz: 2000,
            storage_total_bytes: 32 * 1024 * 1024 * 1024,
            storage_available_bytes: 16 * 1024 * 1024 * 1024,
            gpu_names: Vec::new(),
        }
    }
}

/// Source of static hardware facts
#[async_trait]
pub trait DeviceProbe: Send + Sync {
    async fn facts(&self) -> Result<DeviceFacts>;
}

/// Probe backed by `sysinfo` and, when present, `nvidia-smi`
pub struct SystemDeviceProbe {
    /// Storage figures are taken from the disk holding this path
    storage_path: PathBuf,
}

impl SystemDeviceProbe {
    pub fn new(storage_path: impl Into<PathBuf>) -> Self {
        Self {
            storage_path: storage_path.into(),
        }
    }
}

#[async_trait]
impl DeviceProbe for SystemDeviceProbe {
    async fn facts(&self) -> Result<DeviceFacts> {
        let storage_path = self.storage_path.clone();
        tokio::task::spawn_blocking(move || probe_system(&storage_path))
            .await
            .context("Device probe task failed")?
    }
}

fn probe_system(storage_path: &std::path::Path) -> Result<DeviceFacts> {
    let mut sys = System::new_all();
    sys.refresh_cpu();

    let cpus = sys.cpus();
    let first_cpu = cpus.first();
    if cpus.is_empty() {
        anyhow::bail!("No CPUs reported by the system");
    }

    let disks = Disks::new_with_refreshed_list();
    let disk = disks
        .list()
        .iter()
        .filter(|d| storage_path.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len());

    let device_name = match (System::host_name(), System::name()) {
        (Some(host), Some(os)) => format!("{} ({})", host, os),
        (Some(host), None) => host,
        (None, Some(os)) => os,
        (None, None) => "Unknown device".to_string(),
    };

    let facts = DeviceFacts {
        device_name,
        os_version: System::long_os_version()
            .or_else(System::os_version)
            .unwrap_or_else(|| "unknown".to_string()),
        total_memory_mb: sys.total_memory() / (1024 * 1024),
        available_memory_mb: sys.available_memory() / (1024 * 1024),
        cpu_cores: cpus.len(),
        cpu_brand: first_cpu.map(|c| c.brand().trim().to_string()).unwrap_or_default(),
        cpu_frequency_mhz: first_cpu.map(|c| c.frequency()).unwrap_or_default(),
        storage_total_bytes: disk.map(|d| d.total_space()).unwrap_or_default(),
        storage_available_bytes: disk.map(|d| d.available_space()).unwrap_or_default(),
        gpu_names: detect_gpu_names(),
    };

    tracing::info!(
        cores = facts.cpu_cores,
        memory_mb = facts.total_memory_mb,
        cpu = %facts.cpu_brand,
        gpus = ?facts.gpu_names,
        "Probed device facts"
    );
    Ok(facts)
}

/// GPU names from nvidia-smi; empty when the tool is absent or fails
pub fn detect_gpu_names() -> Vec<String> {
    let output = Command::new("nvidia-smi")
        .args(["--query-gpu=name", "--format=csv,noheader"])
        .output();

    match output {
        Ok(output) if output.status.success() => String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect(),
        Ok(output) => {
            tracing::debug!(
                stderr = %String::from_utf8_lossy(&output.stderr),
                "nvidia-smi failed, assuming no discrete GPU"
            );
            Vec::new()
        }
        Err(e) => {
            tracing::debug!(error = %e, "nvidia-smi not available, assuming no discrete GPU");
            Vec::new()
        }
    }
}

/// Probe returning fixed facts
#[derive(Debug, Clone, Default)]
pub struct StaticDeviceProbe {
    facts: DeviceFacts,
}

impl StaticDeviceProbe {
    pub fn new(facts: DeviceFacts) -> Self {
        Self { facts }
    }
}

#[async_trait]
impl DeviceProbe for StaticDeviceProbe {
    async fn facts(&self) -> Result<DeviceFacts> {
        Ok(self.facts.clone())
    }
}
