//! Host telemetry carried in each heartbeat.
//!
//! Collection is behind a trait so the control loop can be exercised with a
//! fixed or empty provider; the default implementation samples `sysinfo`.
//! A provider must never fail the heartbeat: sections it cannot produce are
//! simply `null`.

use async_trait::async_trait;
use serde_json::Value;
use serde_json::json;
use sysinfo::CpuRefreshKind;
use sysinfo::Disks;
use sysinfo::MemoryRefreshKind;
use sysinfo::RefreshKind;
use sysinfo::System;
use tokio::sync::Mutex;

use crate::protocol::SystemInfo;

#[async_trait]
pub trait TelemetryProvider: Send + Sync {
    async fn collect(&self) -> SystemInfo;
}

/// Provider that reports nothing. Useful in tests and as a stand-in while
/// telemetry is disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTelemetry;

#[async_trait]
impl TelemetryProvider for NullTelemetry {
    async fn collect(&self) -> SystemInfo {
        SystemInfo::default()
    }
}

/// `sysinfo`-backed provider. Keeps one `System` alive across collections so
/// CPU usage deltas are meaningful.
pub struct SysinfoTelemetry {
    system: Mutex<System>,
}

impl SysinfoTelemetry {
    pub fn new() -> Self {
        let mut system = System::new_with_specifics(
            RefreshKind::new()
                .with_cpu(CpuRefreshKind::everything())
                .with_memory(MemoryRefreshKind::everything()),
        );
        system.refresh_cpu_all();
        system.refresh_memory();
        Self {
            system: Mutex::new(system),
        }
    }
}

impl Default for SysinfoTelemetry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TelemetryProvider for SysinfoTelemetry {
    async fn collect(&self) -> SystemInfo {
        let (cpu, memory) = {
            let mut system = self.system.lock().await;
            system.refresh_cpu_usage();
            system.refresh_memory();

            let cpus = system.cpus();
            let usage_percent = if cpus.is_empty() {
                0.0
            } else {
                cpus.iter().map(|cpu| cpu.cpu_usage()).sum::<f32>() / cpus.len() as f32
            };
            let cpu = json!({
                "cores": cpus.len(),
                "brand": cpus.first().map(|cpu| cpu.brand().to_string()),
                "usage_percent": usage_percent,
            });

            let memory = json!({
                "total": system.total_memory(),
                "used": system.used_memory(),
                "free": system.free_memory(),
                "swap_total": system.total_swap(),
                "swap_used": system.used_swap(),
            });
            (cpu, memory)
        };

        let load_avg = System::load_average();
        let load = json!({
            "one": load_avg.one,
            "five": load_avg.five,
            "fifteen": load_avg.fifteen,
        });

        let os = json!({
            "name": System::name(),
            "version": System::os_version(),
            "kernel": System::kernel_version(),
            "hostname": System::host_name(),
            "arch": std::env::consts::ARCH,
        });

        // Disk enumeration touches the filesystem; keep it off the runtime
        // worker.
        let disks = tokio::task::spawn_blocking(collect_disks)
            .await
            .unwrap_or(None);

        SystemInfo {
            os: Some(os),
            cpu: Some(cpu),
            load: Some(load),
            memory: Some(memory),
            disks,
        }
    }
}

fn collect_disks() -> Option<Value> {
    let disks = Disks::new_with_refreshed_list();
    let entries: Vec<Value> = disks
        .iter()
        .map(|disk| {
            json!({
                "name": disk.name().to_string_lossy(),
                "mount_point": disk.mount_point().to_string_lossy(),
                "file_system": disk.file_system().to_string_lossy(),
                "total": disk.total_space(),
                "available": disk.available_space(),
            })
        })
        .collect();
    Some(Value::Array(entries))
}
