//! Fingerprint sampling, kept behind a trait so the collection strategy can
//! be swapped without touching the runtime (spec §4.8: "a hot-reloadable
//! collector module is used so the sampler can change without restarting
//! the runtime").

use crate::models::Fingerprint;
use sysinfo::System;

pub trait FingerprintSampler: Send + Sync {
    fn sample(&self) -> Fingerprint;
}

/// Default sampler, backed by `sysinfo`. Refreshes only the subsystems it
/// reports on each call — cheap enough to run on every heartbeat.
pub struct SysinfoSampler {
    system: std::sync::Mutex<System>,
}

impl SysinfoSampler {
    pub fn new() -> Self {
        Self {
            system: std::sync::Mutex::new(System::new_all()),
        }
    }
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl FingerprintSampler for SysinfoSampler {
    fn sample(&self) -> Fingerprint {
        let mut system = self.system.lock().unwrap();
        system.refresh_cpu_usage();
        system.refresh_memory();

        let cpu = serde_json::json!({
            "cores": system.cpus().len(),
            "brand": system.cpus().first().map(|c| c.brand().to_string()),
            "global_usage_percent": system.global_cpu_info().cpu_usage(),
        });
        let memory = serde_json::json!({
            "total_kb": system.total_memory(),
            "used_kb": system.used_memory(),
        });
        let os = serde_json::json!({
            "name": System::name(),
            "kernel_version": System::kernel_version(),
            "os_version": System::os_version(),
            "hostname": System::host_name(),
        });

        Fingerprint {
            cpu: Some(cpu),
            memory: Some(memory),
            gpu: None,
            os: Some(os),
            disk: None,
            summary: Some(serde_json::json!({ "sampled_at": chrono::Utc::now().to_rfc3339() })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sampler_reports_at_least_one_cpu_field() {
        let sampler = SysinfoSampler::new();
        let fp = sampler.sample();
        assert!(fp.cpu.is_some());
        assert!(fp.memory.is_some());
    }
}
