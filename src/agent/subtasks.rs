//! Built-in subtask implementations the agent runtime knows how to execute
//! (spec §3.1). Each one is a pure function over `(args, kwargs)` plus a
//! fingerprint sample; none of them touch the controller directly.

use crate::agent::sampler::FingerprintSampler;
use crate::error::{CoreError, Result};
use crate::models::SubtaskKind;
use serde_json::Value;

pub fn run(kind: SubtaskKind, sampler: &dyn FingerprintSampler) -> Result<Value> {
    match kind {
        SubtaskKind::GetHostname => {
            let hostname = hostname_fallback();
            Ok(serde_json::json!({ "hostname": hostname }))
        }
        SubtaskKind::GetSystemInfo => {
            let fingerprint = sampler.sample();
            serde_json::to_value(fingerprint).map_err(CoreError::from)
        }
        SubtaskKind::Ping => {
            let fingerprint = sampler.sample();
            Ok(serde_json::json!({ "pong": true, "fingerprint": fingerprint }))
        }
    }
}

fn hostname_fallback() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "unnamed-agent".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::sampler::SysinfoSampler;

    #[test]
    fn ping_carries_a_fresh_fingerprint() {
        let sampler = SysinfoSampler::new();
        let result = run(SubtaskKind::Ping, &sampler).unwrap();
        assert_eq!(result["pong"], Value::Bool(true));
        assert!(result["fingerprint"].is_object());
    }

    #[test]
    fn get_hostname_returns_a_nonempty_string() {
        let sampler = SysinfoSampler::new();
        let result = run(SubtaskKind::GetHostname, &sampler).unwrap();
        assert!(result["hostname"].is_string());
    }
}
