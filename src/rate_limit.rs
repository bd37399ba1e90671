//! Per-IP request throttling (spec's ambient "No auth beyond IP-level trust"
//! supplement still gets rate limiting). Keyed on the caller's address so one
//! noisy agent or client can't starve the rest.

use axum::http::{Method, Request};
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{clock::DefaultClock, Quota, RateLimiter};
use std::net::IpAddr;
use std::num::NonZeroU32;

pub const GENERAL_REQUESTS_PER_MINUTE: u32 = crate::constants::GENERAL_REQUESTS_PER_MINUTE;
pub const TASK_CREATE_REQUESTS_PER_MINUTE: u32 = crate::constants::TASK_CREATE_REQUESTS_PER_MINUTE;

type KeyedLimiter = RateLimiter<IpAddr, DefaultKeyedStateStore<IpAddr>, DefaultClock>;

pub struct RateLimiters {
    general: KeyedLimiter,
    task_create: KeyedLimiter,
}

impl RateLimiters {
    pub fn new() -> Self {
        Self {
            general: RateLimiter::keyed(Quota::per_minute(
                NonZeroU32::new(GENERAL_REQUESTS_PER_MINUTE).unwrap(),
            )),
            task_create: RateLimiter::keyed(Quota::per_minute(
                NonZeroU32::new(TASK_CREATE_REQUESTS_PER_MINUTE).unwrap(),
            )),
        }
    }

    /// `true` if the request from `ip` is allowed to proceed.
    pub fn check(&self, ip: IpAddr, is_task_create: bool) -> bool {
        let verdict = if is_task_create {
            self.task_create.check_key(&ip)
        } else {
            self.general.check_key(&ip)
        };
        verdict.is_ok()
    }

    pub fn check_request<B>(&self, ip: IpAddr, request: &Request<B>) -> bool {
        let is_task_create = request.uri().path() == "/api/tasks" && request.method() == Method::POST;
        self.check(ip, is_task_create)
    }
}

impl Default for RateLimiters {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_requests_under_quota() {
        let limiters = RateLimiters::new();
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        assert!(limiters.check(ip, false));
    }

    #[test]
    fn eventually_throttles_a_single_ip() {
        let limiters = RateLimiters::new();
        let ip: IpAddr = "127.0.0.2".parse().unwrap();
        let allowed = (0..TASK_CREATE_REQUESTS_PER_MINUTE + 5)
            .filter(|_| limiters.check(ip, true))
            .count();
        assert!(allowed as u32 <= TASK_CREATE_REQUESTS_PER_MINUTE);
    }

    #[test]
    fn tracks_ips_independently() {
        let limiters = RateLimiters::new();
        let a: IpAddr = "10.0.0.1".parse().unwrap();
        let b: IpAddr = "10.0.0.2".parse().unwrap();
        for _ in 0..TASK_CREATE_REQUESTS_PER_MINUTE {
            assert!(limiters.check(a, true));
        }
        assert!(!limiters.check(a, true));
        assert!(limiters.check(b, true));
    }
}
