//! User and event identifiers.

use chrono::Utc;
use rand::RngCore;

pub const UNKNOWN_USER: &str = "unknown-user";

const USER_ENV_KEYS: &[&str] = &["USER", "USERNAME", "LOGNAME"];

/// Configured id first, then `USER`, `USERNAME`, `LOGNAME`.
pub fn current_user_id(configured: Option<&str>) -> String {
    resolve_user_id(configured, |key| std::env::var(key).ok())
}

fn resolve_user_id(configured: Option<&str>, lookup: impl Fn(&str) -> Option<String>) -> String {
    configured
        .map(str::to_string)
        .into_iter()
        .chain(USER_ENV_KEYS.iter().filter_map(|key| lookup(key)))
        .map(|value| value.trim().to_string())
        .find(|value| !value.is_empty())
        .unwrap_or_else(|| UNKNOWN_USER.to_string())
}

/// `evt-<unix-millis>-<pid>-<random hex>`.
pub fn new_event_id() -> String {
    make_event_id(std::process::id())
}

pub fn make_event_id(pid: u32) -> String {
    let mut random = rand::thread_rng();
    let rand = random.next_u64();
    format!("evt-{}-{}-{:x}", Utc::now().timestamp_millis(), pid, rand)
}
