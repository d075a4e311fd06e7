use chrono::Utc;
use lazy_static::lazy_static;

/// A stable identity for this instance's lifetime, derived from
/// (hostname, process identifier, start time). Never reused after restart:
/// a new process always gets a new PID and a later start timestamp, so a
/// crashed instance's `running` rows are unambiguously recoverable by
/// anyone, including a restarted copy of itself.
pub fn worker_id() -> &'static str {
    lazy_static! {
        static ref ID: String = {
            let hostname = gethostname();
            let pid = std::process::id();
            let started_at = Utc::now().timestamp_millis();
            format!("{hostname}:{pid}:{started_at}")
        };
    }
    &ID
}

fn gethostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown-host".to_string())
}

#[cfg(test)]
mod tests {
    use super::worker_id;

    #[test]
    fn stable_within_process() {
        assert_eq!(worker_id(), worker_id());
    }

    #[test]
    fn contains_pid() {
        let pid = std::process::id().to_string();
        assert!(worker_id().contains(&pid));
    }
}
