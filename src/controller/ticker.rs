use chrono::Utc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Time left until the next wall-clock second.
pub fn until_next_second() -> Duration {
    let nanos = Utc::now().timestamp_subsec_nanos().min(999_999_999);
    Duration::from_nanos(u64::from(1_000_000_000 - nanos))
}

/// Sleeps until the next second boundary. Returns `false` when cancelled.
pub async fn wait_next_second(cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(until_next_second()) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_is_at_most_one_second() {
        let d = until_next_second();
        assert!(d > Duration::ZERO);
        assert!(d <= Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_cancelled_token_stops_immediately() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(!wait_next_second(&cancel).await);
    }
}
