/// Source of "now", in seconds since the epoch
pub trait Clock: Send + Sync {
    fn now_seconds(&self) -> i64;
}

#[derive(Debug, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_seconds(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }
}
