//! 沙箱资源限制与有界输出缓冲

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// 单个沙箱作业的资源限制
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// 最大 CPU 时间（毫秒），按秒向上取整后设为 RLIMIT_CPU
    pub max_cpu_ms: u64,
    /// 最大常驻内存（字节）
    pub max_memory_bytes: u64,
    /// stdout + stderr 合计最大字节数，超出部分丢弃
    pub max_output_bytes: u64,
    /// 墙钟超时
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_cpu_ms: 10_000,
            max_memory_bytes: 256 * 1024 * 1024,
            max_output_bytes: 1024 * 1024,
            timeout: Duration::from_secs(60),
        }
    }
}

impl ResourceLimits {
    /// 逐项取不超过 max 的值
    pub fn clamp_to(&self, max: &ResourceLimits) -> ResourceLimits {
        ResourceLimits {
            max_cpu_ms: self.max_cpu_ms.min(max.max_cpu_ms),
            max_memory_bytes: self.max_memory_bytes.min(max.max_memory_bytes),
            max_output_bytes: self.max_output_bytes.min(max.max_output_bytes),
            timeout: self.timeout.min(max.timeout),
        }
    }

    /// RLIMIT_CPU 使用秒为单位
    pub fn cpu_secs(&self) -> u64 {
        self.max_cpu_ms.div_ceil(1000).max(1)
    }
}

/// Duration 以毫秒序列化
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

/// stdout 与 stderr 共享的剩余输出额度
#[derive(Debug, Clone)]
pub struct OutputBudget {
    remaining: Arc<AtomicU64>,
}

impl OutputBudget {
    pub fn new(limit: u64) -> Self {
        Self {
            remaining: Arc::new(AtomicU64::new(limit)),
        }
    }

    /// 预留至多 want 字节，返回实际可写入的字节数
    fn reserve(&self, want: u64) -> u64 {
        let mut granted = 0;
        let _ = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| {
                granted = left.min(want);
                Some(left - granted)
            });
        granted
    }
}

/// 有界捕获缓冲：超出共享额度的数据被丢弃并标记截断，写入方仍可继续读取管道
#[derive(Debug)]
pub struct LimitedBuffer {
    buffer: Vec<u8>,
    budget: OutputBudget,
    truncated: bool,
}

impl LimitedBuffer {
    pub fn new(budget: OutputBudget) -> Self {
        Self {
            buffer: Vec::new(),
            budget,
            truncated: false,
        }
    }

    pub fn write(&mut self, data: &[u8]) {
        let granted = self.budget.reserve(data.len() as u64) as usize;
        self.buffer.extend_from_slice(&data[..granted]);
        if granted < data.len() {
            self.truncated = true;
        }
    }

    pub fn was_truncated(&self) -> bool {
        self.truncated
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    pub fn into_string(self) -> String {
        String::from_utf8_lossy(&self.buffer).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limits_serialize_timeout_as_ms() {
        let limits = ResourceLimits {
            timeout: Duration::from_millis(2500),
            ..ResourceLimits::default()
        };
        let json = serde_json::to_string(&limits).unwrap();
        assert!(json.contains("\"timeout\":2500"));
        let back: ResourceLimits = serde_json::from_str(&json).unwrap();
        assert_eq!(back, limits);
    }

    #[test]
    fn test_partial_limits_fill_defaults() {
        let limits: ResourceLimits = serde_json::from_str(r#"{"timeout": 2000}"#).unwrap();
        assert_eq!(limits.timeout, Duration::from_secs(2));
        assert_eq!(limits.max_cpu_ms, ResourceLimits::default().max_cpu_ms);
    }

    #[test]
    fn test_clamp_takes_minimum_per_field() {
        let wanted = ResourceLimits {
            max_cpu_ms: 1_000_000,
            max_memory_bytes: 1,
            max_output_bytes: 10,
            timeout: Duration::from_secs(3600),
        };
        let max = ResourceLimits::default();
        let clamped = wanted.clamp_to(&max);
        assert_eq!(clamped.max_cpu_ms, max.max_cpu_ms);
        assert_eq!(clamped.max_memory_bytes, 1);
        assert_eq!(clamped.timeout, max.timeout);
    }

    #[test]
    fn test_cpu_secs_rounds_up() {
        let mut limits = ResourceLimits::default();
        limits.max_cpu_ms = 1500;
        assert_eq!(limits.cpu_secs(), 2);
        limits.max_cpu_ms = 0;
        assert_eq!(limits.cpu_secs(), 1);
    }

    #[test]
    fn test_shared_budget_across_buffers() {
        let budget = OutputBudget::new(8);
        let mut out = LimitedBuffer::new(budget.clone());
        let mut err = LimitedBuffer::new(budget);

        out.write(b"hello");
        assert!(!out.was_truncated());
        err.write(b"world");
        assert!(err.was_truncated());
        assert_eq!(err.as_bytes(), b"wor");

        out.write(b"!");
        assert!(out.was_truncated());
        assert_eq!(out.as_bytes(), b"hello");
    }
}
